//! Memory-mapped files: mmap and munmap.
//!
//! A mapping group is the run of contiguous pages created by one mmap
//! call; every page in it carries the group's page count so munmap knows
//! how far to unwind. Content is read lazily on fault exactly like ELF
//! segment pages, and dirty pages are written back to the file when the
//! mapping is torn down or the page is evicted.

use super::{AsId, LoadDescriptor, PageFlags, PageInit, Vm};
use crate::config::{PAGE_SIZE, USER_TOP};
use crate::error::VmError;
use crate::fs::VmFile;
use crate::mm::{VirtAddr, VirtPageNum};
use alloc::sync::Arc;

impl Vm {
    /// Map `len` bytes of `file` starting at `offset` into space `id` at
    /// `addr`. The file is reopened so the mapping holds an independent
    /// handle; pages past the end of the file read as zeros.
    pub fn mmap(
        &mut self,
        id: AsId,
        addr: VirtAddr,
        len: usize,
        writable: bool,
        file: &Arc<dyn VmFile>,
        offset: usize,
    ) -> Result<VirtAddr, VmError> {
        if !addr.aligned() || addr.0 == 0 {
            return Err(VmError::Validation("mmap address must be page-aligned and non-null"));
        }
        if len == 0 {
            return Err(VmError::Validation("empty mapping"));
        }
        // The length is caller-supplied; all of the span arithmetic has
        // to be checked.
        let pages = len
            .checked_add(PAGE_SIZE - 1)
            .ok_or(VmError::Validation("mapping length overflows"))?
            / PAGE_SIZE;
        let span = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(VmError::Validation("mapping length overflows"))?;
        let end = addr
            .0
            .checked_add(span)
            .ok_or(VmError::Validation("mapping wraps around"))?;
        if end > USER_TOP {
            return Err(VmError::Validation("mapping outside user range"));
        }
        {
            let space = self.space(id).ok_or(VmError::IllegalAccess)?;
            for i in 0..pages {
                if space.find_page(VirtPageNum(addr.floor().0 + i)).is_some() {
                    return Err(VmError::Validation("overlaps an existing mapping"));
                }
            }
        }

        let reopened = file.reopen();
        let mut remaining = reopened.len().saturating_sub(offset);
        let mut ofs = offset;
        let flags = if writable {
            PageFlags::WRITABLE
        } else {
            PageFlags::empty()
        };
        for i in 0..pages {
            let read_bytes = remaining.min(PAGE_SIZE);
            let desc = LoadDescriptor {
                file: reopened.clone(),
                offset: ofs,
                read_bytes,
                zero_bytes: PAGE_SIZE - read_bytes,
                pages,
            };
            self.alloc_page(
                id,
                VirtAddr(addr.0 + i * PAGE_SIZE),
                flags,
                PageInit::FileMap(desc),
            )?;
            remaining -= read_bytes;
            ofs += read_bytes;
        }
        log::trace!("mmap {} pages at {:?} in {:?}", pages, addr, id);
        Ok(addr)
    }

    /// Unwind the whole mapping group whose base address is `addr`:
    /// write back dirty pages, clear their mappings and release them.
    /// The group's file handle closes once the last page drops it.
    pub fn munmap(&mut self, id: AsId, addr: VirtAddr) -> Result<(), VmError> {
        if !addr.aligned() {
            return Err(VmError::Validation("unaligned munmap address"));
        }
        let base = addr.floor();
        let count = {
            let space = self.space(id).ok_or(VmError::IllegalAccess)?;
            let page = space
                .find_page(base)
                .ok_or(VmError::Validation("no mapping at address"))?;
            let desc = page
                .file_desc()
                .ok_or(VmError::Validation("not a file mapping"))?;
            if desc.pages == 0 {
                return Err(VmError::Validation("page is not part of a mapping group"));
            }
            desc.pages
        };
        let mut result = Ok(());
        for i in 0..count {
            let vpn = VirtPageNum(base.0 + i);
            // Keep unwinding even if one page's writeback fails; the
            // first error is reported.
            if let Err(e) = self.unmap_one(id, vpn) {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    fn unmap_one(&mut self, id: AsId, vpn: VirtPageNum) -> Result<(), VmError> {
        let Vm {
            frames,
            swap,
            spaces,
            pool,
            ..
        } = self;
        let space = spaces.get_mut(&id).ok_or(VmError::IllegalAccess)?;
        let Some(mut page) = space.remove_page(vpn) else {
            // The group may have holes if pages were removed singly.
            return Ok(());
        };
        let mut result = Ok(());
        if let Some(idx) = page.take_frame() {
            let dirty = space.page_map().is_dirty(vpn);
            space.page_map_mut().unmap(vpn);
            let ppn = frames.ppn(idx);
            result = page.evacuate(ppn.bytes_array(), dirty, swap);
            frames.unbind(idx);
            pool.release(ppn);
        }
        page.release(swap);
        result
    }
}
