//! Page objects: the per-virtual-page descriptors of the supplemental
//! page table.
//!
//! A page starts `Uninit` carrying a deferred initializer and becomes
//! `Anon` or `FileBacked` on first fault; the discriminant never moves
//! backward or sideways. Each materialized variant implements the
//! {swap_in, swap_out, destroy} capability set the fault resolver and the
//! eviction path dispatch on.

use super::swap::SwapTable;
use crate::error::VmError;
use crate::fs::VmFile;
use crate::mm::VirtPageNum;
use alloc::sync::Arc;

bitflags! {
    /// Hardware-independent per-page attribute bits.
    pub struct PageFlags: u8 {
        /// User stores through this page are allowed.
        const WRITABLE = 1 << 0;
        /// The page belongs to the user stack region.
        const STACK = 1 << 1;
    }
}

/// File, offset and byte-split context for a deferred page load. Owned by
/// the page until its initializer runs.
#[derive(Clone)]
pub struct LoadDescriptor {
    /// Source file handle.
    pub file: Arc<dyn VmFile>,
    /// Where in the file this page's content starts.
    pub offset: usize,
    /// Bytes to read from the file.
    pub read_bytes: usize,
    /// Bytes to zero-fill after the read portion.
    pub zero_bytes: usize,
    /// Number of contiguous pages created by the same mmap call, so
    /// munmap knows how many to unwind. Zero for ELF segment pages.
    pub pages: usize,
}

/// What an uninitialized page turns into on first fault.
#[derive(Clone)]
pub enum PageInit {
    /// A zero-filled anonymous page.
    Zero,
    /// An ELF segment page: filled from the file once, swap-backed from
    /// then on.
    Segment(LoadDescriptor),
    /// An mmap page: the file remains the backing store for its lifetime.
    FileMap(LoadDescriptor),
}

/// Deferred-initializer state of a page that has never faulted.
pub struct UninitPage {
    /// The pending initializer; released when the page materializes.
    pub init: PageInit,
}

/// An anonymous page, backed by a swap slot once evicted.
pub struct AnonPage {
    slot: Option<usize>,
}

impl AnonPage {
    fn new() -> Self {
        Self { slot: None }
    }

    /// The swap slot holding this page's content while evicted.
    pub(crate) fn slot(&self) -> Option<usize> {
        self.slot
    }
}

/// A memory-mapped file page; the file is the backing store.
pub struct FilePage {
    desc: LoadDescriptor,
}

impl FilePage {
    /// The mapping-group descriptor this page carries.
    pub fn desc(&self) -> &LoadDescriptor {
        &self.desc
    }
}

/// The capability set every materialized variant implements.
pub trait PageOps {
    /// Populate `kva` with this page's content.
    fn swap_in(&mut self, kva: &mut [u8], swap: &mut SwapTable) -> Result<(), VmError>;

    /// Evacuate this page's content so the frame holding `kva` can be
    /// reused. `dirty` is the hardware dirty bit sampled before the
    /// mapping was cleared.
    fn swap_out(&mut self, kva: &[u8], dirty: bool, swap: &mut SwapTable) -> Result<(), VmError>;

    /// Release any variant-owned resource. The caller frees the page
    /// envelope and any bound frame.
    fn destroy(&mut self, swap: &mut SwapTable);
}

impl PageOps for AnonPage {
    fn swap_in(&mut self, kva: &mut [u8], swap: &mut SwapTable) -> Result<(), VmError> {
        match self.slot.take() {
            Some(slot) => {
                swap.read(slot, kva);
                swap.free(slot);
            }
            // Never swapped out: the page has no content yet.
            None => kva.fill(0),
        }
        Ok(())
    }

    fn swap_out(&mut self, kva: &[u8], _dirty: bool, swap: &mut SwapTable) -> Result<(), VmError> {
        let slot = swap.alloc().ok_or(VmError::ResourceExhausted)?;
        swap.write(slot, kva);
        self.slot = Some(slot);
        Ok(())
    }

    fn destroy(&mut self, swap: &mut SwapTable) {
        if let Some(slot) = self.slot.take() {
            swap.free(slot);
        }
    }
}

fn load_from_file(desc: &LoadDescriptor, kva: &mut [u8]) -> Result<(), VmError> {
    let read = desc.file.read_at(desc.offset, &mut kva[..desc.read_bytes]);
    if read != desc.read_bytes {
        return Err(VmError::Io);
    }
    kva[desc.read_bytes..].fill(0);
    Ok(())
}

impl PageOps for FilePage {
    fn swap_in(&mut self, kva: &mut [u8], _swap: &mut SwapTable) -> Result<(), VmError> {
        load_from_file(&self.desc, kva)
    }

    fn swap_out(&mut self, kva: &[u8], dirty: bool, _swap: &mut SwapTable) -> Result<(), VmError> {
        // The file is the backing store: write back only what changed, no
        // swap slot needed.
        if dirty {
            let written = self.desc.file.write_at(self.desc.offset, &kva[..self.desc.read_bytes]);
            if written != self.desc.read_bytes {
                return Err(VmError::Io);
            }
        }
        Ok(())
    }

    fn destroy(&mut self, _swap: &mut SwapTable) {
        // The file handle closes when the last page of the group drops it.
    }
}

/// Which backing a page currently has. Transitions only ever go
/// `Uninit -> {Anon, FileBacked}`.
pub enum Backing {
    /// Not faulted yet; carries the deferred initializer.
    Uninit(UninitPage),
    /// Anonymous, swap-backed.
    Anon(AnonPage),
    /// Memory-mapped file page.
    FileBacked(FilePage),
}

/// One virtual page of one address space.
pub struct Page {
    vpn: VirtPageNum,
    flags: PageFlags,
    /// Frame-table slot holding this page's content while resident.
    frame: Option<usize>,
    /// Dirtiness carried over from a failed evacuation. The hardware bit
    /// is lost when the mapping is reinstated, so it is preserved here
    /// and folded into the next evacuation attempt.
    dirty: bool,
    backing: Backing,
}

impl Page {
    /// A lazily-initialized page (segments, mmap, plain zero pages).
    pub fn new_uninit(vpn: VirtPageNum, flags: PageFlags, init: PageInit) -> Self {
        Self {
            vpn,
            flags,
            frame: None,
            dirty: false,
            backing: Backing::Uninit(UninitPage { init }),
        }
    }

    /// A page installed directly as anonymous, skipping the deferred
    /// stage; used for stack pages.
    pub fn new_anon(vpn: VirtPageNum, flags: PageFlags) -> Self {
        Self {
            vpn,
            flags,
            frame: None,
            dirty: false,
            backing: Backing::Anon(AnonPage::new()),
        }
    }

    /// A file-backed page materialized directly; used by fork when
    /// duplicating an already-populated mapping.
    pub(crate) fn new_file_backed(vpn: VirtPageNum, flags: PageFlags, desc: LoadDescriptor) -> Self {
        Self {
            vpn,
            flags,
            frame: None,
            dirty: false,
            backing: Backing::FileBacked(FilePage { desc }),
        }
    }

    /// The virtual page this object describes.
    pub fn vpn(&self) -> VirtPageNum {
        self.vpn
    }

    /// Attribute bits.
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Whether user stores are allowed.
    pub fn writable(&self) -> bool {
        self.flags.contains(PageFlags::WRITABLE)
    }

    /// Whether this is a stack page.
    pub fn is_stack(&self) -> bool {
        self.flags.contains(PageFlags::STACK)
    }

    /// Frame-table slot index while resident.
    pub fn frame(&self) -> Option<usize> {
        self.frame
    }

    /// Record the frame now holding this page's content.
    pub(crate) fn bind_frame(&mut self, idx: usize) {
        debug_assert!(self.frame.is_none());
        self.frame = Some(idx);
    }

    /// Detach the frame back-reference (eviction, teardown).
    pub(crate) fn take_frame(&mut self) -> Option<usize> {
        self.frame.take()
    }

    /// Current backing variant.
    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// The load descriptor of a mapping-group page, whether it has
    /// faulted yet (`FileBacked`) or not (`Uninit` with a file-map
    /// initializer). `None` for everything else.
    pub fn file_desc(&self) -> Option<&LoadDescriptor> {
        match &self.backing {
            Backing::FileBacked(fp) => Some(&fp.desc),
            Backing::Uninit(u) => match &u.init {
                PageInit::FileMap(desc) => Some(desc),
                _ => None,
            },
            _ => None,
        }
    }

    /// Populate `kva` on a fault. A first fault runs the deferred
    /// initializer and replaces the discriminant in place; later faults
    /// dispatch the variant's own `swap_in`.
    pub fn populate(&mut self, kva: &mut [u8], swap: &mut SwapTable) -> Result<(), VmError> {
        match &mut self.backing {
            Backing::Uninit(u) => {
                let next = match &u.init {
                    PageInit::Zero => {
                        kva.fill(0);
                        Backing::Anon(AnonPage::new())
                    }
                    PageInit::Segment(desc) => {
                        load_from_file(desc, kva)?;
                        Backing::Anon(AnonPage::new())
                    }
                    PageInit::FileMap(desc) => {
                        load_from_file(desc, kva)?;
                        Backing::FileBacked(FilePage { desc: desc.clone() })
                    }
                };
                // Discriminant transition; the deferred context is
                // released with the old variant.
                self.backing = next;
                Ok(())
            }
            Backing::Anon(anon) => anon.swap_in(kva, swap),
            Backing::FileBacked(fp) => fp.swap_in(kva, swap),
        }
    }

    /// Evacuate content so the frame can be reused. `hw_dirty` is the
    /// hardware dirty bit sampled before the mapping was cleared; it is
    /// combined with dirtiness remembered from an earlier failed
    /// attempt, and preserved again if this attempt fails.
    pub fn evacuate(
        &mut self,
        kva: &[u8],
        hw_dirty: bool,
        swap: &mut SwapTable,
    ) -> Result<(), VmError> {
        let dirty = hw_dirty || self.dirty;
        let result = match &mut self.backing {
            Backing::Uninit(_) => panic!("evacuate of a page that never faulted"),
            Backing::Anon(anon) => anon.swap_out(kva, dirty, swap),
            Backing::FileBacked(fp) => fp.swap_out(kva, dirty, swap),
        };
        self.dirty = result.is_err() && dirty;
        result
    }

    /// Release variant-owned resources before the envelope is dropped.
    pub fn release(&mut self, swap: &mut SwapTable) {
        match &mut self.backing {
            Backing::Uninit(_) => {}
            Backing::Anon(anon) => anon.destroy(swap),
            Backing::FileBacked(fp) => fp.destroy(swap),
        }
    }
}
