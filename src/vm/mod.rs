//! The demand-paging core: page objects, supplemental page tables, the
//! frame table with clock eviction, and the fault resolver.
//!
//! Everything hangs off [`Vm`]. Obtaining a frame, evicting a victim and
//! installing or clearing hardware mappings form one critical section, so
//! the embedding kernel wraps the whole [`Vm`] in a single lock (a
//! `spin::Mutex` in this crate's own task layer) rather than this module
//! taking finer-grained locks internally.

mod address_space;
mod fault;
mod file_map;
mod page;
mod swap;

pub use address_space::{AddressSpace, AsId};
pub use page::{Backing, LoadDescriptor, Page, PageFlags, PageInit, PageOps};
pub use swap::{SwapDevice, SwapTable};

use crate::config::USER_TOP;
use crate::error::VmError;
use crate::mm::{FrameOwner, FramePool, FrameTable, Mapping, PageMap, PhysPageNum, VirtAddr, VirtPageNum};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

/// The virtual-memory subsystem: every address space, the shared frame
/// table, and the swap-slot allocator.
pub struct Vm {
    pool: Arc<dyn FramePool>,
    frames: FrameTable,
    swap: SwapTable,
    spaces: BTreeMap<AsId, AddressSpace>,
    next_id: usize,
}

impl Vm {
    /// A subsystem over the given frame pool and swap device.
    pub fn new(pool: Arc<dyn FramePool>, swap_device: Arc<dyn SwapDevice>) -> Self {
        Self {
            pool,
            frames: FrameTable::new(),
            swap: SwapTable::new(swap_device),
            spaces: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Register a new, empty address space over `page_map`.
    pub fn create_space(&mut self, page_map: Box<dyn PageMap>) -> AsId {
        let id = AsId(self.next_id);
        self.next_id += 1;
        self.spaces.insert(id, AddressSpace::new(id, page_map));
        id
    }

    /// Look up an address space.
    pub fn space(&self, id: AsId) -> Option<&AddressSpace> {
        self.spaces.get(&id)
    }

    /// Current hardware mapping for `va` in space `id`.
    pub fn translate(&self, id: AsId, va: VirtAddr) -> Option<Mapping> {
        self.spaces.get(&id)?.translate(va.floor())
    }

    /// Install a lazily-initialized page at `va`. The content is
    /// materialized by `init` on first fault.
    pub fn alloc_page(
        &mut self,
        id: AsId,
        va: VirtAddr,
        flags: PageFlags,
        init: PageInit,
    ) -> Result<(), VmError> {
        if !va.aligned() {
            return Err(VmError::Validation("unaligned page address"));
        }
        if va.0 == 0 || va.0 >= USER_TOP {
            return Err(VmError::Validation("address outside user range"));
        }
        let space = self.spaces.get_mut(&id).ok_or(VmError::IllegalAccess)?;
        space.insert_page(Page::new_uninit(va.floor(), flags, init))
    }

    /// Install a writable anonymous stack page directly, skipping the
    /// deferred stage.
    pub(crate) fn push_stack_page(&mut self, id: AsId, vpn: VirtPageNum) -> Result<(), VmError> {
        let space = self.spaces.get_mut(&id).ok_or(VmError::IllegalAccess)?;
        space.insert_page(Page::new_anon(vpn, PageFlags::WRITABLE | PageFlags::STACK))?;
        if vpn < space.stack_low() {
            space.set_stack_low(vpn);
        }
        Ok(())
    }

    /// Force `va`'s page resident now instead of waiting for a fault.
    pub fn claim_page(&mut self, id: AsId, va: VirtAddr) -> Result<(), VmError> {
        self.resolve(id, va.floor())
    }

    /// Remove the page at `va` from its space: clears the mapping, frees
    /// the frame, and runs the variant's cleanup.
    pub fn remove_page(&mut self, id: AsId, va: VirtAddr) -> Result<(), VmError> {
        let Vm {
            frames,
            swap,
            spaces,
            pool,
            ..
        } = self;
        let space = spaces.get_mut(&id).ok_or(VmError::IllegalAccess)?;
        let vpn = va.floor();
        let mut page = space.remove_page(vpn).ok_or(VmError::IllegalAccess)?;
        space.page_map_mut().unmap(vpn);
        if let Some(idx) = page.take_frame() {
            let ppn = frames.unbind(idx);
            pool.release(ppn);
        }
        page.release(swap);
        Ok(())
    }

    /// Tear down a whole address space, destroying every page object and
    /// returning every bound frame to the pool.
    pub fn destroy_space(&mut self, id: AsId) {
        let Some(mut space) = self.spaces.remove(&id) else {
            return;
        };
        let Vm {
            frames, swap, pool, ..
        } = self;
        for (vpn, mut page) in space.drain_pages() {
            space.page_map_mut().unmap(vpn);
            if let Some(idx) = page.take_frame() {
                let ppn = frames.unbind(idx);
                pool.release(ppn);
            }
            page.release(swap);
        }
    }

    /// Duplicate `src` into a fresh address space over `page_map` for
    /// fork. Uninitialized entries share the (not yet consumed) deferred
    /// context; populated entries get their content copied byte for byte
    /// into newly allocated frames, with no copy-on-write. All or
    /// nothing: on any failure every frame taken so far goes back to the
    /// pool and the parent is untouched.
    ///
    /// Duplication draws from the free pool only, never evicting, so the
    /// parent's resident pages stay stable while their bytes are read.
    pub fn copy_space(&mut self, src: AsId, page_map: Box<dyn PageMap>) -> Result<AsId, VmError> {
        let id = AsId(self.next_id);
        self.next_id += 1;
        let Vm {
            frames,
            swap,
            spaces,
            pool,
            ..
        } = self;
        let parent = spaces.get(&src).ok_or(VmError::IllegalAccess)?;
        let mut child = AddressSpace::new(id, page_map);
        child.set_stack_low(parent.stack_low());

        let mut copied: Vec<usize> = Vec::new();
        let mut failed: Option<VmError> = None;

        'copy: for (&vpn, page) in parent.pages() {
            let flags = page.flags();
            let writable = page.writable();

            // Lazy entries duplicate by sharing the deferred context; it
            // is immutable until consumed, so the share is safe.
            let fresh = match page.backing() {
                Backing::Uninit(u) => Some(Page::new_uninit(vpn, flags, u.init.clone())),
                Backing::Anon(anon) if page.frame().is_none() && anon.slot().is_none() => {
                    Some(Page::new_anon(vpn, flags))
                }
                Backing::FileBacked(fp) if page.frame().is_none() => {
                    Some(Page::new_file_backed(vpn, flags, fp.desc().clone()))
                }
                _ => None,
            };
            if let Some(dup) = fresh {
                if let Err(e) = child.insert_page(dup) {
                    failed = Some(e);
                    break 'copy;
                }
                continue;
            }

            // Populated entry: eager byte-for-byte copy into a new frame.
            let ppn = match pool.obtain(false) {
                Some(ppn) => ppn,
                None => {
                    failed = Some(VmError::ResourceExhausted);
                    break 'copy;
                }
            };
            let idx = frames.bind(ppn, FrameOwner { space: id, vpn });
            copied.push(idx);

            let mut dup = match page.backing() {
                Backing::Anon(anon) => {
                    match page.frame() {
                        Some(src_idx) => {
                            ppn.bytes_array().copy_from_slice(frames.ppn(src_idx).bytes_array());
                        }
                        // Evicted at fork time: duplicate from the slot,
                        // leaving the parent's copy where it is.
                        None => {
                            let slot = anon.slot().expect("evicted page without swap slot");
                            swap.read(slot, ppn.bytes_array());
                        }
                    }
                    Page::new_anon(vpn, flags)
                }
                Backing::FileBacked(fp) => {
                    let src_idx = page.frame().expect("unreachable: lazy file page handled above");
                    ppn.bytes_array().copy_from_slice(frames.ppn(src_idx).bytes_array());
                    Page::new_file_backed(vpn, flags, fp.desc().clone())
                }
                Backing::Uninit(_) => unreachable!("lazy page handled above"),
            };

            if !child.page_map_mut().map(vpn, ppn, writable) {
                failed = Some(VmError::ResourceExhausted);
                break 'copy;
            }
            dup.bind_frame(idx);
            if let Err(e) = child.insert_page(dup) {
                failed = Some(e);
                break 'copy;
            }
        }

        if let Some(e) = failed {
            for idx in copied {
                let ppn = frames.unbind(idx);
                pool.release(ppn);
            }
            log::warn!("address-space copy of {:?} failed: {}", src, e);
            return Err(e);
        }
        spaces.insert(id, child);
        Ok(id)
    }

    /// Resolve one page of `id` to "frame bound and mapped": obtain a
    /// frame (evicting if the pool is dry), run the page's populate
    /// operation, and install the hardware mapping. A failure never
    /// leaks the frame.
    fn resolve(&mut self, id: AsId, vpn: VirtPageNum) -> Result<(), VmError> {
        {
            let space = self.spaces.get(&id).ok_or(VmError::IllegalAccess)?;
            let page = space.find_page(vpn).ok_or(VmError::IllegalAccess)?;
            if page.frame().is_some() {
                return Ok(());
            }
        }
        let owner = FrameOwner { space: id, vpn };
        let (idx, ppn) = self.obtain_frame(owner, false)?;
        let Vm {
            frames,
            swap,
            spaces,
            pool,
            ..
        } = self;
        // The space was present above and nothing since removed it.
        let space = spaces.get_mut(&id).expect("faulting space disappeared");
        let result = (|| {
            let writable = {
                let page = space.find_page_mut(vpn).ok_or(VmError::IllegalAccess)?;
                page.populate(ppn.bytes_array(), swap)?;
                page.writable()
            };
            if !space.page_map_mut().map(vpn, ppn, writable) {
                return Err(VmError::ResourceExhausted);
            }
            if let Some(page) = space.find_page_mut(vpn) {
                page.bind_frame(idx);
            }
            Ok(())
        })();
        if result.is_err() {
            frames.unbind(idx);
            pool.release(ppn);
        }
        result
    }

    /// A frame for `owner`, evicting a victim when the pool is empty.
    fn obtain_frame(
        &mut self,
        owner: FrameOwner,
        zeroed: bool,
    ) -> Result<(usize, PhysPageNum), VmError> {
        if let Some(ppn) = self.pool.obtain(zeroed) {
            let idx = self.frames.bind(ppn, owner);
            return Ok((idx, ppn));
        }
        let idx = self.evict()?;
        self.frames.rebind(idx, owner);
        let ppn = self.frames.ppn(idx);
        if zeroed {
            ppn.bytes_array().fill(0);
        }
        Ok((idx, ppn))
    }

    /// Clock second-chance over the frame arena: an accessed frame gets
    /// its bit cleared and one more pass; the first unaccessed frame is
    /// the victim. Deterministic in slot order.
    fn evict(&mut self) -> Result<usize, VmError> {
        let Vm {
            frames,
            swap,
            spaces,
            ..
        } = self;
        let live = frames.live();
        if live == 0 {
            return Err(VmError::ResourceExhausted);
        }
        // The first sweep may only clear accessed bits; the second must
        // then find a victim.
        for _ in 0..(2 * live) {
            let idx = frames.clock_next().ok_or(VmError::ResourceExhausted)?;
            let owner = frames.owner(idx);
            let space = spaces
                .get_mut(&owner.space)
                .expect("frame bound to a dead address space");
            if space.page_map().is_accessed(owner.vpn) {
                space.page_map_mut().clear_accessed(owner.vpn);
                continue;
            }
            // Sample the dirty bit, then clear the mapping before the
            // frame is reused so any later access re-faults instead of
            // observing stale content.
            let dirty = space.page_map().is_dirty(owner.vpn);
            space.page_map_mut().unmap(owner.vpn);
            let ppn = frames.ppn(idx);
            let page = space
                .find_page_mut(owner.vpn)
                .expect("frame bound to a missing page");
            let writable = page.writable();
            match page.evacuate(ppn.bytes_array(), dirty, swap) {
                Ok(()) => {
                    page.take_frame();
                    log::trace!("evicted {:?} from {:?}", owner.vpn, owner.space);
                    return Ok(idx);
                }
                Err(e) => {
                    // Evacuation failed (swap full, writeback error);
                    // reinstate the victim and fail the faulting
                    // operation instead.
                    space.page_map_mut().map(owner.vpn, ppn, writable);
                    return Err(e);
                }
            }
        }
        Err(VmError::ResourceExhausted)
    }
}
