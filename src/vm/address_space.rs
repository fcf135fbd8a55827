//! Address spaces and their supplemental page tables.

use super::page::Page;
use crate::config::USER_STACK_TOP;
use crate::error::VmError;
use crate::mm::{Mapping, PageMap, VirtPageNum};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;

/// Identifier of one user address space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AsId(pub usize);

/// One user address space: its hardware page table plus the supplemental
/// page table owning every [`Page`] exclusively. Exactly one page object
/// exists per virtual page; fork produces independent copies, never
/// shared references.
pub struct AddressSpace {
    id: AsId,
    page_map: Box<dyn PageMap>,
    pages: BTreeMap<VirtPageNum, Page>,
    /// Lowest stack page created so far; stack growth happens below it.
    stack_low: VirtPageNum,
}

impl AddressSpace {
    /// An empty address space over a fresh hardware table.
    pub fn new(id: AsId, page_map: Box<dyn PageMap>) -> Self {
        Self {
            id,
            page_map,
            pages: BTreeMap::new(),
            stack_low: crate::mm::VirtAddr(USER_STACK_TOP).floor(),
        }
    }

    /// This space's identifier.
    pub fn id(&self) -> AsId {
        self.id
    }

    /// Exact page-aligned lookup; callers align first.
    pub fn find_page(&self, vpn: VirtPageNum) -> Option<&Page> {
        self.pages.get(&vpn)
    }

    pub(crate) fn find_page_mut(&mut self, vpn: VirtPageNum) -> Option<&mut Page> {
        self.pages.get_mut(&vpn)
    }

    /// Insert a new page object; fails if one already exists at that
    /// address.
    pub fn insert_page(&mut self, page: Page) -> Result<(), VmError> {
        let vpn = page.vpn();
        if self.pages.contains_key(&vpn) {
            return Err(VmError::Validation("page already mapped"));
        }
        self.pages.insert(vpn, page);
        Ok(())
    }

    /// Remove a page object from the index. The caller is responsible for
    /// variant cleanup and frame release.
    pub(crate) fn remove_page(&mut self, vpn: VirtPageNum) -> Option<Page> {
        self.pages.remove(&vpn)
    }

    /// Look up the hardware mapping for `vpn`.
    pub fn translate(&self, vpn: VirtPageNum) -> Option<Mapping> {
        self.page_map.translate(vpn)
    }

    /// Make this space's hardware table the active one.
    pub fn activate(&self) {
        self.page_map.activate();
    }

    pub(crate) fn page_map(&self) -> &dyn PageMap {
        &*self.page_map
    }

    pub(crate) fn page_map_mut(&mut self) -> &mut dyn PageMap {
        &mut *self.page_map
    }

    pub(crate) fn pages(&self) -> impl Iterator<Item = (&VirtPageNum, &Page)> {
        self.pages.iter()
    }

    pub(crate) fn drain_pages(&mut self) -> BTreeMap<VirtPageNum, Page> {
        core::mem::take(&mut self.pages)
    }

    pub(crate) fn stack_low(&self) -> VirtPageNum {
        self.stack_low
    }

    pub(crate) fn set_stack_low(&mut self, vpn: VirtPageNum) {
        self.stack_low = vpn;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PhysPageNum;
    use crate::vm::page::PageFlags;

    struct NullPageMap;

    impl PageMap for NullPageMap {
        fn map(&mut self, _vpn: VirtPageNum, _ppn: PhysPageNum, _writable: bool) -> bool {
            true
        }
        fn unmap(&mut self, _vpn: VirtPageNum) {}
        fn translate(&self, _vpn: VirtPageNum) -> Option<Mapping> {
            None
        }
        fn is_dirty(&self, _vpn: VirtPageNum) -> bool {
            false
        }
        fn clear_dirty(&mut self, _vpn: VirtPageNum) {}
        fn is_accessed(&self, _vpn: VirtPageNum) -> bool {
            false
        }
        fn clear_accessed(&mut self, _vpn: VirtPageNum) {}
        fn activate(&self) {}
    }

    #[test]
    fn duplicate_insert_fails() {
        let mut space = AddressSpace::new(AsId(0), Box::new(NullPageMap));
        let vpn = VirtPageNum(0x400);
        space
            .insert_page(Page::new_anon(vpn, PageFlags::WRITABLE))
            .unwrap();
        let err = space
            .insert_page(Page::new_anon(vpn, PageFlags::WRITABLE))
            .unwrap_err();
        assert!(matches!(err, VmError::Validation(_)));
        assert!(space.find_page(vpn).is_some());
    }

    #[test]
    fn remove_forgets_the_page() {
        let mut space = AddressSpace::new(AsId(0), Box::new(NullPageMap));
        let vpn = VirtPageNum(0x400);
        space
            .insert_page(Page::new_anon(vpn, PageFlags::WRITABLE))
            .unwrap();
        assert!(space.remove_page(vpn).is_some());
        assert!(space.find_page(vpn).is_none());
        assert!(space.remove_page(vpn).is_none());
    }
}
