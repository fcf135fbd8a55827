//! The hardware page-table adapter.
//!
//! One implementor exists per address space; the embedding kernel supplies
//! it (for example an SV39 or PML4 walker). This crate only installs,
//! removes and queries mappings through it and never touches paging
//! hardware directly.

use super::{PhysPageNum, VirtPageNum};

/// One installed virtual-to-physical mapping.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// The frame the virtual page points at.
    pub ppn: PhysPageNum,
    /// Whether user-mode stores are allowed through this mapping.
    pub writable: bool,
}

/// The hardware page table of a single address space.
pub trait PageMap: Send + Sync {
    /// Install `vpn -> ppn`. Returns `false` if the hardware table could
    /// not be grown (out of page-table memory) or the page is already
    /// mapped.
    fn map(&mut self, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> bool;

    /// Remove the mapping for `vpn`, if any. Later accesses re-fault.
    fn unmap(&mut self, vpn: VirtPageNum);

    /// Look up the current mapping for `vpn`.
    fn translate(&self, vpn: VirtPageNum) -> Option<Mapping>;

    /// Whether the hardware has recorded a store through `vpn`.
    fn is_dirty(&self, vpn: VirtPageNum) -> bool;

    /// Reset the dirty bit for `vpn`.
    fn clear_dirty(&mut self, vpn: VirtPageNum);

    /// Whether the hardware has recorded any access through `vpn`.
    fn is_accessed(&self, vpn: VirtPageNum) -> bool;

    /// Reset the accessed bit for `vpn`; the clock hand uses this to grant
    /// a second chance.
    fn clear_accessed(&mut self, vpn: VirtPageNum);

    /// Make this table the active one on the running CPU.
    fn activate(&self);
}
