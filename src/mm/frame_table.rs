//! The frame pool interface and the table of in-use frames.
//!
//! The raw allocator is an external collaborator behind [`FramePool`];
//! the [`FrameTable`] is this crate's bookkeeping over it: an arena of
//! slots recording which (address space, virtual page) pair owns each
//! bound frame, plus the clock hand the eviction policy walks.

use super::PhysPageNum;
use super::VirtPageNum;
use crate::vm::AsId;
use alloc::vec::Vec;

/// The raw physical-frame allocator supplied by the embedding kernel.
pub trait FramePool: Send + Sync {
    /// Hand out one frame, optionally zero-filled. `None` when the pool is
    /// exhausted; the caller decides whether to evict.
    fn obtain(&self, zeroed: bool) -> Option<PhysPageNum>;

    /// Return a frame to the pool.
    fn release(&self, ppn: PhysPageNum);
}

/// The page a bound frame belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameOwner {
    /// Owning address space.
    pub space: AsId,
    /// Owning virtual page within that space.
    pub vpn: VirtPageNum,
}

struct FrameSlot {
    ppn: PhysPageNum,
    owner: FrameOwner,
}

/// Arena of in-use frames. A frame is bound to at most one page, and a
/// bound page's frame index and the slot's owner are kept mutually
/// consistent by the [`crate::vm::Vm`] operations.
pub struct FrameTable {
    slots: Vec<Option<FrameSlot>>,
    /// Vacated slot indices, reused last-in first-out.
    recycled: Vec<usize>,
    /// Clock hand for the second-chance scan.
    hand: usize,
}

impl FrameTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            recycled: Vec::new(),
            hand: 0,
        }
    }

    /// Record `ppn` as bound to `owner`; returns the slot index the owning
    /// page stores as its back-reference.
    pub fn bind(&mut self, ppn: PhysPageNum, owner: FrameOwner) -> usize {
        let slot = FrameSlot { ppn, owner };
        if let Some(idx) = self.recycled.pop() {
            self.slots[idx] = Some(slot);
            idx
        } else {
            self.slots.push(Some(slot));
            self.slots.len() - 1
        }
    }

    /// Hand an already-bound slot to a new owner (frame reuse after
    /// eviction).
    pub fn rebind(&mut self, idx: usize, owner: FrameOwner) {
        match &mut self.slots[idx] {
            Some(slot) => slot.owner = owner,
            None => panic!("rebind of vacant frame slot {}", idx),
        }
    }

    /// Drop the binding and vacate the slot, returning the frame for the
    /// caller to free or reuse.
    pub fn unbind(&mut self, idx: usize) -> PhysPageNum {
        match self.slots[idx].take() {
            Some(slot) => {
                self.recycled.push(idx);
                slot.ppn
            }
            None => panic!("unbind of vacant frame slot {}", idx),
        }
    }

    /// Frame held in `idx`.
    pub fn ppn(&self, idx: usize) -> PhysPageNum {
        self.slots[idx].as_ref().map(|s| s.ppn).expect("vacant frame slot")
    }

    /// Owner recorded for `idx`.
    pub fn owner(&self, idx: usize) -> FrameOwner {
        self.slots[idx]
            .as_ref()
            .map(|s| s.owner)
            .expect("vacant frame slot")
    }

    /// Number of bound frames.
    pub fn live(&self) -> usize {
        self.slots.len() - self.recycled.len()
    }

    /// Advance the clock hand to the next bound slot and return its index.
    /// `None` when no frame is bound at all.
    pub fn clock_next(&mut self) -> Option<usize> {
        if self.live() == 0 {
            return None;
        }
        loop {
            if self.hand >= self.slots.len() {
                self.hand = 0;
            }
            let idx = self.hand;
            self.hand += 1;
            if self.slots[idx].is_some() {
                return Some(idx);
            }
        }
    }
}

impl Default for FrameTable {
    fn default() -> Self {
        Self::new()
    }
}
