//! Swap-slot storage for evicted anonymous pages.
//!
//! The device itself is an external collaborator (a block device carved
//! into page-sized slots); the [`SwapTable`] adds the allocation bitmap
//! over it. Slots live from a page's swap-out to its next swap-in, or to
//! its destruction if it dies while evicted.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

/// A fixed pool of page-sized slots on stable storage.
pub trait SwapDevice: Send + Sync {
    /// Number of slots the device holds.
    fn slots(&self) -> usize;

    /// Read one slot into `buf` (one page).
    fn read_slot(&self, slot: usize, buf: &mut [u8]);

    /// Write one page from `buf` into `slot`.
    fn write_slot(&self, slot: usize, buf: &[u8]);
}

const BITS: usize = u64::BITS as usize;

/// Slot allocator over a [`SwapDevice`].
pub struct SwapTable {
    device: Arc<dyn SwapDevice>,
    used: Vec<u64>,
}

impl SwapTable {
    /// A table with every slot free.
    pub fn new(device: Arc<dyn SwapDevice>) -> Self {
        let words = (device.slots() + BITS - 1) / BITS;
        Self {
            device,
            used: vec![0; words],
        }
    }

    /// Claim a free slot, lowest index first. `None` when swap is full.
    pub fn alloc(&mut self) -> Option<usize> {
        let limit = self.device.slots();
        for (word_idx, word) in self.used.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = word.trailing_ones() as usize;
            let slot = word_idx * BITS + bit;
            if slot >= limit {
                return None;
            }
            *word |= 1 << bit;
            return Some(slot);
        }
        None
    }

    /// Return `slot` to the free pool.
    pub fn free(&mut self, slot: usize) {
        let mask = 1u64 << (slot % BITS);
        debug_assert!(self.used[slot / BITS] & mask != 0, "free of free swap slot");
        self.used[slot / BITS] &= !mask;
    }

    /// Read the page stored in `slot`.
    pub fn read(&self, slot: usize, buf: &mut [u8]) {
        self.device.read_slot(slot, buf);
    }

    /// Store one page into `slot`.
    pub fn write(&mut self, slot: usize, buf: &[u8]) {
        self.device.write_slot(slot, buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PAGE_SIZE;
    use std::sync::Mutex;

    struct VecSwap {
        slots: Mutex<Vec<Vec<u8>>>,
    }

    impl VecSwap {
        fn new(n: usize) -> Self {
            Self {
                slots: Mutex::new(vec![vec![0; PAGE_SIZE]; n]),
            }
        }
    }

    impl SwapDevice for VecSwap {
        fn slots(&self) -> usize {
            self.slots.lock().unwrap().len()
        }

        fn read_slot(&self, slot: usize, buf: &mut [u8]) {
            buf.copy_from_slice(&self.slots.lock().unwrap()[slot]);
        }

        fn write_slot(&self, slot: usize, buf: &[u8]) {
            self.slots.lock().unwrap()[slot].copy_from_slice(buf);
        }
    }

    #[test]
    fn alloc_until_full_then_reuse() {
        let mut table = SwapTable::new(Arc::new(VecSwap::new(3)));
        assert_eq!(table.alloc(), Some(0));
        assert_eq!(table.alloc(), Some(1));
        assert_eq!(table.alloc(), Some(2));
        assert_eq!(table.alloc(), None);
        table.free(1);
        assert_eq!(table.alloc(), Some(1));
    }

    #[test]
    fn slot_round_trip() {
        let mut table = SwapTable::new(Arc::new(VecSwap::new(2)));
        let slot = table.alloc().unwrap();
        let pattern = vec![0xabu8; PAGE_SIZE];
        table.write(slot, &pattern);
        let mut back = vec![0u8; PAGE_SIZE];
        table.read(slot, &mut back);
        assert_eq!(back, pattern);
    }
}
