//! Address arithmetic and the hardware-facing memory interfaces.
//!
//! The page-table hardware and the physical-frame allocator are external
//! collaborators; this module defines the traits the rest of the crate
//! consumes them through, plus the frame table that tracks which page owns
//! which in-use frame.

mod address;
mod frame_table;
mod page_map;

pub use address::{PhysAddr, PhysPageNum, VirtAddr, VirtPageNum};
pub use frame_table::{FrameOwner, FramePool, FrameTable};
pub use page_map::{Mapping, PageMap};
