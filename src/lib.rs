//! Demand-paged virtual memory for a teaching kernel.
//!
//! The crate decides, per process, what backs every virtual page
//! (uninitialized, anonymous, or memory-mapped file), resolves page faults
//! by allocating and populating physical frames lazily, and builds process
//! address spaces (ELF loading, stack growth, fork duplication,
//! mmap/munmap). The most important modules are:
//!
//! - [`vm`]: page objects, supplemental page tables, the frame table with
//!   clock eviction, and the fault resolver.
//! - [`loader`]: ELF validation, lazy segment mapping and user-stack
//!   construction.
//! - [`task`]: the process bookkeeping around the subsystem, including the
//!   fork and exit rendezvous.
//!
//! Hardware and drivers are consumed through traits: [`mm::PageMap`] for
//! the page-table hardware, [`mm::FramePool`] for raw frames,
//! [`vm::SwapDevice`] for swap storage and [`fs::VmFile`] for files. The
//! crate therefore links into a bare-metal kernel unchanged while its
//! test suite runs hosted.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

#[macro_use]
extern crate bitflags;

pub mod config;
mod error;
pub mod fs;
pub mod loader;
pub mod mm;
pub mod sync;
pub mod task;
pub mod vm;

pub use error::VmError;
