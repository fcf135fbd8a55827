//! Failure taxonomy of the paging subsystem.
//!
//! No error here is silently swallowed: every failure path either aborts
//! the current operation with a caller-visible result or terminates the
//! owning process. The kernel itself never dies because one process
//! faulted badly.

use core::fmt;

/// Why a paging operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Malformed ELF image, a segment outside the user range, or a page
    /// that overlaps an existing one. Fatal to the load attempt.
    Validation(&'static str),
    /// No free frame and no evictable victim, or an allocation failed.
    /// Fatal to the single operation in progress, not to the kernel.
    ResourceExhausted,
    /// Short read or write against a backing file or the swap device.
    /// Indicates a corrupt or truncated backing store; never retried.
    Io,
    /// Protection violation, access outside the user range, or a fault on
    /// an address nothing backs. Terminates the offending process.
    IllegalAccess,
    /// Child duplication failed; reported back across the fork rendezvous
    /// as a sentinel status rather than propagated as a panic.
    ForkFailed,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmError::Validation(why) => write!(f, "validation failed: {}", why),
            VmError::ResourceExhausted => write!(f, "out of frames or swap slots"),
            VmError::Io => write!(f, "backing store I/O failed"),
            VmError::IllegalAccess => write!(f, "illegal memory access"),
            VmError::ForkFailed => write!(f, "child could not be created"),
        }
    }
}
