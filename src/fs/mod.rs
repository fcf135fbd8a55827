//! The file collaborator interface.
//!
//! The file system itself is external; the pager only needs positionless
//! reads and writes against an open file, plus the executable
//! write-protection hooks the loader uses.

use alloc::sync::Arc;

/// An open kernel file handle the pager reads and writes through.
pub trait VmFile: Send + Sync {
    /// Read up to `buf.len()` bytes starting at `offset`; returns the
    /// number of bytes actually read (short at end of file).
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;

    /// Write `buf` starting at `offset`; returns the number of bytes
    /// actually written. Does not grow the file.
    fn write_at(&self, offset: usize, buf: &[u8]) -> usize;

    /// Current length of the file in bytes.
    fn len(&self) -> usize;

    /// Whether the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An independent handle onto the same underlying file, so a mapping
    /// outlives the descriptor it was created from.
    fn reopen(&self) -> Arc<dyn VmFile>;

    /// Block writes to the file while it backs a running executable.
    fn deny_write(&self);

    /// Undo one [`VmFile::deny_write`].
    fn allow_write(&self);
}
