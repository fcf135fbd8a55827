//! Constants used across the paging subsystem.

/// 4096byte == 4KiB
pub const PAGE_SIZE: usize = 0x1000;
/// Bit width of intra-page offset
pub const PAGE_SIZE_BITS: usize = 0xc;

/// First address past the user-accessible range.
pub const USER_TOP: usize = 0x80_0400_0000;

/// Top of the initial user stack; the stack grows downwards from here.
pub const USER_STACK_TOP: usize = 0x4748_0000;

/// How far below [`USER_STACK_TOP`] the stack may grow on demand.
pub const MAX_STACK_SIZE: usize = 0x10_0000;

/// File descriptors below this index are the reserved stdio entries; fork
/// shares them instead of duplicating independent handles.
pub const FD_RESERVED: usize = 3;
