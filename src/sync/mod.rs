//! Synchronization primitives.

mod semaphore;

pub use semaphore::Semaphore;
