//! A counting semaphore.

use spin::Mutex;

/// A counting semaphore.
///
/// Created with a count of zero it acts as a pure rendezvous: `down`
/// waits until some other thread calls `up`. That is how the process
/// layer orders fork, wait and exit between parent and child.
///
/// There is no scheduler to park on here, so `down` spins; waits in this
/// crate are short handshakes, not long sleeps.
pub struct Semaphore {
    count: Mutex<isize>,
}

impl Semaphore {
    /// A semaphore with `count` permits available.
    pub fn new(count: isize) -> Self {
        Self {
            count: Mutex::new(count),
        }
    }

    /// Release one permit, waking one waiter if any is spinning.
    pub fn up(&self) {
        *self.count.lock() += 1;
    }

    /// Acquire one permit, spinning until one is available.
    pub fn down(&self) {
        loop {
            let mut count = self.count.lock();
            if *count > 0 {
                *count -= 1;
                return;
            }
            drop(count);
            core::hint::spin_loop();
        }
    }
}
