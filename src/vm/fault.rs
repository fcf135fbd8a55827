//! The page-fault resolver.
//!
//! Invoked synchronously on the faulting thread for every hardware page
//! fault. Either the faulting page ends up resident and mapped, or the
//! fault is fatal to the process; a failed fault is never silently
//! retried, since retrying without resolving the shortage would loop.

use super::{AsId, Vm};
use crate::config::{MAX_STACK_SIZE, USER_STACK_TOP, USER_TOP};
use crate::error::VmError;
use crate::mm::VirtAddr;

impl Vm {
    /// Resolve one hardware page fault.
    ///
    /// `user` is the privilege of the faulting context, `write` whether
    /// the access was a store, and `not_present` distinguishes a missing
    /// mapping from a protection violation on a present one.
    pub fn handle_fault(
        &mut self,
        id: AsId,
        addr: VirtAddr,
        user: bool,
        write: bool,
        not_present: bool,
    ) -> Result<(), VmError> {
        if addr.0 >= USER_TOP {
            log::debug!("fault outside user range at {:?} (user={})", addr, user);
            return Err(VmError::IllegalAccess);
        }
        // A present mapping that still faulted means the access itself
        // was disallowed (a store through a read-only page).
        if !not_present {
            log::debug!("protection violation at {:?} (write={})", addr, write);
            return Err(VmError::IllegalAccess);
        }

        let vpn = addr.floor();
        let known = {
            let space = self.space(id).ok_or(VmError::IllegalAccess)?;
            match space.find_page(vpn) {
                Some(page) => {
                    if write && !page.writable() {
                        log::debug!("store to read-only page at {:?}", addr);
                        return Err(VmError::IllegalAccess);
                    }
                    true
                }
                None => false,
            }
        };

        if !known {
            if !self.is_stack_growth(id, addr) {
                log::debug!("fault on unbacked address {:?}", addr);
                return Err(VmError::IllegalAccess);
            }
            // Synthesize a new stack page at the faulting address and
            // continue as a normal fault.
            self.push_stack_page(id, vpn)?;
            log::trace!("stack grown to {:?} in {:?}", vpn, id);
        }

        self.claim_page(id, addr)
    }

    /// Whether `addr` is a valid stack-growth candidate: below the pages
    /// the stack already owns, and within the configured maximum stack
    /// size.
    fn is_stack_growth(&self, id: AsId, addr: VirtAddr) -> bool {
        let Some(space) = self.space(id) else {
            return false;
        };
        addr.0 >= USER_STACK_TOP - MAX_STACK_SIZE
            && addr.0 < USER_STACK_TOP
            && addr.floor() < space.stack_low()
    }
}
