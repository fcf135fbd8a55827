//! Processes: the owner side of each address space, with the fork, wait
//! and exit handshakes.
//!
//! The scheduler and trap plumbing belong to the embedding kernel; this
//! layer covers what the pager itself needs to know about a process: its
//! address space, its open files, its running executable, and the three
//! semaphores ordering its lifecycle against its parent.

use crate::config::FD_RESERVED;
use crate::error::VmError;
use crate::fs::VmFile;
use crate::mm::PageMap;
use crate::sync::Semaphore;
use crate::vm::{AsId, Vm};
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use spin::Mutex;

/// Exit status a child reports when its fork never completed.
pub const FORK_FAILED: i32 = -1;

/// Mutable process state, behind the process lock.
pub struct ProcessInner {
    /// The address space, once one has been set up.
    pub space: Option<AsId>,
    /// Open file descriptors. Slots below [`FD_RESERVED`] belong to the
    /// console and are duplicated by reference on fork.
    pub fd_table: Vec<Option<Arc<dyn VmFile>>>,
    /// Exit status reported to the parent.
    pub exit_status: i32,
    /// Live children, each reaped exactly once by `wait`.
    pub children: Vec<Arc<Process>>,
    parent: Option<Weak<Process>>,
    /// The executable, held open with writes denied until exit.
    running: Option<Arc<dyn VmFile>>,
}

/// One user process.
pub struct Process {
    pid: usize,
    name: String,
    /// Upped by the child once its fork attempt has a verdict.
    fork_sema: Semaphore,
    /// Upped by the child when it exits; the parent's `wait` downs it.
    wait_sema: Semaphore,
    /// Upped by the parent after reaping; the child may then disappear.
    exit_sema: Semaphore,
    inner: Mutex<ProcessInner>,
}

impl Process {
    /// A fresh process with an empty descriptor table and no address
    /// space yet.
    pub fn new(pid: usize, name: &str) -> Arc<Self> {
        let mut fd_table = Vec::new();
        fd_table.resize_with(FD_RESERVED, || None);
        Arc::new(Self {
            pid,
            name: String::from(name),
            fork_sema: Semaphore::new(0),
            wait_sema: Semaphore::new(0),
            exit_sema: Semaphore::new(0),
            inner: Mutex::new(ProcessInner {
                space: None,
                fd_table,
                exit_status: 0,
                children: Vec::new(),
                parent: None,
                running: None,
            }),
        })
    }

    /// Process identifier.
    pub fn pid(&self) -> usize {
        self.pid
    }

    /// Process name, as printed in the termination message.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Access the mutable state.
    pub fn inner(&self) -> spin::MutexGuard<'_, ProcessInner> {
        self.inner.lock()
    }

    /// The parent, if it is still alive.
    pub fn parent(&self) -> Option<Arc<Process>> {
        self.inner().parent.as_ref()?.upgrade()
    }

    /// Register a child-to-be under this parent. The child is not usable
    /// until [`Process::fork_child`] has run and [`Process::fork_wait`]
    /// has confirmed it.
    pub fn spawn_child(self: &Arc<Self>, pid: usize, name: &str) -> Arc<Process> {
        let child = Process::new(pid, name);
        child.inner().parent = Some(Arc::downgrade(self));
        self.inner().children.push(child.clone());
        child
    }

    /// The child side of fork: duplicate the parent's address space and
    /// descriptor table into `child`, then wake the parent with the
    /// verdict. Runs on the child's own thread of control.
    ///
    /// Console descriptors are shared by reference; every other open file
    /// is reopened so the two processes seek independently. On any
    /// failure the child records [`FORK_FAILED`] and wakes the parent
    /// anyway, so [`Process::fork_wait`] never blocks forever.
    pub fn fork_child(self: &Arc<Self>, child: &Arc<Process>, vm: &Mutex<Vm>, page_map: Box<dyn PageMap>) {
        let verdict = self.duplicate_into(child, vm, page_map);
        if verdict.is_err() {
            child.inner().exit_status = FORK_FAILED;
        }
        child.fork_sema.up();
    }

    fn duplicate_into(
        &self,
        child: &Arc<Process>,
        vm: &Mutex<Vm>,
        page_map: Box<dyn PageMap>,
    ) -> Result<(), VmError> {
        // Snapshot the parent under its own lock only; the vm lock is
        // taken afterwards so the two are never held together.
        let (src, fds) = {
            let parent = self.inner();
            let src = parent.space.ok_or(VmError::ForkFailed)?;
            let fds: Vec<Option<Arc<dyn VmFile>>> = parent
                .fd_table
                .iter()
                .enumerate()
                .map(|(fd, entry)| {
                    entry.as_ref().map(|file| {
                        if fd < FD_RESERVED {
                            file.clone()
                        } else {
                            file.reopen()
                        }
                    })
                })
                .collect();
            (src, fds)
        };
        let space = vm.lock().copy_space(src, page_map)?;
        let mut inner = child.inner();
        inner.space = Some(space);
        inner.fd_table = fds;
        Ok(())
    }

    /// The parent side of fork: wait for the child's verdict. On failure
    /// the stillborn child is reaped immediately and released.
    pub fn fork_wait(self: &Arc<Self>, child: &Arc<Process>) -> Result<usize, VmError> {
        child.fork_sema.down();
        let stillborn = {
            let inner = child.inner();
            inner.exit_status == FORK_FAILED && inner.space.is_none()
        };
        if stillborn {
            self.inner().children.retain(|c| c.pid != child.pid);
            child.exit_sema.up();
            return Err(VmError::ForkFailed);
        }
        Ok(child.pid)
    }

    /// Record the executable this process is running and deny writes to
    /// it until exit.
    pub fn set_running(&self, file: Arc<dyn VmFile>) {
        file.deny_write();
        let previous = self.inner().running.replace(file);
        if let Some(old) = previous {
            old.allow_write();
        }
    }

    /// Install `file` in the first free descriptor slot.
    pub fn install_fd(&self, file: Arc<dyn VmFile>) -> usize {
        let mut inner = self.inner();
        for (fd, entry) in inner.fd_table.iter_mut().enumerate().skip(FD_RESERVED) {
            if entry.is_none() {
                *entry = Some(file);
                return fd;
            }
        }
        inner.fd_table.push(Some(file));
        inner.fd_table.len() - 1
    }

    /// Look up an open descriptor.
    pub fn fd(&self, fd: usize) -> Option<Arc<dyn VmFile>> {
        self.inner().fd_table.get(fd)?.clone()
    }

    /// Close a descriptor. Closing an unused slot is a no-op.
    pub fn close_fd(&self, fd: usize) {
        if let Some(entry) = self.inner().fd_table.get_mut(fd) {
            *entry = None;
        }
    }

    /// Terminate this process: print the termination message, release
    /// every descriptor, re-allow writes to the executable, tear down the
    /// address space, then rendezvous with the parent. Blocks until the
    /// parent has reaped the status, so the status read never races the
    /// child's disappearance.
    pub fn exit(&self, vm: &Mutex<Vm>, status: i32) {
        log::info!("{}: exit({})", self.name, status);
        let space = {
            let mut inner = self.inner();
            inner.exit_status = status;
            inner.fd_table.clear();
            if let Some(exe) = inner.running.take() {
                exe.allow_write();
            }
            inner.space.take()
        };
        if let Some(space) = space {
            vm.lock().destroy_space(space);
        }
        self.wait_sema.up();
        self.exit_sema.down();
    }

    /// Reap a direct child by pid, blocking until it exits. Returns its
    /// exit status, or `None` if `pid` is not an unreaped direct child.
    pub fn wait(self: &Arc<Self>, pid: usize) -> Option<i32> {
        let child = {
            let inner = self.inner();
            inner.children.iter().find(|c| c.pid == pid)?.clone()
        };
        child.wait_sema.down();
        let status = child.inner().exit_status;
        self.inner().children.retain(|c| c.pid != pid);
        child.exit_sema.up();
        Some(status)
    }
}
