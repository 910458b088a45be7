//! Process model.
//!
//! Processes are PCBs in a kernel-wide table, each owning an address
//! space, a descriptor table, a working directory, and a refcounted exit
//! rendezvous shared with the parent. `fork` clones copy-on-write, `exec`
//! replaces the address space with a lazily loaded image, `wait` reaps a
//! child exactly once, and `exit` publishes the status and releases every
//! resource in teardown order.

pub mod exec;
pub mod fork;
pub mod pcb;
pub mod wait;

use alloc::{collections::BTreeMap, sync::Arc};

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::fs::FdObject;
use crate::kernel::Kernel;

pub use exec::{exec, LoadedImage, Segment, IMAGE_MAGIC};
pub use fork::fork;
pub use pcb::{FdTable, Pcb, MAX_FDS};
pub use wait::Rendezvous;

/// Process identifier.
pub type Pid = u32;

/// Exit code for processes killed by the kernel.
pub const KILLED_EXIT_CODE: i32 = -1;

/// Kernel-wide process table.
pub struct ProcessTable {
    procs: Mutex<BTreeMap<Pid, Arc<Pcb>>>,
    next_pid: Mutex<Pid>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            procs: Mutex::new(BTreeMap::new()),
            next_pid: Mutex::new(1),
        }
    }

    pub fn alloc_pid(&self) -> Pid {
        let mut next = self.next_pid.lock();
        let pid = *next;
        *next += 1;
        pid
    }

    pub fn insert(&self, pcb: Arc<Pcb>) {
        self.procs.lock().insert(pcb.pid, pcb);
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.procs.lock().get(&pid).cloned()
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.procs.lock().remove(&pid)
    }

    pub fn count(&self) -> usize {
        self.procs.lock().len()
    }
}

/// The working directory, falling back to the filesystem root. The
/// returned reference is held; release with `fs.close_inode`.
pub fn cwd_or_root(kernel: &Kernel, pcb: &Arc<Pcb>) -> Arc<crate::fs::Inode> {
    let cwd = pcb.cwd.lock();
    match cwd.as_ref() {
        Some(inode) => kernel.fs.inodes.reopen(inode),
        None => kernel.fs.inodes.reopen(kernel.fs.root()),
    }
}

/// Release a descriptor object's inode references.
pub fn release_fd_object(kernel: &Kernel, obj: FdObject) -> KernelResult<()> {
    match obj {
        FdObject::Console | FdObject::PipeRead(_) | FdObject::PipeWrite(_) => Ok(()),
        // Each descriptor slot accounts for exactly one registry
        // reference (open, or the reopen taken at fork).
        FdObject::File(file) => kernel.fs.close_inode(file.inode()),
        FdObject::Dir(dir) => kernel.fs.close_inode(dir.inode()),
    }
}

/// Wait for a specific child; returns its status exactly once.
pub fn wait(kernel: &Kernel, parent: &Arc<Pcb>, child_pid: Pid) -> KernelResult<i32> {
    let rv = parent.child(child_pid).ok_or(KernelError::BadArg {
        what: "not a child of this process",
    })?;
    let status = rv.wait(&kernel.sched);
    parent.forget_child(child_pid);
    Ok(status)
}

/// Terminate a process: publish the exit status, then free the address
/// space, descriptors, executable denial, and working directory.
pub fn exit(kernel: &Kernel, pcb: &Arc<Pcb>, status: i32) -> KernelResult<()> {
    log::info!("{}: exit({})", pcb.name, status);

    // Memory-mapped regions write back before the SPT is destroyed.
    crate::mm::mmap::munmap_all(&kernel.vm, &pcb.vm)?;
    pcb.vm.destroy(&kernel.vm);
    kernel.vm.unregister(pcb.pid);

    let fds = pcb.fds.lock().drain();
    for obj in fds {
        release_fd_object(kernel, obj)?;
    }

    if let Some(exec) = pcb.exec_inode.lock().take() {
        exec.allow_write();
        kernel.fs.close_inode(&exec)?;
    }

    if let Some(cwd) = pcb.cwd.lock().take() {
        kernel.fs.close_inode(&cwd)?;
    }

    // User sync objects die with the process.
    pcb.user_locks.lock().clear();
    pcb.user_semas.lock().clear();

    // Wake the parent last, once the process state is consistent.
    pcb.rendezvous.publish(&kernel.sched, status);
    kernel.procs.remove(pcb.pid);

    // The main thread leaves the scheduler; the caller performs the
    // final context switch on bare metal.
    if let Some(tid) = pcb.main_tid.lock().take() {
        if kernel.sched.current() == Some(tid) {
            kernel.sched.exit_current();
        }
    }
    Ok(())
}
