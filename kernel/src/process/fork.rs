//! Process forking.
//!
//! The child receives a copy-on-write clone of the parent's address
//! space, a descriptor table with every file reopened at the parent's
//! position, the same working directory (re-referenced), and a shared
//! rendezvous node for `wait`. The parent sees the child pid; the child's
//! resumed trap frame returns 0 (arranged by the syscall glue).

use alloc::{format, sync::Arc};

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::mm::ProcessVm;
use crate::sched::PRI_DEFAULT;

use super::{
    pcb::{clone_fds_for_fork, ChildRef, Pcb},
    Pid,
};

/// Fork the given process, returning the new child's PCB.
pub fn fork(kernel: &Kernel, parent: &Arc<Pcb>) -> KernelResult<Arc<Pcb>> {
    let child_pid = kernel.procs.alloc_pid();
    let child_vm = ProcessVm::new(child_pid, kernel.new_pagedir());
    kernel.vm.register(child_vm.clone());

    let result = build_child(kernel, parent, child_pid, &child_vm);
    match result {
        Ok(child) => Ok(child),
        Err(e) => {
            child_vm.destroy(&kernel.vm);
            kernel.vm.unregister(child_pid);
            Err(e)
        }
    }
}

fn build_child(
    kernel: &Kernel,
    parent: &Arc<Pcb>,
    child_pid: Pid,
    child_vm: &Arc<ProcessVm>,
) -> KernelResult<Arc<Pcb>> {
    // COW-clone the address space (see the SPT module for the pinning
    // and lock-release protocol).
    parent.vm.clone_into(&kernel.vm, child_vm)?;

    let child = Pcb::new(
        child_pid,
        format!("{}-child", parent.name),
        Some(parent.pid),
        child_vm.clone(),
    );

    // Descriptors: files reopened for independent positions.
    {
        let parent_fds = parent.fds.lock();
        *child.fds.lock() = clone_fds_for_fork(&kernel.fs, &parent_fds)?;
    }

    // Working directory travels with an extra reference.
    {
        let parent_cwd = parent.cwd.lock();
        if let Some(cwd) = parent_cwd.as_ref() {
            *child.cwd.lock() = Some(kernel.fs.inodes.reopen(cwd));
        }
    }

    // The child runs the same executable: hold and deny again.
    {
        let exec = parent.exec_inode.lock();
        if let Some(inode) = exec.as_ref() {
            let held = kernel.fs.inodes.reopen(inode);
            held.deny_write();
            *child.exec_inode.lock() = Some(held);
        }
    }

    // Same user stack pointer until the child's first syscall.
    child.set_user_esp(parent.user_esp());

    parent.children.lock().push(ChildRef {
        pid: child_pid,
        rv: child.rendezvous.clone(),
    });

    kernel.procs.insert(child.clone());

    // Give the child a schedulable thread tied to its pid.
    let tid = kernel.sched.spawn(&child.name, PRI_DEFAULT);
    kernel.sched.with_tcb(tid, |t| t.pid = Some(child_pid));
    *child.main_tid.lock() = Some(tid);

    Ok(child)
}
