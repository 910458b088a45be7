//! User-visible synchronization objects and pipes.
//!
//! Locks and semaphores live in per-process tables indexed by small
//! opaque ids handed back from the init calls. They wrap the kernel
//! primitives directly, so donation and priority-ordered wakeups apply to
//! user threads too.

use alloc::sync::Arc;

use crate::error::KernelResult;
use crate::fs::{pipe, FdObject};
use crate::kernel::Kernel;
use crate::mm::user;
use crate::process::Pcb;
use crate::sync::{Lock, Semaphore};

pub fn sys_lock_init(kernel: &Kernel, pcb: &Arc<Pcb>) -> KernelResult<i32> {
    let id = pcb.alloc_usync_id();
    pcb.user_locks
        .lock()
        .insert(id, Arc::new(Lock::new(&kernel.sched)));
    Ok(id as i32)
}

pub fn sys_lock_acquire(pcb: &Arc<Pcb>, id: u32) -> KernelResult<i32> {
    let lock = pcb.user_locks.lock().get(&id).cloned();
    match lock {
        Some(lock) => {
            lock.acquire();
            Ok(0)
        }
        None => Ok(-1),
    }
}

pub fn sys_lock_release(pcb: &Arc<Pcb>, id: u32) -> KernelResult<i32> {
    let lock = pcb.user_locks.lock().get(&id).cloned();
    match lock {
        Some(lock) => {
            if !lock.held_by_current() {
                return Ok(-1);
            }
            lock.release();
            Ok(0)
        }
        None => Ok(-1),
    }
}

pub fn sys_sema_init(kernel: &Kernel, pcb: &Arc<Pcb>, value: u32) -> KernelResult<i32> {
    let id = pcb.alloc_usync_id();
    pcb.user_semas
        .lock()
        .insert(id, Arc::new(Semaphore::new(&kernel.sched, value)));
    Ok(id as i32)
}

pub fn sys_sema_down(pcb: &Arc<Pcb>, id: u32) -> KernelResult<i32> {
    let sema = pcb.user_semas.lock().get(&id).cloned();
    match sema {
        Some(sema) => {
            sema.down();
            Ok(0)
        }
        None => Ok(-1),
    }
}

pub fn sys_sema_up(pcb: &Arc<Pcb>, id: u32) -> KernelResult<i32> {
    let sema = pcb.user_semas.lock().get(&id).cloned();
    match sema {
        Some(sema) => {
            sema.up();
            Ok(0)
        }
        None => Ok(-1),
    }
}

/// Create a pipe; writes the two new descriptors to user memory.
pub fn sys_pipe(kernel: &Kernel, pcb: &Arc<Pcb>, fds_ptr: usize) -> KernelResult<i32> {
    let (reader, writer) = pipe::create_pipe();
    let (read_fd, write_fd) = {
        let mut fds = pcb.fds.lock();
        let read_fd = match fds.install(FdObject::PipeRead(reader)) {
            Ok(fd) => fd,
            Err(_) => return Ok(-1),
        };
        let write_fd = match fds.install(FdObject::PipeWrite(writer)) {
            Ok(fd) => fd,
            Err(_) => {
                let _ = fds.take(read_fd);
                return Ok(-1);
            }
        };
        (read_fd, write_fd)
    };
    user::write_u32(&kernel.vm, &pcb.vm, fds_ptr, read_fd as u32, pcb.user_esp())?;
    user::write_u32(
        &kernel.vm,
        &pcb.vm,
        fds_ptr + 4,
        write_fd as u32,
        pcb.user_esp(),
    )?;
    Ok(0)
}
