//! System-call dispatch.
//!
//! The trap stub hands over a [`SyscallFrame`] carrying the saved user
//! stack pointer. The call number and arguments are read *from the user
//! stack* with full validation: a bad pointer surfaces as `UserFault`,
//! which terminates the process with -1 instead of panicking the kernel.
//! Results land in the frame's return slot.

mod filesystem;
mod memory;
mod process;
mod usync;

use alloc::sync::Arc;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;
use crate::mm::user;
use crate::process::Pcb;

/// System call numbers (the user-side libc mirrors these).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    Halt = 0,
    Exit = 1,
    Exec = 2,
    Wait = 3,
    Fork = 4,
    Create = 5,
    Remove = 6,
    Open = 7,
    Filesize = 8,
    Read = 9,
    Write = 10,
    Seek = 11,
    Tell = 12,
    Close = 13,
    Mmap = 14,
    Munmap = 15,
    Chdir = 16,
    Mkdir = 17,
    Readdir = 18,
    Isdir = 19,
    Inumber = 20,
    Symlink = 21,
    Readlink = 22,
    PtCreate = 23,
    PtExit = 24,
    PtJoin = 25,
    LockInit = 26,
    LockAcquire = 27,
    LockRelease = 28,
    SemaInit = 29,
    SemaDown = 30,
    SemaUp = 31,
    Pipe = 32,
}

impl Syscall {
    pub fn from_u32(nr: u32) -> Option<Self> {
        if nr <= Self::Pipe as u32 {
            // SAFETY: the enum is repr(u32) with contiguous discriminants
            // 0..=Pipe, and nr was just range checked.
            Some(unsafe { core::mem::transmute::<u32, Syscall>(nr) })
        } else {
            None
        }
    }
}

/// Register state the trap stub exposes to the dispatcher.
#[derive(Debug, Clone, Copy)]
pub struct SyscallFrame {
    /// Saved user stack pointer; the call number sits at its base.
    pub usp: usize,
    /// Return value register.
    pub retval: i32,
}

/// Dispatch one system call. Unrecoverable user faults terminate the
/// process with -1.
pub fn dispatch(kernel: &Kernel, frame: &mut SyscallFrame) {
    let Some(pcb) = kernel.current_process() else {
        frame.retval = -1;
        return;
    };
    pcb.set_user_esp(frame.usp);
    match dispatch_for(kernel, &pcb, frame.usp) {
        Ok(value) => frame.retval = value,
        Err(KernelError::UserFault { addr }) => {
            log::warn!("{}: user fault at {:#x}, killed", pcb.name, addr);
            let _ = crate::process::exit(kernel, &pcb, crate::process::KILLED_EXIT_CODE);
            frame.retval = crate::process::KILLED_EXIT_CODE;
        }
        Err(_) => frame.retval = -1,
    }
}

/// Decode and route a call for a known process.
pub fn dispatch_for(kernel: &Kernel, pcb: &Arc<Pcb>, usp: usize) -> KernelResult<i32> {
    let nr = user::read_u32(&kernel.vm, &pcb.vm, usp, usp)?;
    let call = Syscall::from_u32(nr).ok_or(KernelError::BadArg {
        what: "unknown system call",
    })?;
    let arg = |i: usize| -> KernelResult<u32> {
        user::read_u32(&kernel.vm, &pcb.vm, usp + 4 * (i + 1), usp)
    };

    match call {
        Syscall::Halt => process::sys_halt(kernel),
        Syscall::Exit => process::sys_exit(kernel, pcb, arg(0)? as i32),
        Syscall::Exec => process::sys_exec(kernel, pcb, arg(0)? as usize),
        Syscall::Wait => process::sys_wait(kernel, pcb, arg(0)?),
        Syscall::Fork => process::sys_fork(kernel, pcb),
        Syscall::Create => filesystem::sys_create(kernel, pcb, arg(0)? as usize, arg(1)?),
        Syscall::Remove => filesystem::sys_remove(kernel, pcb, arg(0)? as usize),
        Syscall::Open => filesystem::sys_open(kernel, pcb, arg(0)? as usize),
        Syscall::Filesize => filesystem::sys_filesize(kernel, pcb, arg(0)? as usize),
        Syscall::Read => filesystem::sys_read(
            kernel,
            pcb,
            arg(0)? as usize,
            arg(1)? as usize,
            arg(2)? as usize,
        ),
        Syscall::Write => filesystem::sys_write(
            kernel,
            pcb,
            arg(0)? as usize,
            arg(1)? as usize,
            arg(2)? as usize,
        ),
        Syscall::Seek => filesystem::sys_seek(kernel, pcb, arg(0)? as usize, arg(1)?),
        Syscall::Tell => filesystem::sys_tell(kernel, pcb, arg(0)? as usize),
        Syscall::Close => filesystem::sys_close(kernel, pcb, arg(0)? as usize),
        Syscall::Mmap => memory::sys_mmap(kernel, pcb, arg(0)? as usize, arg(1)? as usize),
        Syscall::Munmap => memory::sys_munmap(kernel, pcb, arg(0)?),
        Syscall::Chdir => filesystem::sys_chdir(kernel, pcb, arg(0)? as usize),
        Syscall::Mkdir => filesystem::sys_mkdir(kernel, pcb, arg(0)? as usize),
        Syscall::Readdir => {
            filesystem::sys_readdir(kernel, pcb, arg(0)? as usize, arg(1)? as usize)
        }
        Syscall::Isdir => filesystem::sys_isdir(kernel, pcb, arg(0)? as usize),
        Syscall::Inumber => filesystem::sys_inumber(kernel, pcb, arg(0)? as usize),
        Syscall::Symlink => {
            filesystem::sys_symlink(kernel, pcb, arg(0)? as usize, arg(1)? as usize)
        }
        Syscall::Readlink => filesystem::sys_readlink(
            kernel,
            pcb,
            arg(0)? as usize,
            arg(1)? as usize,
            arg(2)? as usize,
        ),
        Syscall::PtCreate => process::sys_pt_create(kernel, pcb),
        Syscall::PtExit => process::sys_pt_exit(kernel),
        Syscall::PtJoin => process::sys_pt_join(kernel, pcb, arg(0)?),
        Syscall::LockInit => usync::sys_lock_init(kernel, pcb),
        Syscall::LockAcquire => usync::sys_lock_acquire(pcb, arg(0)?),
        Syscall::LockRelease => usync::sys_lock_release(pcb, arg(0)?),
        Syscall::SemaInit => usync::sys_sema_init(kernel, pcb, arg(0)?),
        Syscall::SemaDown => usync::sys_sema_down(pcb, arg(0)?),
        Syscall::SemaUp => usync::sys_sema_up(pcb, arg(0)?),
        Syscall::Pipe => usync::sys_pipe(kernel, pcb, arg(0)? as usize),
    }
}
