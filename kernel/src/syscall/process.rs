//! Process system calls.

use alloc::{string::String, sync::Arc, vec::Vec};

use crate::error::KernelResult;
use crate::kernel::Kernel;
use crate::mm::user;
use crate::process::{self, Pcb};
use crate::sched::{kthread, PRI_DEFAULT};

pub fn sys_halt(kernel: &Kernel) -> KernelResult<i32> {
    let _ = kernel.fs.unmount();
    crate::arch::power_off(0);
}

pub fn sys_exit(kernel: &Kernel, pcb: &Arc<Pcb>, status: i32) -> KernelResult<i32> {
    process::exit(kernel, pcb, status)?;
    kthread::switch(&kernel.sched);
    // Reached only on the host, where the caller's thread is the test
    // driver rather than a real user thread.
    Ok(status)
}

pub fn sys_exec(kernel: &Kernel, pcb: &Arc<Pcb>, cmdline: usize) -> KernelResult<i32> {
    let cmdline = user::read_cstring(&kernel.vm, &pcb.vm, cmdline, pcb.user_esp())?;
    let mut words = cmdline.split_whitespace();
    let Some(prog) = words.next() else {
        return Ok(-1);
    };
    let mut args: Vec<String> = Vec::new();
    args.push(String::from(prog));
    args.extend(words.map(String::from));
    match process::exec(kernel, pcb, prog, &args) {
        // The trap glue redirects the resumed context to the entry point.
        Ok(_entry) => Ok(0),
        Err(e) => {
            log::warn!("{}: exec '{}' failed: {}", pcb.name, prog, e);
            Ok(-1)
        }
    }
}

pub fn sys_wait(kernel: &Kernel, pcb: &Arc<Pcb>, child: u32) -> KernelResult<i32> {
    match process::wait(kernel, pcb, child) {
        Ok(status) => Ok(status),
        Err(_) => Ok(-1),
    }
}

pub fn sys_fork(kernel: &Kernel, pcb: &Arc<Pcb>) -> KernelResult<i32> {
    match process::fork(kernel, pcb) {
        Ok(child) => Ok(child.pid as i32),
        Err(e) => {
            log::warn!("{}: fork failed: {}", pcb.name, e);
            Ok(-1)
        }
    }
}

pub fn sys_pt_create(kernel: &Kernel, pcb: &Arc<Pcb>) -> KernelResult<i32> {
    let tid = kernel.sched.spawn(&pcb.name, PRI_DEFAULT);
    kernel.sched.with_tcb(tid, |t| t.pid = Some(pcb.pid));
    pcb.threads.lock().push(tid);
    Ok(tid as i32)
}

pub fn sys_pt_exit(kernel: &Kernel) -> KernelResult<i32> {
    kernel.sched.exit_current();
    kthread::switch(&kernel.sched);
    Ok(0)
}

pub fn sys_pt_join(kernel: &Kernel, pcb: &Arc<Pcb>, tid: u32) -> KernelResult<i32> {
    if !pcb.threads.lock().contains(&tid) {
        return Ok(-1);
    }
    // Join: wait until the thread leaves the scheduler.
    while kernel.sched.thread_state(tid).is_some() {
        crate::sched::relax();
    }
    pcb.threads.lock().retain(|t| *t != tid);
    Ok(0)
}
