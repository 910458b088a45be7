//! Kernel context switch.
//!
//! Each thread's suspended state is its saved stack pointer; the stack
//! itself holds the callee-saved registers pushed by `switch_context`.
//! New threads get a hand-built stack whose return address is a
//! trampoline that enables interrupts and calls the entry function.

use core::arch::global_asm;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::sched::{Scheduler, Tid, KERNEL_STACK_SIZE};

global_asm!(
    r#"
    .global switch_context
    // switch_context(prev_sp_slot: *mut u64, next_sp: u64)
    switch_context:
        push rbp
        push rbx
        push r12
        push r13
        push r14
        push r15
        mov [rdi], rsp
        mov rsp, rsi
        pop r15
        pop r14
        pop r13
        pop r12
        pop rbx
        pop rbp
        ret

    .global kthread_entry_shim
    // First "return" target of a fresh thread: the entry pointer sits on
    // top of the stack; move it into the argument register and enter the
    // trampoline.
    kthread_entry_shim:
        pop rdi
        jmp kthread_trampoline
    "#
);

extern "C" {
    fn switch_context(prev_sp_slot: *mut u64, next_sp: u64);
    fn kthread_entry_shim();
}

static PENDING_RETVAL: AtomicI32 = AtomicI32::new(0);

/// Stash a syscall return value for the resume path.
pub fn set_pending_retval(value: i32) {
    PENDING_RETVAL.store(value, Ordering::Relaxed);
}

/// Trampoline for freshly spawned kernel threads.
#[no_mangle]
extern "C" fn kthread_trampoline(entry: extern "C" fn()) -> ! {
    x86_64::instructions::interrupts::enable();
    entry();
    if let Some(kernel) = crate::kernel::global() {
        kernel.sched.exit_current();
        switch_threads_current(&kernel.sched);
    }
    crate::arch::halt()
}

fn switch_threads_current(sched: &Scheduler) {
    if let (Some(prev), Some(next)) = (sched.current(), sched.schedule()) {
        if prev != next {
            switch_threads(sched, prev, next);
        }
    }
}

/// Switch from `prev` to `next`, saving/restoring the kernel stacks.
pub fn switch_threads(sched: &Scheduler, prev: Tid, next: Tid) {
    let was_enabled = crate::arch::intr_disable();
    let next_sp = sched
        .with_tcb(next, |t| t.saved_sp as u64)
        .unwrap_or_default();
    let mut prev_slot: u64 = 0;
    // SAFETY: prev_slot lives across the switch on prev's stack; the
    // scheduler's saved_sp is updated from it immediately after resume.
    unsafe { switch_context(&mut prev_slot, next_sp) };
    sched.with_tcb(prev, |t| t.saved_sp = prev_slot as usize);
    crate::arch::intr_restore(was_enabled);
}

/// Build a fresh thread stack whose first "return" lands in the entry
/// shim: six zeroed callee-saved slots, the shim's address, then the
/// entry pointer the shim pops.
pub fn prepare_stack(sched: &Scheduler, tid: Tid, entry: extern "C" fn()) {
    use alloc::boxed::Box;
    let mut stack = Box::new([0u8; KERNEL_STACK_SIZE]);
    let top = stack.as_mut_ptr() as usize + KERNEL_STACK_SIZE;
    let mut sp = top;
    // SAFETY: all stores land inside the freshly allocated stack.
    unsafe {
        sp -= 8;
        core::ptr::write(sp as *mut u64, entry as usize as u64);
        sp -= 8;
        core::ptr::write(sp as *mut u64, kthread_entry_shim as usize as u64);
        for _ in 0..6 {
            sp -= 8;
            core::ptr::write(sp as *mut u64, 0);
        }
    }
    sched.with_tcb(tid, |t| {
        t.saved_sp = sp;
        t.stack = Some(stack);
    });
}
