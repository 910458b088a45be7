//! Interrupt descriptor table and the top-half handlers.
//!
//! Hardware interrupts run with interrupts disabled and stay short: the
//! timer tick does its bookkeeping and requests a yield; everything
//! heavier is deferred to the bottom-half worker drained from
//! [`super::super::super::sched`]-scheduled threads. The system-call gate
//! (vector 0x30) is the one user-accessible vector.

use lazy_static::lazy_static;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::{gdt, pic};
use crate::mm::FaultInfo;
use crate::syscall::SyscallFrame;

/// Remapped timer vector.
pub const TIMER_VECTOR: u8 = pic::PIC_1_OFFSET;
/// User-accessible system-call vector.
pub const SYSCALL_VECTOR: u8 = 0x30;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: the IST index was installed in the GDT's TSS.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR].set_handler_fn(timer_handler);
        // User programs may issue `int 0x30`.
        idt[SYSCALL_VECTOR]
            .set_handler_fn(syscall_handler)
            .set_privilege_level(x86_64::PrivilegeLevel::Ring3);
        idt
    };
}

pub fn init() {
    IDT.load();
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, code: u64) -> ! {
    panic!("double fault (code {}): {:#?}", code, frame);
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    let yield_requested = match crate::kernel::global() {
        Some(kernel) => crate::timer::on_tick(kernel),
        None => false,
    };
    pic::end_of_interrupt(TIMER_VECTOR);
    if yield_requested {
        if let Some(kernel) = crate::kernel::global() {
            kernel.sched.yield_current();
            crate::sched::kthread::switch(&kernel.sched);
        }
    }
}

extern "x86-interrupt" fn page_fault_handler(
    frame: InterruptStackFrame,
    code: PageFaultErrorCode,
) {
    let addr = x86_64::registers::control::Cr2::read()
        .map(|a| a.as_u64() as usize)
        .unwrap_or(0);
    let write = code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let user = code.contains(PageFaultErrorCode::USER_MODE);

    let Some(kernel) = crate::kernel::global() else {
        panic!("page fault before kernel init at {:#x}", addr);
    };
    let Some(pcb) = kernel.current_process() else {
        panic!(
            "kernel page fault at {:#x} (ip {:#x})",
            addr,
            frame.instruction_pointer.as_u64()
        );
    };

    let esp = if user {
        frame.stack_pointer.as_u64() as usize
    } else {
        // Kernel-mode fault during a user copy: the saved user stack
        // pointer from syscall entry drives the growth heuristic.
        pcb.user_esp()
    };

    let info = FaultInfo { addr, write, esp };
    if crate::mm::handle_fault(&kernel.vm, &pcb.vm, &info).is_err() {
        log::warn!("{}: page fault at {:#x}, killed", pcb.name, addr);
        let _ = crate::process::exit(kernel, &pcb, crate::process::KILLED_EXIT_CODE);
        crate::sched::kthread::switch(&kernel.sched);
    }
}

extern "x86-interrupt" fn syscall_handler(frame: InterruptStackFrame) {
    let Some(kernel) = crate::kernel::global() else {
        return;
    };
    let mut sys_frame = SyscallFrame {
        usp: frame.stack_pointer.as_u64() as usize,
        retval: 0,
    };
    crate::syscall::dispatch(kernel, &mut sys_frame);
    // The return value lands in EAX through the trap glue in context.rs;
    // handlers that terminated the process never come back here.
    context_set_retval(sys_frame.retval);
}

/// Stash the syscall return value where the resume path loads EAX from.
fn context_set_retval(value: i32) {
    super::context::set_pending_retval(value);
}
