//! x86_64 bare-metal support: GDT/TSS, IDT, PIC, PIT, VGA text console,
//! context switch, and the hardware page-directory implementation.

pub mod context;
pub mod gdt;
pub mod idt;
pub mod paging;
pub mod pic;
pub mod pit;
pub mod vga;

/// Bring the CPU and interrupt controllers up. Called once at boot with
/// interrupts disabled.
pub fn init() {
    gdt::init();
    idt::init();
    pic::init();
    pit::init();
    x86_64::instructions::interrupts::enable();
}
