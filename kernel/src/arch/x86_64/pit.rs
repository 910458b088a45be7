//! 8253/8254 programmable interval timer.

use x86_64::instructions::port::Port;

use crate::sched::TICK_HZ;

const PIT_BASE_HZ: u32 = 1_193_182;

/// Program channel 0 for periodic interrupts at [`TICK_HZ`].
pub fn init() {
    let divisor = (PIT_BASE_HZ / TICK_HZ as u32) as u16;
    let mut command: Port<u8> = Port::new(0x43);
    let mut data: Port<u8> = Port::new(0x40);
    // SAFETY: standard PIT programming: channel 0, lobyte/hibyte, mode 2.
    unsafe {
        command.write(0x34u8);
        data.write((divisor & 0xFF) as u8);
        data.write((divisor >> 8) as u8);
    }
}
