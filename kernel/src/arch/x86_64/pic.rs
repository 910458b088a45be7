//! 8259 PIC cascade.

use pic8259::ChainedPics;
use spin::Mutex;

/// IRQ base after remapping (vectors 32..48).
pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

pub static PICS: Mutex<ChainedPics> =
    // SAFETY: the offsets avoid the CPU exception vectors.
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

pub fn init() {
    // SAFETY: standard PIC initialization sequence at the standard ports.
    unsafe { PICS.lock().initialize() };
}

/// Acknowledge an interrupt so the PIC delivers the next one.
pub fn end_of_interrupt(vector: u8) {
    // SAFETY: vector was delivered by this PIC pair.
    unsafe { PICS.lock().notify_end_of_interrupt(vector) };
}
