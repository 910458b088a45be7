//! Architecture adaptation layer.
//!
//! The only module allowed to touch hardware. It exposes the narrow
//! contract the core relies on: interrupt state, power control, the
//! context switch, and (on bare metal) the IDT/PIC/PIT bring-up and the
//! hardware page-directory implementation. The host build substitutes
//! no-op interrupt control and process exit for power-off, which is all
//! the test harness needs.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

/// Disable maskable interrupts, returning whether they were enabled.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn intr_disable() -> bool {
    let enabled = ::x86_64::instructions::interrupts::are_enabled();
    ::x86_64::instructions::interrupts::disable();
    enabled
}

/// Restore the interrupt state returned by [`intr_disable`].
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn intr_restore(was_enabled: bool) {
    if was_enabled {
        ::x86_64::instructions::interrupts::enable();
    }
}

/// Halt forever (panic path).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn halt() -> ! {
    loop {
        ::x86_64::instructions::hlt();
    }
}

/// Power the machine off via the QEMU exit device.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn power_off(code: u32) -> ! {
    use ::x86_64::instructions::port::Port;
    // SAFETY: 0xF4 is the isa-debug-exit device; writing it terminates
    // the emulator.
    unsafe {
        let mut port = Port::new(0xF4);
        port.write(code);
    }
    halt()
}

// ---------------------------------------------------------------------
// Host substitutes
// ---------------------------------------------------------------------

#[cfg(not(target_os = "none"))]
pub fn intr_disable() -> bool {
    true
}

#[cfg(not(target_os = "none"))]
pub fn intr_restore(_was_enabled: bool) {}

#[cfg(not(target_os = "none"))]
pub fn halt() -> ! {
    std::process::exit(1)
}

#[cfg(not(target_os = "none"))]
pub fn power_off(code: u32) -> ! {
    std::process::exit(code as i32)
}

#[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
pub fn intr_disable() -> bool {
    false
}

#[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
pub fn intr_restore(_was_enabled: bool) {}

#[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
pub fn halt() -> ! {
    loop {
        core::hint::spin_loop();
    }
}

#[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
pub fn power_off(_code: u32) -> ! {
    halt()
}
