//! Serial console output.
//!
//! On bare metal this drives the 16550 UART at the conventional COM1 port.
//! On the host build, output goes to stderr so test logs interleave sanely
//! with the harness output.

use core::fmt;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use spin::Mutex;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
lazy_static::lazy_static! {
    static ref COM1: Mutex<uart_16550::SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; no other code owns it.
        let mut port = unsafe { uart_16550::SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

struct SerialWriter;

impl fmt::Write for SerialWriter {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        use fmt::Write;
        COM1.lock().write_str(s)
    }

    #[cfg(not(target_os = "none"))]
    fn write_str(&mut self, s: &str) -> fmt::Result {
        use std::io::Write;
        let _ = std::io::stderr().write_all(s.as_bytes());
        Ok(())
    }

    #[cfg(all(not(target_arch = "x86_64"), target_os = "none"))]
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}

/// Write a single byte to the serial console.
pub fn putc(byte: u8) {
    use fmt::Write;
    let _ = SerialWriter.write_str(core::str::from_utf8(&[byte]).unwrap_or("?"));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SerialWriter.write_fmt(args);
}
