//! VGA text-mode console.

use core::fmt;

use spin::Mutex;
use x86_64::instructions::interrupts;

const BUFFER: *mut u16 = 0xB8000 as *mut u16;
const WIDTH: usize = 80;
const HEIGHT: usize = 25;
const ATTR: u16 = 0x0700; // light grey on black

pub struct Writer {
    col: usize,
    row: usize,
}

pub static WRITER: Mutex<Writer> = Mutex::new(Writer { col: 0, row: 0 });

impl Writer {
    fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.newline(),
            byte => {
                if self.col >= WIDTH {
                    self.newline();
                }
                let offset = self.row * WIDTH + self.col;
                // SAFETY: offset < WIDTH * HEIGHT, inside the VGA buffer.
                unsafe { BUFFER.add(offset).write_volatile(ATTR | byte as u16) };
                self.col += 1;
            }
        }
    }

    fn newline(&mut self) {
        self.col = 0;
        if self.row + 1 < HEIGHT {
            self.row += 1;
            return;
        }
        // Scroll up one line.
        for row in 1..HEIGHT {
            for col in 0..WIDTH {
                // SAFETY: both offsets are inside the VGA buffer.
                unsafe {
                    let ch = BUFFER.add(row * WIDTH + col).read_volatile();
                    BUFFER.add((row - 1) * WIDTH + col).write_volatile(ch);
                }
            }
        }
        for col in 0..WIDTH {
            // SAFETY: in-bounds write of a blank cell.
            unsafe { BUFFER.add((HEIGHT - 1) * WIDTH + col).write_volatile(ATTR | b' ' as u16) };
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
        Ok(())
    }
}

/// Write a single byte to the console.
pub fn putc(byte: u8) {
    interrupts::without_interrupts(|| WRITER.lock().put_byte(byte));
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use fmt::Write;
    interrupts::without_interrupts(|| {
        let _ = WRITER.lock().write_fmt(args);
    });
}
