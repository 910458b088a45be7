//! Kernel backend for the `log` facade.
//!
//! Routes `log::info!` and friends to the serial console with a severity
//! prefix and the originating module path. Installed once at boot (or by a
//! test helper); repeated installs are ignored.

use core::sync::atomic::{AtomicBool, Ordering};

use log::{LevelFilter, Metadata, Record};

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;
static INSTALLED: AtomicBool = AtomicBool::new(false);

impl log::Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!(
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger at the given level. Idempotent.
pub fn init(level: LevelFilter) {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return;
    }
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
