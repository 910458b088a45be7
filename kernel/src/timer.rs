//! Timer tick plumbing.
//!
//! The hardware timer interrupt (or a test driving ticks by hand) calls
//! [`on_tick`]: the scheduler charges the running thread and wakes due
//! sleepers, and every 30 seconds the cache flusher is signaled. The
//! return value asks the interrupt epilogue to yield.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::fs::FLUSH_INTERVAL_TICKS;
use crate::kernel::Kernel;
use crate::sched::kthread;

static FLUSH_DUE: AtomicBool = AtomicBool::new(false);

/// One timer tick. Returns true when the interrupt return path should
/// yield the CPU.
pub fn on_tick(kernel: &Kernel) -> bool {
    let yield_requested = kernel.sched.tick();
    if kernel.sched.ticks() % FLUSH_INTERVAL_TICKS == 0 {
        FLUSH_DUE.store(true, Ordering::Release);
        // The flush itself is bottom-half work; the top half only queues.
        crate::irq::defer(crate::irq::BottomHalf::CacheFlush);
    }
    yield_requested
}

/// Consume the pending-flush signal (the flusher daemon polls this).
pub fn take_flush_due() -> bool {
    FLUSH_DUE.swap(false, Ordering::AcqRel)
}

/// Sleep the calling thread for `ticks` timer ticks. Never wakes early.
pub fn sleep_ticks(kernel: &Kernel, ticks: u64) {
    let until = kernel.sched.ticks() + ticks;
    if kernel.sched.sleep_current_until(until) == crate::sched::Acquire::Blocked {
        kthread::switch(&kernel.sched);
    }
}

/// Monotonic tick count since boot.
pub fn ticks(kernel: &Kernel) -> u64 {
    kernel.sched.ticks()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flusher_signal_fires_every_interval() {
        let kernel = Kernel::test_instance(2048, 8, 64).unwrap();
        let _ = take_flush_due();
        for _ in 0..FLUSH_INTERVAL_TICKS {
            on_tick(&kernel);
        }
        assert!(take_flush_due());
        assert!(!take_flush_due());
    }
}
