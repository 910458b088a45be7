//! Bottom-half work ring.
//!
//! Interrupt top halves run with interrupts disabled and must not block,
//! so anything heavy is queued here and drained by a worker thread at
//! thread level. The ring is fixed-size; a full ring drops the item (every
//! producer's work is idempotent or re-queued by the next tick).

use spin::Mutex;

use crate::fs::blockdev::Sector;
use crate::kernel::Kernel;

/// Capacity of the deferred-work ring.
pub const RING_CAPACITY: usize = 64;

/// Deferred work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BottomHalf {
    /// Flush dirty buffer-cache entries (periodic flusher).
    CacheFlush,
    /// Load a sector queued for read-ahead.
    Prefetch(Sector),
}

struct Ring {
    items: [Option<BottomHalf>; RING_CAPACITY],
    head: usize,
    tail: usize,
    len: usize,
}

static RING: Mutex<Ring> = Mutex::new(Ring {
    items: [None; RING_CAPACITY],
    head: 0,
    tail: 0,
    len: 0,
});

/// Queue work from a top half. Returns false when the ring is full and
/// the item was dropped.
pub fn defer(work: BottomHalf) -> bool {
    let mut ring = RING.lock();
    if ring.len == RING_CAPACITY {
        return false;
    }
    let tail = ring.tail;
    ring.items[tail] = Some(work);
    ring.tail = (tail + 1) % RING_CAPACITY;
    ring.len += 1;
    true
}

fn pop() -> Option<BottomHalf> {
    let mut ring = RING.lock();
    if ring.len == 0 {
        return None;
    }
    let head = ring.head;
    let item = ring.items[head].take();
    ring.head = (head + 1) % RING_CAPACITY;
    ring.len -= 1;
    item
}

/// Number of queued items (tests and diagnostics).
pub fn pending() -> usize {
    RING.lock().len
}

/// Drain queued work at thread level. Returns how many items ran.
pub fn drain(kernel: &Kernel) -> usize {
    let mut ran = 0;
    while let Some(work) = pop() {
        match work {
            BottomHalf::CacheFlush => {
                if let Err(e) = kernel.fs.flush() {
                    log::warn!("deferred flush: {}", e);
                }
            }
            BottomHalf::Prefetch(sector) => {
                kernel.fs.ctx.cache.prefetch(sector);
                if let Err(e) = kernel.fs.ctx.cache.drain_prefetch() {
                    log::warn!("read-ahead of sector {}: {}", sector, e);
                }
            }
        }
        ran += 1;
    }
    ran
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn ring_is_bounded_and_fifo() {
        // The ring is a process-wide global, so tolerate items other
        // tests may queue concurrently: track only our own sentinels.
        while pop().is_some() {}
        assert!(defer(BottomHalf::Prefetch(901)));
        assert!(defer(BottomHalf::Prefetch(902)));
        while defer(BottomHalf::Prefetch(999)) {}
        assert_eq!(pending(), RING_CAPACITY);
        assert!(!defer(BottomHalf::CacheFlush));

        let mut sentinels = Vec::new();
        while let Some(item) = pop() {
            if let BottomHalf::Prefetch(s) = item {
                if s == 901 || s == 902 {
                    sentinels.push(s);
                }
            }
        }
        assert_eq!(sentinels, [901, 902]);
    }
}
