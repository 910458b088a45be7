//! Bounded user-page pool.
//!
//! Frames for user pages come from page-aligned heap allocations, counted
//! against a fixed cap so memory pressure (and therefore eviction) is
//! reproducible regardless of how much memory the machine has. The `-ul`
//! boot flag sets the cap.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::sync::Arc;
use core::{
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use super::PAGE_SIZE;

fn page_layout() -> Layout {
    // 4 KiB size and alignment: always valid.
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("static layout")
}

/// An owned, page-aligned, zero-initialized physical page.
pub struct KPage {
    ptr: NonNull<u8>,
    counter: Arc<AtomicUsize>,
}

// SAFETY: KPage exclusively owns its allocation; access is mediated by the
// frame table's locking and pinning discipline.
unsafe impl Send for KPage {}
// SAFETY: same ownership argument as Send; shared access goes through
// &self methods that only expose the raw pointer.
unsafe impl Sync for KPage {}

impl KPage {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// View the page bytes.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is PAGE_SIZE bytes, owned by self, and
        // lives until Drop.
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Mutate the page bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, plus &mut self guarantees exclusivity.
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }
}

impl Drop for KPage {
    fn drop(&mut self) {
        // SAFETY: ptr came from alloc_zeroed with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), page_layout()) };
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Allocator handing out up to `limit` pages.
pub struct PagePool {
    limit: usize,
    allocated: Arc<AtomicUsize>,
}

impl PagePool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            allocated: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Allocate a zeroed page, or None when the pool is exhausted (the
    /// caller evicts and retries).
    pub fn try_alloc(&self) -> Option<KPage> {
        let prev = self.allocated.fetch_add(1, Ordering::Relaxed);
        if prev >= self.limit {
            self.allocated.fetch_sub(1, Ordering::Relaxed);
            return None;
        }
        // SAFETY: page_layout is non-zero-size and valid.
        let raw = unsafe { alloc_zeroed(page_layout()) };
        match NonNull::new(raw) {
            Some(ptr) => Some(KPage {
                ptr,
                counter: self.allocated.clone(),
            }),
            None => {
                self.allocated.fetch_sub(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn in_use(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_enforces_its_cap() {
        let pool = PagePool::new(2);
        let a = pool.try_alloc().expect("first page");
        let _b = pool.try_alloc().expect("second page");
        assert!(pool.try_alloc().is_none());
        drop(a);
        assert!(pool.try_alloc().is_some());
    }

    #[test]
    fn pages_start_zeroed() {
        let pool = PagePool::new(1);
        let page = pool.try_alloc().expect("page");
        assert!(page.as_slice().iter().all(|b| *b == 0));
    }
}
