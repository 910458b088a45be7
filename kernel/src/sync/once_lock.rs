//! Write-once global cells.
//!
//! A `no_std` stand-in for `std::sync::OnceLock`, used for kernel-global
//! state that is initialized exactly once during boot.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A cell that can be written to only once.
pub struct OnceLock<T> {
    inner: AtomicPtr<T>,
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            inner: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Get the value if initialized.
    pub fn get(&self) -> Option<&T> {
        let ptr = self.inner.load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // SAFETY: a non-null pointer was stored by `set` from
            // Box::into_raw, so it points at a live, fully initialized T
            // owned by this cell. Acquire pairs with the Release in `set`.
            Some(unsafe { &*ptr })
        }
    }

    /// Set the value. Returns Err(value) if already initialized.
    pub fn set(&self, value: T) -> Result<(), T> {
        let new = Box::into_raw(Box::new(value));
        match self.inner.compare_exchange(
            core::ptr::null_mut(),
            new,
            Ordering::Release,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                // SAFETY: the exchange failed, so `new` was never published
                // and we still exclusively own the allocation.
                let boxed = unsafe { Box::from_raw(new) };
                Err(*boxed)
            }
        }
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        let ptr = *self.inner.get_mut();
        if !ptr.is_null() {
            // SAFETY: the pointer came from Box::into_raw in `set` and is
            // dropped exactly once here.
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_once_then_read() {
        let cell: OnceLock<u32> = OnceLock::new();
        assert!(cell.get().is_none());
        assert!(cell.set(7).is_ok());
        assert_eq!(cell.get(), Some(&7));
        assert_eq!(cell.set(9), Err(9));
        assert_eq!(cell.get(), Some(&7));
    }
}
