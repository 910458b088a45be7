//! FerriteOS Kernel Library
//!
//! Core of the FerriteOS educational kernel: threads with priority donation,
//! demand-paged virtual memory with copy-on-write fork and swap, and a
//! journaled indexed-inode filesystem behind a write-back buffer cache.
//!
//! The crate builds two ways:
//! - **Bare metal** (`target_os = "none"`, x86_64): `no_std`, booted via the
//!   `bootloader_api` entry point in `main.rs`, with the hardware layer in
//!   [`arch`] live.
//! - **Host**: the same library compiles against `std`'s system allocator so
//!   the standard `#[test]` harness can exercise every subsystem against a
//!   RAM block device and a simulated page directory.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]

extern crate alloc;

// Host target: use the system allocator so unit tests can allocate normally.
#[cfg(not(target_os = "none"))]
extern crate std;
#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// Bare metal: kernel heap backed by a linked-list allocator.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initialize the kernel heap from a static arena.
///
/// Called once from the boot path before any allocation happens.
///
/// # Safety
///
/// `start..start+size` must be an exclusive, writable region that outlives
/// the kernel and is never used for anything else.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn heap_init(start: *mut u8, size: usize) {
    // SAFETY: forwarded caller contract; LockedHeap::init requires it.
    unsafe { ALLOCATOR.lock().init(start, size) }
}

#[macro_use]
pub mod print;

pub mod arch;
pub mod config;
pub mod error;
pub mod fs;
pub mod irq;
pub mod kernel;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod serial;
pub mod sync;
pub mod syscall;
pub mod timer;
