//! Virtual memory.
//!
//! [`Vm`] bundles the kernel-global frame table, swap table, and the
//! registry of per-process address spaces ([`spt::ProcessVm`]). Tests
//! construct private instances over a RAM disk and a simulated page
//! directory; the kernel wires one up at boot.

pub mod frame;
pub mod mmap;
pub mod page_fault;
pub mod page_pool;
pub mod pagedir;
pub mod spt;
pub mod swap;
pub mod user;

use alloc::{collections::BTreeMap, sync::Arc};

use spin::Mutex;

use crate::process::Pid;

pub use frame::{frame_alloc, FrameTable, PageRef};
pub use page_fault::{handle_fault, FaultInfo};
pub use pagedir::{FrameId, Mapping, PageDir, SimPageDir};
pub use spt::{FileBacking, FileSlice, ProcessVm, Spe, SpeKind};
pub use swap::{SwapSlot, SwapTable};

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// User/kernel boundary: user virtual addresses are below this.
pub const USER_LIMIT: usize = 0xC000_0000;

/// The user stack grows down from the boundary.
pub const STACK_TOP: usize = USER_LIMIT;

/// Stack ceiling: 8 MiB.
pub const STACK_MAX: usize = 8 * 1024 * 1024;

/// A fault this close under the stack pointer counts as stack growth
/// (PUSHA writes 32 bytes below ESP before moving it).
pub const STACK_SLOP: usize = 32;

/// Round an address down to its page base.
pub fn page_floor(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Round a size up to whole pages.
pub fn page_ceil(len: usize) -> usize {
    len.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Kernel-wide VM state.
pub struct Vm {
    pub frames: FrameTable,
    pub swap: SwapTable,
    procs: Mutex<BTreeMap<Pid, Arc<ProcessVm>>>,
}

impl Vm {
    pub fn new(max_frames: usize, swap: SwapTable) -> Arc<Self> {
        Arc::new(Self {
            frames: FrameTable::new(max_frames),
            swap,
            procs: Mutex::new(BTreeMap::new()),
        })
    }

    /// Register a process address space (fork/exec).
    pub fn register(&self, pvm: Arc<ProcessVm>) {
        self.procs.lock().insert(pvm.pid, pvm);
    }

    /// Remove a process address space (exit). The caller runs
    /// [`spt::ProcessVm::destroy`] first.
    pub fn unregister(&self, pid: Pid) {
        self.procs.lock().remove(&pid);
    }

    pub fn process(&self, pid: Pid) -> Option<Arc<ProcessVm>> {
        self.procs.lock().get(&pid).cloned()
    }

    pub fn process_count(&self) -> usize {
        self.procs.lock().len()
    }
}
