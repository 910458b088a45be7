//! Thread control blocks.

use alloc::{boxed::Box, string::String, vec::Vec};

use super::fixed_point::Fixed;
use crate::process::Pid;

/// Thread identifier, unique for the lifetime of the kernel.
pub type Tid = u32;

/// Identifier of a kernel lock registered with the scheduler.
pub type LockId = u32;

/// Lowest priority.
pub const PRI_MIN: u8 = 0;
/// Default priority.
pub const PRI_DEFAULT: u8 = 31;
/// Highest priority.
pub const PRI_MAX: u8 = 63;

/// Size of a kernel thread stack (bare metal).
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Thread states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Currently on the CPU. At most one thread is in this state.
    Running,
    /// Runnable, queued by effective priority.
    Ready,
    /// Waiting on a lock, semaphore, condition, sleep, or rendezvous.
    Blocked,
    /// Exited; stack reclaimed by the next thread to run.
    Dying,
}

/// A thread control block.
///
/// All cross-thread references are identifier handles resolved through the
/// scheduler's tables; the TCB itself never points at another TCB.
pub struct Tcb {
    pub tid: Tid,
    pub name: String,
    pub state: ThreadState,
    /// Priority set by the thread itself (or its creator).
    pub base_priority: u8,
    /// Base plus any donations from waiters on locks this thread holds.
    pub effective_priority: u8,
    /// Priority level this thread is currently queued at, if Ready.
    pub queued_at: Option<u8>,
    /// MLFQ niceness in [-20, 20].
    pub nice: i8,
    /// MLFQ recent CPU estimate.
    pub recent_cpu: Fixed,
    /// Absolute tick this thread sleeps until, if sleeping.
    pub wake_tick: Option<u64>,
    /// Lock this thread is blocked on, if any.
    pub waiting_on: Option<LockId>,
    /// Locks currently held.
    pub held_locks: Vec<LockId>,
    /// Owning process, if this is a user thread.
    pub pid: Option<Pid>,
    /// Ticks consumed of the current time slice.
    pub slice_ticks: u8,
    /// Saved stack pointer while suspended (bare metal).
    pub saved_sp: usize,
    /// Kernel stack backing store (bare metal; the bootstrap thread and
    /// host-test threads run on a borrowed stack and leave this empty).
    pub stack: Option<Box<[u8; KERNEL_STACK_SIZE]>>,
}

impl Tcb {
    pub fn new(tid: Tid, name: String, priority: u8) -> Self {
        Self {
            tid,
            name,
            state: ThreadState::Ready,
            base_priority: priority,
            effective_priority: priority,
            queued_at: None,
            nice: 0,
            recent_cpu: Fixed::ZERO,
            wake_tick: None,
            waiting_on: None,
            held_locks: Vec::new(),
            pid: None,
            slice_ticks: 0,
            saved_sp: 0,
            stack: None,
        }
    }
}
