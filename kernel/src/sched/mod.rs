//! Thread scheduling.
//!
//! [`Scheduler`] holds all scheduling state (thread table, ready queues,
//! sleep queue, donation graph) as pure state transitions; the bare-metal
//! context-switch glue lives in [`kthread`]. The kernel installs one global
//! instance at boot; tests build private instances.

pub mod fixed_point;
pub mod scheduler;
pub mod thread;

use alloc::sync::Arc;

use spin::Once;

pub use scheduler::{Acquire, CondId, SchedPolicy, Scheduler, SemaId, TICK_HZ, TIME_SLICE};
pub use thread::{LockId, ThreadState, Tid, KERNEL_STACK_SIZE, PRI_DEFAULT, PRI_MAX, PRI_MIN};

static SCHEDULER: Once<Arc<Scheduler>> = Once::new();

/// Install the global scheduler. Idempotent; the first caller wins.
pub fn init(policy: SchedPolicy) -> Arc<Scheduler> {
    SCHEDULER.call_once(|| Scheduler::new(policy)).clone()
}

/// The global scheduler, if booted.
pub fn try_global() -> Option<&'static Arc<Scheduler>> {
    SCHEDULER.get()
}

/// Give up the CPU briefly.
///
/// With a running scheduler this is a real yield; before the scheduler is
/// up (or on the host without a driver loop) it degrades to a spin hint.
/// Used by wait loops such as the buffer cache's load-complete wait.
pub fn relax() {
    match try_global() {
        Some(sched) if sched.current().is_some() => {
            sched.yield_current();
            kthread::switch(sched);
        }
        _ => core::hint::spin_loop(),
    }
}

/// Bare-metal thread bring-up and context switching.
pub mod kthread {
    use super::*;

    /// Perform the context switch chosen by the last state transition.
    ///
    /// On the host this is a no-op: tests drive `schedule()` directly and
    /// assert on the resulting schedule instead of switching stacks.
    #[cfg(not(target_os = "none"))]
    pub fn switch(sched: &Scheduler) {
        let _ = sched.schedule();
    }

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn switch(sched: &Scheduler) {
        use crate::arch::x86_64::context;
        let prev = sched.current();
        let next = sched.schedule();
        if let (Some(prev), Some(next)) = (prev, next) {
            if prev != next {
                context::switch_threads(sched, prev, next);
            }
        }
    }

    /// Spawn a kernel thread running `entry` on its own stack.
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    pub fn spawn(sched: &Arc<Scheduler>, name: &str, priority: u8, entry: extern "C" fn()) -> Tid {
        use crate::arch::x86_64::context;
        let tid = sched.spawn(name, priority);
        context::prepare_stack(sched, tid, entry);
        tid
    }
}
