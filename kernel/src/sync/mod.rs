//! Kernel synchronization primitives.
//!
//! [`Lock`], [`Semaphore`], and [`Condition`] are thin handles over wait
//! state kept centrally in the scheduler, which walks donation chains under
//! a single lock. Plain shared data inside subsystems uses `spin::Mutex`
//! directly; these types are for waits that must suspend a thread.

pub mod once_lock;

use alloc::sync::Arc;

use crate::sched::{kthread, Acquire, CondId, LockId, Scheduler, SemaId};

pub use once_lock::OnceLock;

/// A sleeping mutual-exclusion lock with priority donation.
pub struct Lock {
    sched: Arc<Scheduler>,
    id: LockId,
}

impl Lock {
    pub fn new(sched: &Arc<Scheduler>) -> Self {
        Self {
            sched: sched.clone(),
            id: sched.lock_create(),
        }
    }

    pub fn id(&self) -> LockId {
        self.id
    }

    /// Acquire as the running thread, blocking on contention.
    pub fn acquire(&self) {
        let Some(tid) = self.sched.current() else {
            return;
        };
        if self.sched.lock_acquire(tid, self.id) == Acquire::Blocked {
            kthread::switch(&self.sched);
        }
    }

    /// Release as the running thread, yielding if the woken waiter
    /// outranks us.
    pub fn release(&self) {
        let Some(tid) = self.sched.current() else {
            return;
        };
        let (_woken, preempt) = self.sched.lock_release(tid, self.id);
        if preempt {
            self.sched.yield_current();
            kthread::switch(&self.sched);
        }
    }

    pub fn held_by_current(&self) -> bool {
        self.sched.lock_held_by(self.id) == self.sched.current()
            && self.sched.current().is_some()
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        self.sched.lock_destroy(self.id);
    }
}

/// A counting semaphore with a priority-ordered wait set.
pub struct Semaphore {
    sched: Arc<Scheduler>,
    id: SemaId,
}

impl Semaphore {
    pub fn new(sched: &Arc<Scheduler>, value: u32) -> Self {
        Self {
            sched: sched.clone(),
            id: sched.sema_create(value),
        }
    }

    pub fn down(&self) {
        let Some(tid) = self.sched.current() else {
            return;
        };
        if self.sched.sema_down(tid, self.id) == Acquire::Blocked {
            kthread::switch(&self.sched);
        }
    }

    pub fn up(&self) {
        let (_woken, preempt) = self.sched.sema_up(self.id);
        if preempt && self.sched.current().is_some() {
            self.sched.yield_current();
            kthread::switch(&self.sched);
        }
    }

    pub fn value(&self) -> u32 {
        self.sched.sema_value(self.id).unwrap_or(0)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.sched.sema_destroy(self.id);
    }
}

/// A condition variable, used with a [`Lock`].
pub struct Condition {
    sched: Arc<Scheduler>,
    id: CondId,
}

impl Condition {
    pub fn new(sched: &Arc<Scheduler>) -> Self {
        Self {
            sched: sched.clone(),
            id: sched.cond_create(),
        }
    }

    /// Atomically release `lock` and wait; the lock is held again when
    /// this returns.
    pub fn wait(&self, lock: &Lock) {
        let Some(tid) = self.sched.current() else {
            return;
        };
        self.sched.cond_wait(tid, self.id, lock.id());
        kthread::switch(&self.sched);
    }

    pub fn signal(&self) {
        self.sched.cond_signal(self.id);
    }

    pub fn broadcast(&self) {
        self.sched.cond_broadcast(self.id);
    }
}

impl Drop for Condition {
    fn drop(&mut self) {
        self.sched.cond_destroy(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{SchedPolicy, PRI_DEFAULT};

    #[test]
    fn uncontended_lock_round_trip() {
        let sched = Scheduler::new(SchedPolicy::Priority);
        sched.bootstrap("main", PRI_DEFAULT);
        let lock = Lock::new(&sched);
        lock.acquire();
        assert!(lock.held_by_current());
        lock.release();
        assert!(!lock.held_by_current());
    }

    #[test]
    fn semaphore_counts_without_waiters() {
        let sched = Scheduler::new(SchedPolicy::Priority);
        sched.bootstrap("main", PRI_DEFAULT);
        let sema = Semaphore::new(&sched, 2);
        sema.down();
        assert_eq!(sema.value(), 1);
        sema.up();
        assert_eq!(sema.value(), 2);
    }
}
