//! Parent/child exit rendezvous.
//!
//! A [`Rendezvous`] is the shared node a child publishes its exit status
//! through and a parent waits on. It is reference-counted (an `Arc` held
//! by both sides) so it survives whichever party dies first, and a status
//! can be taken exactly once.

use alloc::sync::Arc;

use spin::Mutex;

use crate::sched::{kthread, Scheduler, Tid};

struct RvState {
    status: Option<i32>,
    reaped: bool,
    waiter: Option<Tid>,
}

/// Shared exit-status node.
pub struct Rendezvous {
    inner: Mutex<RvState>,
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self::new()
    }
}

impl Rendezvous {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RvState {
                status: None,
                reaped: false,
                waiter: None,
            }),
        }
    }

    /// Child side: publish the exit status and wake a waiting parent.
    pub fn publish(&self, sched: &Arc<Scheduler>, status: i32) {
        let waiter = {
            let mut state = self.inner.lock();
            state.status = Some(status);
            state.waiter.take()
        };
        if let Some(tid) = waiter {
            sched.unblock(tid);
        }
    }

    /// Parent side: take the status if published. Succeeds at most once.
    pub fn try_take(&self) -> Option<i32> {
        let mut state = self.inner.lock();
        if state.reaped {
            return None;
        }
        match state.status {
            Some(status) => {
                state.reaped = true;
                Some(status)
            }
            None => None,
        }
    }

    /// True once the status has been taken.
    pub fn reaped(&self) -> bool {
        self.inner.lock().reaped
    }

    /// Parent side: block until the child publishes. The registration and
    /// the blocking transition are ordered so a publish between them is
    /// not lost (publish wakes the registered tid; unblocking a thread
    /// that has not yet blocked leaves it READY).
    pub fn wait(&self, sched: &Arc<Scheduler>) -> i32 {
        loop {
            if let Some(status) = self.try_take() {
                return status;
            }
            let Some(tid) = sched.current() else {
                // No thread context (host diagnostics); spin politely.
                crate::sched::relax();
                continue;
            };
            {
                let mut state = self.inner.lock();
                if state.status.is_some() {
                    continue;
                }
                state.waiter = Some(tid);
            }
            sched.block_current();
            kthread::switch(sched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::{SchedPolicy, PRI_DEFAULT};

    #[test]
    fn status_is_taken_exactly_once() {
        let sched = Scheduler::new(SchedPolicy::Priority);
        sched.bootstrap("main", PRI_DEFAULT);
        let rv = Rendezvous::new();
        assert_eq!(rv.try_take(), None);
        rv.publish(&sched, 42);
        assert_eq!(rv.try_take(), Some(42));
        assert_eq!(rv.try_take(), None);
        assert!(rv.reaped());
    }

    #[test]
    fn publish_wakes_registered_waiter() {
        let sched = Scheduler::new(SchedPolicy::Priority);
        sched.bootstrap("parent", PRI_DEFAULT);
        let child = sched.spawn("child", PRI_DEFAULT);
        let rv = Arc::new(Rendezvous::new());
        // Simulate the child publishing from another thread context.
        rv.publish(&sched, 7);
        // The parent sees it immediately without blocking.
        assert_eq!(rv.wait(&sched), 7);
        let _ = child;
    }
}
