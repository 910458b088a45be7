//! Core scheduler: thread table, ready queues, sleep queue, and the
//! donation-aware lock/semaphore/condition state machines.
//!
//! All scheduling state lives behind one lock so priority-donation chains
//! can be walked atomically. The methods here are pure state transitions:
//! they never switch stacks themselves. The bare-metal glue in
//! [`super::kthread`] performs the actual context switch after a transition
//! picks a new thread; host tests drive the same transitions directly and
//! assert on the resulting schedule.

use alloc::{
    collections::{BTreeMap, VecDeque},
    string::String,
    sync::Arc,
    vec::Vec,
};

use spin::Mutex;

use super::{
    fixed_point::Fixed,
    thread::{LockId, Tcb, ThreadState, Tid, PRI_MAX, PRI_MIN},
};

/// Ticks per time slice.
pub const TIME_SLICE: u8 = 4;
/// Timer frequency used for MLFQ statistics.
pub const TICK_HZ: u64 = 100;
/// Donation chains longer than this indicate a cycle; walking stops.
const DONATION_DEPTH: usize = 32;

/// Identifier of a kernel semaphore registered with the scheduler.
pub type SemaId = u32;
/// Identifier of a kernel condition variable registered with the scheduler.
pub type CondId = u32;

/// Scheduling policy, selected at boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    /// Strict priorities [0, 63] with donation; round-robin ties.
    Priority,
    /// Multilevel feedback queue driven by `recent_cpu` and `nice`.
    Mlfqs,
}

/// Outcome of an acquire-style operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The resource was granted immediately.
    Granted,
    /// The calling thread is now blocked; it owns the resource when it next
    /// runs (locks and semaphores are handed off directly on release).
    Blocked,
}

struct KLock {
    holder: Option<Tid>,
    waiters: Vec<Tid>,
}

struct KSema {
    value: u32,
    waiters: Vec<Tid>,
}

struct KCond {
    /// Waiting thread and the lock it must reacquire when signaled.
    waiters: Vec<(Tid, LockId)>,
}

struct SchedState {
    policy: SchedPolicy,
    threads: BTreeMap<Tid, Tcb>,
    /// Ready threads bucketed by effective priority; front of each bucket
    /// runs first, giving round-robin within a priority level.
    ready: BTreeMap<u8, VecDeque<Tid>>,
    current: Option<Tid>,
    /// Sleeping threads keyed by absolute wake tick.
    sleepers: BTreeMap<u64, Vec<Tid>>,
    locks: BTreeMap<LockId, KLock>,
    semas: BTreeMap<SemaId, KSema>,
    conds: BTreeMap<CondId, KCond>,
    reap: Vec<Tid>,
    next_tid: Tid,
    next_lock: LockId,
    next_sema: SemaId,
    next_cond: CondId,
    ticks: u64,
    load_avg: Fixed,
}

/// The scheduler. One instance per kernel; tests build private ones.
pub struct Scheduler {
    state: Mutex<SchedState>,
}

impl Scheduler {
    pub fn new(policy: SchedPolicy) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedState {
                policy,
                threads: BTreeMap::new(),
                ready: BTreeMap::new(),
                current: None,
                sleepers: BTreeMap::new(),
                locks: BTreeMap::new(),
                semas: BTreeMap::new(),
                conds: BTreeMap::new(),
                reap: Vec::new(),
                next_tid: 1,
                next_lock: 1,
                next_sema: 1,
                next_cond: 1,
                ticks: 0,
                load_avg: Fixed::ZERO,
            }),
        })
    }

    /// Register the caller's context as the initial RUNNING thread.
    pub fn bootstrap(&self, name: &str, priority: u8) -> Tid {
        let mut s = self.state.lock();
        let tid = s.alloc_tid();
        let mut tcb = Tcb::new(tid, String::from(name), priority);
        tcb.state = ThreadState::Running;
        s.threads.insert(tid, tcb);
        s.current = Some(tid);
        tid
    }

    /// Create a READY thread. The bare-metal spawn path in `kthread` wraps
    /// this with stack and context setup.
    pub fn spawn(&self, name: &str, priority: u8) -> Tid {
        let mut s = self.state.lock();
        let tid = s.alloc_tid();
        let tcb = Tcb::new(tid, String::from(name), priority);
        s.threads.insert(tid, tcb);
        s.ready_insert(tid);
        tid
    }

    pub fn current(&self) -> Option<Tid> {
        self.state.lock().current
    }

    pub fn thread_state(&self, tid: Tid) -> Option<ThreadState> {
        self.state.lock().threads.get(&tid).map(|t| t.state)
    }

    /// Effective (donation-adjusted) priority.
    pub fn priority_of(&self, tid: Tid) -> u8 {
        self.state.lock().tcb(tid).effective_priority
    }

    pub fn base_priority_of(&self, tid: Tid) -> u8 {
        self.state.lock().tcb(tid).base_priority
    }

    /// Set a thread's base priority. Returns true when the caller should
    /// yield because a ready thread now outranks the running one.
    pub fn set_priority(&self, tid: Tid, priority: u8) -> bool {
        let mut s = self.state.lock();
        if s.policy == SchedPolicy::Mlfqs {
            return false;
        }
        s.tcb_mut(tid).base_priority = priority.min(PRI_MAX);
        s.recompute_effective(tid);
        if let Some(lock) = s.tcb(tid).waiting_on {
            s.donate_along(lock);
        }
        s.should_preempt()
    }

    pub fn set_nice(&self, tid: Tid, nice: i8) -> bool {
        let mut s = self.state.lock();
        s.tcb_mut(tid).nice = nice.clamp(-20, 20);
        if s.policy == SchedPolicy::Mlfqs {
            s.mlfqs_refresh_one(tid);
        }
        s.should_preempt()
    }

    pub fn nice_of(&self, tid: Tid) -> i8 {
        self.state.lock().tcb(tid).nice
    }

    /// `recent_cpu` scaled by 100, rounded.
    pub fn recent_cpu_hundredths(&self, tid: Tid) -> i32 {
        self.state.lock().tcb(tid).recent_cpu.mul_int(100).to_int_round()
    }

    /// `load_avg` scaled by 100, rounded.
    pub fn load_avg_hundredths(&self) -> i32 {
        self.state.lock().load_avg.mul_int(100).to_int_round()
    }

    pub fn ticks(&self) -> u64 {
        self.state.lock().ticks
    }

    /// Run a closure against a TCB (context-switch glue and process wiring).
    pub fn with_tcb<R>(&self, tid: Tid, f: impl FnOnce(&mut Tcb) -> R) -> Option<R> {
        let mut s = self.state.lock();
        s.threads.get_mut(&tid).map(f)
    }

    /// True when a ready thread outranks the running one.
    pub fn should_preempt(&self) -> bool {
        self.state.lock().should_preempt()
    }

    // -----------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------

    /// Move the running thread to the back of its ready bucket.
    pub fn yield_current(&self) {
        let mut s = self.state.lock();
        if let Some(cur) = s.current {
            if s.tcb(cur).state == ThreadState::Running {
                s.tcb_mut(cur).state = ThreadState::Ready;
                s.ready_insert(cur);
            }
        }
    }

    /// Mark the running thread BLOCKED (the caller has already queued it on
    /// whatever it waits for).
    pub fn block_current(&self) {
        let mut s = self.state.lock();
        if let Some(cur) = s.current {
            s.tcb_mut(cur).state = ThreadState::Blocked;
        }
    }

    /// Unblock a thread. Returns true when the woken thread outranks the
    /// running one and the caller should yield.
    pub fn unblock(&self, tid: Tid) -> bool {
        let mut s = self.state.lock();
        s.wake(tid);
        s.should_preempt()
    }

    /// Mark the running thread DYING. Its TCB and stack are reclaimed on
    /// the next `schedule` that runs after the switch away from it.
    pub fn exit_current(&self) {
        let mut s = self.state.lock();
        if let Some(cur) = s.current.take() {
            s.tcb_mut(cur).state = ThreadState::Dying;
            s.reap.push(cur);
            s.current = Some(cur);
        }
    }

    /// Pick the next thread to run and update `current`.
    ///
    /// The previous thread keeps whatever non-RUNNING state the caller set;
    /// a still-RUNNING previous thread is requeued (preemption). Returns
    /// the new running thread, or None when nothing is runnable.
    pub fn schedule(&self) -> Option<Tid> {
        let mut s = self.state.lock();
        let prev = s.current;
        if let Some(prev) = prev {
            if s.tcb(prev).state == ThreadState::Running {
                s.tcb_mut(prev).state = ThreadState::Ready;
                s.ready_insert(prev);
            }
        }
        let next = s.pop_highest();
        s.current = next;
        if let Some(tid) = next {
            let t = s.tcb_mut(tid);
            t.state = ThreadState::Running;
            t.slice_ticks = 0;
        }
        // Reap DYING threads, but never the one we are switching away from:
        // its stack is still live until the switch completes.
        let cur = s.current;
        let dead: Vec<Tid> = s
            .reap
            .iter()
            .copied()
            .filter(|t| Some(*t) != cur && Some(*t) != prev)
            .collect();
        s.reap.retain(|t| Some(*t) == cur || Some(*t) == prev);
        for tid in dead {
            s.threads.remove(&tid);
        }
        next
    }

    /// Sleep the running thread until the given absolute tick.
    ///
    /// Wakeups never fire early; a target at or before the current tick
    /// returns without blocking.
    pub fn sleep_current_until(&self, wake_tick: u64) -> Acquire {
        let mut s = self.state.lock();
        if wake_tick <= s.ticks {
            return Acquire::Granted;
        }
        let Some(cur) = s.current else {
            return Acquire::Granted;
        };
        s.tcb_mut(cur).state = ThreadState::Blocked;
        s.tcb_mut(cur).wake_tick = Some(wake_tick);
        s.sleepers.entry(wake_tick).or_default().push(cur);
        Acquire::Blocked
    }

    /// Timer-tick bookkeeping: wake due sleepers, charge the running
    /// thread, refresh MLFQ statistics. Returns true when the interrupt
    /// epilogue should yield.
    pub fn tick(&self) -> bool {
        let mut s = self.state.lock();
        s.ticks += 1;
        let now = s.ticks;

        // Wake sleepers whose deadlines elapsed.
        let due: Vec<u64> = s
            .sleepers
            .range(..=now)
            .map(|(tick, _)| *tick)
            .collect();
        for tick in due {
            if let Some(tids) = s.sleepers.remove(&tick) {
                for tid in tids {
                    s.tcb_mut(tid).wake_tick = None;
                    s.wake(tid);
                }
            }
        }

        let mut yield_needed = false;
        if let Some(cur) = s.current {
            if s.policy == SchedPolicy::Mlfqs {
                let t = s.tcb_mut(cur);
                t.recent_cpu = t.recent_cpu.add_int(1);
            }
            let t = s.tcb_mut(cur);
            t.slice_ticks = t.slice_ticks.saturating_add(1);
            if t.slice_ticks >= TIME_SLICE {
                yield_needed = true;
            }
        }

        if s.policy == SchedPolicy::Mlfqs {
            if now % TICK_HZ == 0 {
                s.mlfqs_refresh_load();
            }
            if now % 4 == 0 {
                s.mlfqs_refresh_all();
            }
        }

        yield_needed || s.should_preempt()
    }

    // -----------------------------------------------------------------
    // Locks with priority donation
    // -----------------------------------------------------------------

    pub fn lock_create(&self) -> LockId {
        let mut s = self.state.lock();
        let id = s.next_lock;
        s.next_lock += 1;
        s.locks.insert(
            id,
            KLock {
                holder: None,
                waiters: Vec::new(),
            },
        );
        id
    }

    pub fn lock_destroy(&self, id: LockId) {
        self.state.lock().locks.remove(&id);
    }

    pub fn lock_held_by(&self, id: LockId) -> Option<Tid> {
        self.state.lock().locks.get(&id).and_then(|l| l.holder)
    }

    /// Acquire on behalf of `tid`. On contention the thread blocks, records
    /// itself as waiting, and donates its effective priority along the
    /// holder chain.
    pub fn lock_acquire(&self, tid: Tid, id: LockId) -> Acquire {
        let mut s = self.state.lock();
        s.lock_acquire_inner(tid, id)
    }

    /// Release. Hands the lock to the highest-priority waiter (waking it)
    /// and recomputes the releaser's effective priority. Returns the new
    /// holder, if any; the second element is true when the caller should
    /// yield to the woken thread.
    pub fn lock_release(&self, tid: Tid, id: LockId) -> (Option<Tid>, bool) {
        let mut s = self.state.lock();
        let woken = s.lock_release_inner(tid, id);
        let preempt = s.should_preempt();
        (woken, preempt)
    }

    // -----------------------------------------------------------------
    // Semaphores
    // -----------------------------------------------------------------

    pub fn sema_create(&self, value: u32) -> SemaId {
        let mut s = self.state.lock();
        let id = s.next_sema;
        s.next_sema += 1;
        s.semas.insert(
            id,
            KSema {
                value,
                waiters: Vec::new(),
            },
        );
        id
    }

    pub fn sema_destroy(&self, id: SemaId) {
        self.state.lock().semas.remove(&id);
    }

    pub fn sema_value(&self, id: SemaId) -> Option<u32> {
        self.state.lock().semas.get(&id).map(|s| s.value)
    }

    pub fn sema_down(&self, tid: Tid, id: SemaId) -> Acquire {
        let mut s = self.state.lock();
        let Some(sema) = s.semas.get_mut(&id) else {
            return Acquire::Granted;
        };
        if sema.value > 0 {
            sema.value -= 1;
            return Acquire::Granted;
        }
        sema.waiters.push(tid);
        s.block_thread(tid);
        Acquire::Blocked
    }

    /// Up. Wakes the highest-priority waiter (handing it the unit) or,
    /// with no waiters, increments the count. Returns the woken thread and
    /// a yield hint.
    pub fn sema_up(&self, id: SemaId) -> (Option<Tid>, bool) {
        let mut s = self.state.lock();
        let woken = {
            let Some(sema) = s.semas.get_mut(&id) else {
                return (None, false);
            };
            if sema.waiters.is_empty() {
                sema.value += 1;
                None
            } else {
                let idx = s.highest_waiter_index(id);
                s.semas.get_mut(&id).map(|sm| sm.waiters.remove(idx))
            }
        };
        if let Some(tid) = woken {
            s.wake(tid);
        }
        (woken, s.should_preempt())
    }

    // -----------------------------------------------------------------
    // Condition variables
    // -----------------------------------------------------------------

    pub fn cond_create(&self) -> CondId {
        let mut s = self.state.lock();
        let id = s.next_cond;
        s.next_cond += 1;
        s.conds.insert(
            id,
            KCond {
                waiters: Vec::new(),
            },
        );
        id
    }

    pub fn cond_destroy(&self, id: CondId) {
        self.state.lock().conds.remove(&id);
    }

    /// Atomically release `lock` and wait on `cond`. The caller reacquires
    /// the lock after being signaled (the signal path queues the thread on
    /// the lock, so waking implies the lock is held again).
    pub fn cond_wait(&self, tid: Tid, cond: CondId, lock: LockId) {
        let mut s = self.state.lock();
        debug_assert_eq!(
            s.locks.get(&lock).and_then(|l| l.holder),
            Some(tid),
            "cond_wait without holding the lock"
        );
        s.lock_release_inner(tid, lock);
        if let Some(c) = s.conds.get_mut(&cond) {
            c.waiters.push((tid, lock));
        }
        s.block_thread(tid);
    }

    /// Wake the highest-priority waiter and move it to the lock: if the
    /// lock is free the waiter becomes its holder and turns READY, else it
    /// joins the lock's wait set (donating as usual).
    pub fn cond_signal(&self, cond: CondId) -> Option<Tid> {
        let mut s = self.state.lock();
        s.cond_signal_inner(cond)
    }

    pub fn cond_broadcast(&self, cond: CondId) {
        let mut s = self.state.lock();
        while s.cond_signal_inner(cond).is_some() {}
    }
}

impl SchedState {
    fn alloc_tid(&mut self) -> Tid {
        let tid = self.next_tid;
        self.next_tid += 1;
        tid
    }

    fn tcb(&self, tid: Tid) -> &Tcb {
        self.threads.get(&tid).expect("unknown tid")
    }

    fn tcb_mut(&mut self, tid: Tid) -> &mut Tcb {
        self.threads.get_mut(&tid).expect("unknown tid")
    }

    fn ready_insert(&mut self, tid: Tid) {
        let pri = self.tcb(tid).effective_priority;
        self.ready.entry(pri).or_default().push_back(tid);
        let t = self.tcb_mut(tid);
        t.queued_at = Some(pri);
        t.state = ThreadState::Ready;
    }

    fn ready_remove(&mut self, tid: Tid) {
        if let Some(pri) = self.tcb(tid).queued_at {
            if let Some(bucket) = self.ready.get_mut(&pri) {
                bucket.retain(|t| *t != tid);
                if bucket.is_empty() {
                    self.ready.remove(&pri);
                }
            }
            self.tcb_mut(tid).queued_at = None;
        }
    }

    fn pop_highest(&mut self) -> Option<Tid> {
        let (&pri, _) = self.ready.last_key_value()?;
        let bucket = self.ready.get_mut(&pri)?;
        let tid = bucket.pop_front();
        if bucket.is_empty() {
            self.ready.remove(&pri);
        }
        if let Some(tid) = tid {
            self.tcb_mut(tid).queued_at = None;
        }
        tid
    }

    fn highest_ready_priority(&self) -> Option<u8> {
        self.ready.last_key_value().map(|(p, _)| *p)
    }

    fn should_preempt(&self) -> bool {
        match (self.current, self.highest_ready_priority()) {
            (Some(cur), Some(top)) => {
                let t = self.tcb(cur);
                t.state != ThreadState::Running || top > t.effective_priority
            }
            (None, Some(_)) => true,
            _ => false,
        }
    }

    fn wake(&mut self, tid: Tid) {
        let state = self.tcb(tid).state;
        if state == ThreadState::Blocked {
            self.ready_insert(tid);
        }
    }

    /// Block a thread that may be RUNNING (the usual case) or READY (a
    /// signal redirected it onto a lock before it ever ran).
    fn block_thread(&mut self, tid: Tid) {
        self.ready_remove(tid);
        self.tcb_mut(tid).state = ThreadState::Blocked;
    }

    /// Recompute `effective = max(base, waiters of held locks)` and
    /// reposition the thread in its ready bucket if the value moved.
    fn recompute_effective(&mut self, tid: Tid) {
        if self.policy == SchedPolicy::Mlfqs {
            return;
        }
        let mut eff = self.tcb(tid).base_priority;
        let held = self.tcb(tid).held_locks.clone();
        for lid in held {
            if let Some(lock) = self.locks.get(&lid) {
                for w in &lock.waiters {
                    if let Some(wt) = self.threads.get(w) {
                        eff = eff.max(wt.effective_priority);
                    }
                }
            }
        }
        let old = self.tcb(tid).effective_priority;
        if old != eff {
            self.tcb_mut(tid).effective_priority = eff;
            if self.tcb(tid).queued_at.is_some() {
                self.ready_remove(tid);
                self.ready_insert(tid);
            }
        }
    }

    /// Propagate donations along the chain of holders starting at `lock`.
    fn donate_along(&mut self, lock: LockId) {
        let mut cur = lock;
        for _ in 0..DONATION_DEPTH {
            let Some(holder) = self.locks.get(&cur).and_then(|l| l.holder) else {
                break;
            };
            self.recompute_effective(holder);
            match self.tcb(holder).waiting_on {
                Some(next) => cur = next,
                None => break,
            }
        }
    }

    fn lock_acquire_inner(&mut self, tid: Tid, id: LockId) -> Acquire {
        let lock = self.locks.get_mut(&id).expect("unknown lock");
        debug_assert_ne!(lock.holder, Some(tid), "recursive lock acquire");
        if lock.holder.is_none() {
            lock.holder = Some(tid);
            self.tcb_mut(tid).held_locks.push(id);
            return Acquire::Granted;
        }
        lock.waiters.push(tid);
        self.tcb_mut(tid).waiting_on = Some(id);
        self.block_thread(tid);
        self.donate_along(id);
        Acquire::Blocked
    }

    fn lock_release_inner(&mut self, tid: Tid, id: LockId) -> Option<Tid> {
        debug_assert_eq!(
            self.locks.get(&id).and_then(|l| l.holder),
            Some(tid),
            "release of a lock not held"
        );
        self.tcb_mut(tid).held_locks.retain(|l| *l != id);
        self.recompute_effective(tid);

        let has_waiters = self
            .locks
            .get(&id)
            .map(|l| !l.waiters.is_empty())
            .unwrap_or(false);
        if !has_waiters {
            if let Some(lock) = self.locks.get_mut(&id) {
                lock.holder = None;
            }
            return None;
        }

        let idx = self.highest_lock_waiter_index(id);
        let next = {
            let lock = self.locks.get_mut(&id).expect("unknown lock");
            let next = lock.waiters.remove(idx);
            lock.holder = Some(next);
            next
        };
        {
            let t = self.tcb_mut(next);
            t.waiting_on = None;
            t.held_locks.push(id);
        }
        // The new holder inherits donations from any waiters still queued.
        self.recompute_effective(next);
        self.wake(next);
        Some(next)
    }

    fn cond_signal_inner(&mut self, cond: CondId) -> Option<Tid> {
        let (idx, _) = {
            let c = self.conds.get(&cond)?;
            c.waiters
                .iter()
                .enumerate()
                .max_by_key(|(i, (tid, _))| {
                    (self.threads.get(tid).map(|t| t.effective_priority), core::cmp::Reverse(*i))
                })?
        };
        let (tid, lock_id) = self.conds.get_mut(&cond)?.waiters.remove(idx);
        let lock = self.locks.get_mut(&lock_id)?;
        if lock.holder.is_none() {
            lock.holder = Some(tid);
            self.tcb_mut(tid).held_locks.push(lock_id);
            self.wake(tid);
        } else {
            lock.waiters.push(tid);
            self.tcb_mut(tid).waiting_on = Some(lock_id);
            self.donate_along(lock_id);
        }
        Some(tid)
    }

    fn highest_lock_waiter_index(&self, id: LockId) -> usize {
        let lock = &self.locks[&id];
        let mut best = 0;
        let mut best_pri = 0;
        for (i, w) in lock.waiters.iter().enumerate() {
            let pri = self.threads.get(w).map(|t| t.effective_priority).unwrap_or(0);
            if pri > best_pri || i == 0 {
                best = i;
                best_pri = pri;
            }
        }
        best
    }

    fn highest_waiter_index(&self, id: SemaId) -> usize {
        let sema = &self.semas[&id];
        let mut best = 0;
        let mut best_pri = 0;
        for (i, w) in sema.waiters.iter().enumerate() {
            let pri = self.threads.get(w).map(|t| t.effective_priority).unwrap_or(0);
            if pri > best_pri || i == 0 {
                best = i;
                best_pri = pri;
            }
        }
        best
    }

    // -----------------------------------------------------------------
    // MLFQ statistics
    // -----------------------------------------------------------------

    fn mlfqs_priority(recent_cpu: Fixed, nice: i8) -> u8 {
        let pri = PRI_MAX as i32 - recent_cpu.div_int(4).to_int() - nice as i32 * 2;
        pri.clamp(PRI_MIN as i32, PRI_MAX as i32) as u8
    }

    fn mlfqs_refresh_one(&mut self, tid: Tid) {
        let t = self.tcb(tid);
        let pri = Self::mlfqs_priority(t.recent_cpu, t.nice);
        let t = self.tcb_mut(tid);
        t.base_priority = pri;
        if t.effective_priority != pri {
            t.effective_priority = pri;
            if self.tcb(tid).queued_at.is_some() {
                self.ready_remove(tid);
                self.ready_insert(tid);
            }
        }
    }

    fn mlfqs_refresh_all(&mut self) {
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in tids {
            self.mlfqs_refresh_one(tid);
        }
    }

    /// Once per second: update `load_avg` and decay every `recent_cpu`.
    fn mlfqs_refresh_load(&mut self) {
        let mut ready_count = self
            .ready
            .values()
            .map(|bucket| bucket.len() as i32)
            .sum::<i32>();
        if self.current.is_some() {
            ready_count += 1;
        }
        self.load_avg = Fixed::ratio(59, 60)
            .mul(self.load_avg)
            .add(Fixed::ratio(1, 60).mul_int(ready_count));

        let twice_load = self.load_avg.mul_int(2);
        let decay = twice_load.div(twice_load.add_int(1));
        let tids: Vec<Tid> = self.threads.keys().copied().collect();
        for tid in tids {
            let t = self.tcb_mut(tid);
            t.recent_cpu = decay.mul(t.recent_cpu).add_int(t.nice as i32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::thread::PRI_DEFAULT;

    fn sched() -> Arc<Scheduler> {
        Scheduler::new(SchedPolicy::Priority)
    }

    #[test]
    fn highest_priority_runs_first_with_round_robin_ties() {
        let s = sched();
        s.bootstrap("main", PRI_DEFAULT);
        let a = s.spawn("a", 40);
        let b = s.spawn("b", 40);
        let c = s.spawn("c", 50);
        s.yield_current();
        assert_eq!(s.schedule(), Some(c));
        s.block_current();
        assert_eq!(s.schedule(), Some(a));
        s.yield_current();
        assert_eq!(s.schedule(), Some(b));
        s.yield_current();
        assert_eq!(s.schedule(), Some(a));
    }

    #[test]
    fn sleepers_wake_at_their_tick_never_early() {
        let s = sched();
        let main = s.bootstrap("main", PRI_DEFAULT);
        assert_eq!(s.sleep_current_until(3), Acquire::Blocked);
        s.schedule();
        assert_eq!(s.thread_state(main), Some(ThreadState::Blocked));
        s.tick();
        s.tick();
        assert_eq!(s.thread_state(main), Some(ThreadState::Blocked));
        s.tick();
        assert_eq!(s.thread_state(main), Some(ThreadState::Ready));
    }

    #[test]
    fn donation_raises_holder_and_release_restores() {
        let s = sched();
        s.bootstrap("main", PRI_DEFAULT);
        let low = s.spawn("low", 10);
        let high = s.spawn("high", 30);
        let l1 = s.lock_create();

        assert_eq!(s.lock_acquire(low, l1), Acquire::Granted);
        assert_eq!(s.lock_acquire(high, l1), Acquire::Blocked);
        assert_eq!(s.priority_of(low), 30);

        let (woken, _) = s.lock_release(low, l1);
        assert_eq!(woken, Some(high));
        assert_eq!(s.priority_of(low), 10);
        assert_eq!(s.lock_held_by(l1), Some(high));
    }

    #[test]
    fn nested_donation_follows_the_chain() {
        // Scenario: low holds L1 and L2; med blocks on L2; high blocks on L1.
        let s = sched();
        s.bootstrap("main", PRI_DEFAULT);
        let low = s.spawn("low", 10);
        let med = s.spawn("med", 20);
        let high = s.spawn("high", 30);
        let l1 = s.lock_create();
        let l2 = s.lock_create();

        assert_eq!(s.lock_acquire(low, l1), Acquire::Granted);
        assert_eq!(s.lock_acquire(low, l2), Acquire::Granted);
        assert_eq!(s.lock_acquire(med, l2), Acquire::Blocked);
        assert_eq!(s.priority_of(low), 20);
        assert_eq!(s.lock_acquire(high, l1), Acquire::Blocked);
        assert_eq!(s.priority_of(low), 30);
        assert_eq!(s.priority_of(med), 20);

        // Releasing L2 wakes med; low still holds L1 with high waiting.
        let (woken, _) = s.lock_release(low, l2);
        assert_eq!(woken, Some(med));
        assert_eq!(s.priority_of(low), 30);

        let (woken, _) = s.lock_release(low, l1);
        assert_eq!(woken, Some(high));
        assert_eq!(s.priority_of(low), 10);
    }

    #[test]
    fn chained_donation_through_a_middle_thread() {
        // a holds LA; b holds LB and waits on LA; c waits on LB.
        // c's priority must reach a through b.
        let s = sched();
        s.bootstrap("main", PRI_DEFAULT);
        let a = s.spawn("a", 10);
        let b = s.spawn("b", 20);
        let c = s.spawn("c", 40);
        let la = s.lock_create();
        let lb = s.lock_create();

        assert_eq!(s.lock_acquire(a, la), Acquire::Granted);
        assert_eq!(s.lock_acquire(b, lb), Acquire::Granted);
        assert_eq!(s.lock_acquire(b, la), Acquire::Blocked);
        assert_eq!(s.priority_of(a), 20);
        assert_eq!(s.lock_acquire(c, lb), Acquire::Blocked);
        assert_eq!(s.priority_of(b), 40);
        assert_eq!(s.priority_of(a), 40);
    }

    #[test]
    fn semaphore_wakes_highest_priority_waiter() {
        let s = sched();
        s.bootstrap("main", PRI_DEFAULT);
        let a = s.spawn("a", 10);
        let b = s.spawn("b", 50);
        let sem = s.sema_create(0);
        assert_eq!(s.sema_down(a, sem), Acquire::Blocked);
        assert_eq!(s.sema_down(b, sem), Acquire::Blocked);
        let (woken, _) = s.sema_up(sem);
        assert_eq!(woken, Some(b));
        let (woken, _) = s.sema_up(sem);
        assert_eq!(woken, Some(a));
        let (woken, _) = s.sema_up(sem);
        assert_eq!(woken, None);
        assert_eq!(s.sema_value(sem), Some(1));
    }

    #[test]
    fn time_slice_requests_yield() {
        let s = sched();
        s.bootstrap("main", PRI_DEFAULT);
        assert!(!s.tick());
        assert!(!s.tick());
        assert!(!s.tick());
        assert!(s.tick());
    }

    #[test]
    fn dying_threads_are_reaped_on_schedule() {
        let s = sched();
        s.bootstrap("main", PRI_DEFAULT);
        let a = s.spawn("a", 40);
        s.yield_current();
        assert_eq!(s.schedule(), Some(a));
        s.exit_current();
        s.schedule();
        s.schedule();
        assert_eq!(s.thread_state(a), None);
    }

    #[test]
    fn mlfqs_priority_tracks_recent_cpu() {
        let s = Scheduler::new(SchedPolicy::Mlfqs);
        let main = s.bootstrap("main", PRI_DEFAULT);
        // Charge 40 ticks of CPU to main; its priority must drop.
        for _ in 0..40 {
            s.tick();
        }
        assert!(s.priority_of(main) < PRI_MAX);
        assert!(s.recent_cpu_hundredths(main) > 0);
    }
}
