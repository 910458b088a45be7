//! Scheduler scenarios: the full nested-donation trace, sleep ordering,
//! and MLFQ statistics.

use ferrite_kernel::sched::{Acquire, SchedPolicy, Scheduler, ThreadState};

#[test]
fn donation_chain_trace_runs_in_the_expected_order() {
    // low (10) holds L1 and L2. med (20) blocks on L2, high (30) blocks
    // on L1. low must run at 30 until it releases L2; med runs only once
    // low drops back below it, which happens after high is served.
    let sched = Scheduler::new(SchedPolicy::Priority);
    sched.bootstrap("main", 0);
    let low = sched.spawn("low", 10);
    let med = sched.spawn("med", 20);
    let high = sched.spawn("high", 30);
    let l1 = sched.lock_create();
    let l2 = sched.lock_create();

    assert_eq!(sched.lock_acquire(low, l1), Acquire::Granted);
    assert_eq!(sched.lock_acquire(low, l2), Acquire::Granted);

    assert_eq!(sched.lock_acquire(med, l2), Acquire::Blocked);
    assert_eq!(sched.priority_of(low), 20, "med donates through L2");
    assert_eq!(sched.priority_of(med), 20);

    assert_eq!(sched.lock_acquire(high, l1), Acquire::Blocked);
    assert_eq!(sched.priority_of(low), 30, "high's donation wins");
    assert_eq!(sched.priority_of(med), 20, "med is unaffected");

    // Only low is runnable; it runs at effective priority 30.
    assert_eq!(sched.schedule(), Some(low));

    // low releases L2: med wakes as its holder but low (still 30 thanks
    // to high) keeps the CPU.
    let (woken, _) = sched.lock_release(low, l2);
    assert_eq!(woken, Some(med));
    assert_eq!(sched.thread_state(med), Some(ThreadState::Ready));
    assert_eq!(sched.priority_of(low), 30);
    sched.yield_current();
    assert_eq!(sched.schedule(), Some(low), "low still outranks med");

    // low releases L1: high wakes with priority 30, low falls back to 10.
    let (woken, preempt) = sched.lock_release(low, l1);
    assert_eq!(woken, Some(high));
    assert!(preempt, "the woken thread outranks the releaser");
    assert_eq!(sched.priority_of(low), 10);

    // Run order from here: high (30), then med (20), then low (10).
    sched.yield_current();
    assert_eq!(sched.schedule(), Some(high));
    sched.block_current();
    assert_eq!(sched.schedule(), Some(med));
    sched.block_current();
    assert_eq!(sched.schedule(), Some(low));
}

#[test]
fn waiters_wake_in_priority_order_with_fifo_ties() {
    let sched = Scheduler::new(SchedPolicy::Priority);
    sched.bootstrap("main", 0);
    let a = sched.spawn("a", 20);
    let b = sched.spawn("b", 40);
    let c = sched.spawn("c", 40);
    let lock = sched.lock_create();
    let holder = sched.spawn("holder", 10);

    assert_eq!(sched.lock_acquire(holder, lock), Acquire::Granted);
    assert_eq!(sched.lock_acquire(a, lock), Acquire::Blocked);
    assert_eq!(sched.lock_acquire(b, lock), Acquire::Blocked);
    assert_eq!(sched.lock_acquire(c, lock), Acquire::Blocked);

    let (first, _) = sched.lock_release(holder, lock);
    assert_eq!(first, Some(b), "highest priority first, FIFO among equals");
    let (second, _) = sched.lock_release(b, lock);
    assert_eq!(second, Some(c));
    let (third, _) = sched.lock_release(c, lock);
    assert_eq!(third, Some(a));
}

#[test]
fn sleeping_threads_wake_in_tick_order() {
    let sched = Scheduler::new(SchedPolicy::Priority);
    let main = sched.bootstrap("main", 5);
    let late = sched.spawn("late", 20);
    let early = sched.spawn("early", 20);

    // Put both spawned threads to sleep by making each current briefly.
    sched.yield_current();
    assert_eq!(sched.schedule(), Some(late));
    assert_eq!(sched.sleep_current_until(10), Acquire::Blocked);
    assert_eq!(sched.schedule(), Some(early));
    assert_eq!(sched.sleep_current_until(5), Acquire::Blocked);
    assert_eq!(sched.schedule(), Some(main));

    for _ in 0..4 {
        sched.tick();
    }
    assert_eq!(sched.thread_state(early), Some(ThreadState::Blocked));
    sched.tick();
    assert_eq!(sched.thread_state(early), Some(ThreadState::Ready));
    assert_eq!(sched.thread_state(late), Some(ThreadState::Blocked));
    for _ in 0..5 {
        sched.tick();
    }
    assert_eq!(sched.thread_state(late), Some(ThreadState::Ready));
}

#[test]
fn mlfqs_punishes_cpu_hogs_and_tracks_load() {
    let sched = Scheduler::new(SchedPolicy::Mlfqs);
    let hog = sched.bootstrap("hog", 31);
    let idle = sched.spawn("idle", 31);

    // The hog runs for two seconds of ticks while `idle` sits ready.
    for _ in 0..200 {
        sched.tick();
    }
    assert!(
        sched.priority_of(hog) < sched.priority_of(idle),
        "running thread accumulates recent_cpu and sinks"
    );
    assert!(sched.load_avg_hundredths() > 0);
    assert!(sched.recent_cpu_hundredths(hog) > sched.recent_cpu_hundredths(idle));
}
