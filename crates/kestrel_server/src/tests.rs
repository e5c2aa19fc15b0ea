//! Scheduler and session tests: lane ordering, FIFO guarantees, yield
//! promotion and the cooperative wait path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kestrel_common::config::StoreConfig;
use kestrel_common::types::Priority;

use kestrel_storage::{HandlerPool, RunnableOperation};
use kestrel_txn::TransactionListener;

use crate::scheduler::Scheduler;
use crate::session::{CommandStep, Session, SessionCommand, StepContext};

fn config() -> StoreConfig {
    StoreConfig {
        in_memory: true,
        scheduler_loop_interval_ms: 5,
        ..Default::default()
    }
}

fn scheduler() -> Arc<Scheduler> {
    let pool = HandlerPool::start(2, Duration::from_millis(10));
    Scheduler::start(0, &config(), pool, None)
}

fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_millis(deadline_ms);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_task_lanes_drain_in_priority_order() {
    let scheduler = scheduler();
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    // Submit low first; the scheduler must still run max first once it
    // wakes with all three queued.
    for (priority, tag) in [
        (Priority::Min, "min"),
        (Priority::Norm, "norm"),
        (Priority::Max, "max"),
    ] {
        let order = Arc::clone(&order);
        scheduler.submit_task(priority, Box::new(move || order.lock().push(tag)));
    }
    assert!(wait_until(2000, || order.lock().len() == 3));
    let order = order.lock();
    // All three may land across loop iterations, but max is never last.
    assert_eq!(order.len(), 3);
    assert_ne!(order[2], "max");
    scheduler.end();
}

#[test]
fn test_session_tasks_run_in_fifo_order() {
    let scheduler = scheduler();
    let session = Session::new(false);
    scheduler.register_session(Arc::clone(&session));
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..10 {
        let seen = Arc::clone(&seen);
        session.submit_task(Box::new(move || seen.lock().push(i)));
    }
    scheduler.wake_up();
    assert!(wait_until(2000, || seen.lock().len() == 10));
    assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());
    scheduler.end();
}

#[test]
fn test_commands_within_session_are_fifo() {
    let scheduler = scheduler();
    let session = Session::new(false);
    scheduler.register_session(Arc::clone(&session));
    let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    for i in 0..5 {
        let seen = Arc::clone(&seen);
        // Later commands carry higher priority but must not overtake
        // within the same session.
        let priority = if i == 0 { Priority::Min } else { Priority::Max };
        session.submit_command(SessionCommand::once(priority, move || {
            seen.lock().push(i);
        }));
    }
    scheduler.wake_up();
    assert!(wait_until(2000, || seen.lock().len() == 5));
    assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    scheduler.end();
}

#[test]
fn test_yield_promotes_preempted_command() {
    // Invariant: a long low-priority command climbs one level per yield
    // and cannot be starved by a stream of higher-priority commands.
    let scheduler = scheduler();
    let slow_session = Session::new(false);
    let busy_session = Session::new(false);
    scheduler.register_session(Arc::clone(&slow_session));
    scheduler.register_session(Arc::clone(&busy_session));

    let slow_done = Arc::new(AtomicBool::new(false));
    let steps = Arc::new(AtomicUsize::new(0));
    {
        let slow_done = Arc::clone(&slow_done);
        let steps = Arc::clone(&steps);
        slow_session.submit_command(SessionCommand::new(Priority::Min, move |ctx| {
            let step = steps.fetch_add(1, Ordering::SeqCst);
            if ctx.yield_if_needed() || step < 5 {
                return CommandStep::Yielded;
            }
            slow_done.store(true, Ordering::SeqCst);
            CommandStep::Done
        }));
    }
    let busy_done = Arc::new(AtomicUsize::new(0));
    for _ in 0..20 {
        let busy_done = Arc::clone(&busy_done);
        busy_session.submit_command(SessionCommand::once(Priority::Max, move || {
            busy_done.fetch_add(1, Ordering::SeqCst);
        }));
    }
    scheduler.wake_up();

    assert!(wait_until(3000, || slow_done.load(Ordering::SeqCst)
        && busy_done.load(Ordering::SeqCst) == 20));
    assert!(steps.load(Ordering::SeqCst) >= 6);
    scheduler.end();
}

#[test]
fn test_page_operations_drain_on_scheduler_thread() {
    let scheduler = scheduler();
    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..5 {
        let counter = Arc::clone(&counter);
        scheduler.submit_page_operation(Box::new(RunnableOperation(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
    }
    assert!(wait_until(2000, || counter.load(Ordering::SeqCst) == 5));
    scheduler.end();
}

#[test]
fn test_session_removal_revokes_pending_work() {
    let scheduler = scheduler();
    let session = Session::new(false);
    let id = session.id();
    // Not yet registered, so nothing can run; queue up work, then remove.
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        session.submit_task(Box::new(move || ran.store(true, Ordering::SeqCst)));
    }
    scheduler.register_session(Arc::clone(&session));
    scheduler.remove_session(id);
    std::thread::sleep(Duration::from_millis(50));
    assert!(session.is_closed());
    scheduler.end();
    assert!(!ran.load(Ordering::SeqCst) || session.is_closed());
}

#[test]
fn test_session_timeout_closes_session() {
    let scheduler = scheduler();
    let session = Session::new(false);
    session.set_timeout_at(Some(Instant::now() + Duration::from_millis(30)));
    scheduler.register_session(Arc::clone(&session));
    assert!(wait_until(2000, || session.is_closed()));
    scheduler.end();
}

#[test]
fn test_end_is_idempotent_and_unblocks() {
    let scheduler = scheduler();
    scheduler.end();
    scheduler.end();
    assert!(scheduler.is_ended());
}

#[test]
fn test_init_task_admission_gate() {
    let scheduler = scheduler();
    let admitted = Arc::new(AtomicBool::new(false));
    {
        let admitted = Arc::clone(&admitted);
        scheduler.set_admission(move || admitted.load(Ordering::SeqCst));
    }
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = Arc::clone(&ran);
        scheduler.submit_init_task(Box::new(move || ran.store(true, Ordering::SeqCst)));
    }
    std::thread::sleep(Duration::from_millis(50));
    assert!(!ran.load(Ordering::SeqCst), "blocked by the validator");

    admitted.store(true, Ordering::SeqCst);
    scheduler.wake_up();
    assert!(wait_until(2000, || ran.load(Ordering::SeqCst)));
    scheduler.end();
}

#[test]
fn test_cooperative_listener_avoids_self_service_deadlock() {
    // A command running on the scheduler thread awaits work that only
    // the same scheduler can run; the cooperative listener drains the
    // inner queues while it waits instead of deadlocking.
    let scheduler = scheduler();
    let session = Session::new(false);
    scheduler.register_session(Arc::clone(&session));

    let done = Arc::new(AtomicBool::new(false));
    {
        let scheduler = Arc::clone(&scheduler);
        let done = Arc::clone(&done);
        session.submit_command(SessionCommand::once(Priority::Norm, move || {
            let listener = scheduler.listener();
            listener.before_operation();
            {
                let listener = Arc::clone(&listener);
                scheduler.submit_task(
                    Priority::Max,
                    Box::new(move || listener.operation_complete()),
                );
            }
            listener
                .await_completion(Some(Duration::from_secs(2)))
                .expect("cooperative wait must complete");
            done.store(true, Ordering::SeqCst);
        }));
    }
    scheduler.wake_up();
    assert!(wait_until(3000, || done.load(Ordering::SeqCst)));
    scheduler.end();
}

#[test]
fn test_yield_only_fires_for_strictly_higher_priority() {
    let mut preempted = StepContext {
        current_priority: Priority::Min,
        preempted: false,
        best_waiting: Some(Priority::Max),
    };
    assert!(preempted.yield_if_needed());

    let mut equal = StepContext {
        current_priority: Priority::Max,
        preempted: false,
        best_waiting: Some(Priority::Max),
    };
    assert!(!equal.yield_if_needed());

    let mut alone = StepContext {
        current_priority: Priority::Min,
        preempted: false,
        best_waiting: None,
    };
    assert!(!alone.yield_if_needed());
}

#[test]
fn test_load_snapshot_reports_queue_depths() {
    let scheduler = scheduler();
    let session = Session::new(false);
    scheduler.register_session(session);
    let load = scheduler.load();
    assert_eq!(load.sessions, 1);
    scheduler.end();
}
