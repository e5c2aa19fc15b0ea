//! The per-thread cooperative scheduler.
//!
//! One dedicated thread runs the loop: admit session-init tasks, drain
//! the three priority lanes in order, drain the page-operation queue,
//! run each session's pending tasks, then execute the next ready session
//! command. With nothing ready it parks on a condvar for the configured
//! loop interval (the hook point where a network multiplexer would
//! select instead), running periodic tasks and the session/lock timeout
//! sweeps from the idle path. `end()` is idempotent and wakes the loop.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use kestrel_common::config::StoreConfig;
use kestrel_common::error::KestrelError;
use kestrel_common::types::{Priority, SessionId};

use kestrel_storage::{HandlerPool, OpContext, PageOperation, PageOperationResult};
use kestrel_txn::{SyncTransactionListener, TransactionEngine, TransactionListener};

use crate::session::{CommandStep, Session, SessionCommand, StepContext};

type Task = Box<dyn FnOnce() + Send>;
type PeriodicTask = Arc<dyn Fn() + Send + Sync>;

/// Queue depths, exposed as the node-load signal.
#[derive(Debug, Clone, Default)]
pub struct SchedulerLoad {
    pub init_tasks: usize,
    pub tasks: [usize; 3],
    pub page_ops: usize,
    pub sessions: usize,
    pub ready_commands: usize,
}

struct SchedulerState {
    id: usize,
    ended: AtomicBool,
    /// Wake flag + condvar; `true` means work arrived while running.
    wake: StdMutex<bool>,
    wake_cond: Condvar,
    /// Session-init tasks, admitted through the validator when set.
    init_tasks: Mutex<VecDeque<Task>>,
    admission: RwLock<Option<Box<dyn Fn() -> bool + Send + Sync>>>,
    /// Priority lanes, drained max → norm → min.
    tasks: [Mutex<VecDeque<Task>>; 3],
    page_ops: Mutex<VecDeque<Box<dyn PageOperation>>>,
    sessions: Mutex<Vec<Arc<Session>>>,
    /// Round-robin pointer for fair selection among equal priorities.
    next_session: AtomicU64,
    periodic: RwLock<Arc<Vec<PeriodicTask>>>,
    pool: Arc<HandlerPool>,
    engine: Option<Arc<TransactionEngine>>,
    loops: AtomicU64,
}

pub struct Scheduler {
    state: Arc<SchedulerState>,
    loop_interval: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(
        id: usize,
        config: &StoreConfig,
        pool: Arc<HandlerPool>,
        engine: Option<Arc<TransactionEngine>>,
    ) -> Arc<Self> {
        let state = Arc::new(SchedulerState {
            id,
            ended: AtomicBool::new(false),
            wake: StdMutex::new(false),
            wake_cond: Condvar::new(),
            init_tasks: Mutex::new(VecDeque::new()),
            admission: RwLock::new(None),
            tasks: [
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
                Mutex::new(VecDeque::new()),
            ],
            page_ops: Mutex::new(VecDeque::new()),
            sessions: Mutex::new(Vec::new()),
            next_session: AtomicU64::new(0),
            periodic: RwLock::new(Arc::new(Vec::new())),
            pool,
            engine,
            loops: AtomicU64::new(0),
        });
        let loop_interval = Duration::from_millis(config.scheduler_loop_interval_ms);
        let scheduler = Arc::new(Self {
            state: Arc::clone(&state),
            loop_interval,
            thread: Mutex::new(None),
        });
        let thread_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name(format!("scheduler-{id}"))
            .spawn(move || thread_state.run_loop(loop_interval))
            .expect("spawn scheduler");
        *scheduler.thread.lock() = Some(handle);
        scheduler
    }

    pub fn id(&self) -> usize {
        self.state.id
    }

    pub fn is_ended(&self) -> bool {
        self.state.ended.load(Ordering::Acquire)
    }

    /// Stop the loop and join the thread. Idempotent; unblocks all
    /// internal waits.
    pub fn end(&self) {
        self.state.ended.store(true, Ordering::Release);
        self.state.wake_up();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Install the admission validator for session-init tasks.
    pub fn set_admission(&self, validator: impl Fn() -> bool + Send + Sync + 'static) {
        *self.state.admission.write() = Some(Box::new(validator));
    }

    pub fn submit_init_task(&self, task: Task) {
        self.state.init_tasks.lock().push_back(task);
        self.state.wake_up();
    }

    pub fn submit_task(&self, priority: Priority, task: Task) {
        self.state.tasks[priority as usize].lock().push_back(task);
        self.state.wake_up();
    }

    pub fn submit_page_operation(&self, op: Box<dyn PageOperation>) {
        self.state.page_ops.lock().push_back(op);
        self.state.wake_up();
    }

    pub fn add_periodic_task(&self, task: PeriodicTask) {
        let mut list = self.state.periodic.write();
        let mut next = (**list).clone();
        next.push(task);
        *list = Arc::new(next);
    }

    pub fn register_session(&self, session: Arc<Session>) {
        self.state.sessions.lock().push(session);
        self.state.wake_up();
    }

    /// Remove the session and revoke its pending work.
    pub fn remove_session(&self, id: SessionId) {
        let mut sessions = self.state.sessions.lock();
        if let Some(idx) = sessions.iter().position(|s| s.id() == id) {
            let session = sessions.remove(idx);
            session.close();
        }
    }

    pub fn wake_up(&self) {
        self.state.wake_up();
    }

    pub fn load(&self) -> SchedulerLoad {
        self.state.load()
    }

    pub fn loop_count(&self) -> u64 {
        self.state.loops.load(Ordering::Relaxed)
    }

    /// A cooperative blocker bound to this scheduler: waiting runs the
    /// scheduler's internal queues instead of just parking, so a session
    /// can await an answer that must be processed by its own scheduler.
    pub fn listener(&self) -> Arc<CooperativeListener> {
        Arc::new(CooperativeListener {
            state: Arc::clone(&self.state),
            inner: SyncTransactionListener::new(),
        })
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.end();
    }
}

impl SchedulerState {
    fn wake_up(&self) {
        let mut flag = self.wake.lock().unwrap_or_else(|p| p.into_inner());
        *flag = true;
        drop(flag);
        self.wake_cond.notify_all();
    }

    fn load(&self) -> SchedulerLoad {
        let sessions = self.sessions.lock();
        SchedulerLoad {
            init_tasks: self.init_tasks.lock().len(),
            tasks: [
                self.tasks[0].lock().len(),
                self.tasks[1].lock().len(),
                self.tasks[2].lock().len(),
            ],
            page_ops: self.page_ops.lock().len(),
            sessions: sessions.len(),
            ready_commands: sessions.iter().map(|s| s.pending_command_count()).sum(),
        }
    }

    fn run_loop(self: Arc<Self>, loop_interval: Duration) {
        tracing::debug!(scheduler = self.id, "scheduler loop started");
        while !self.ended.load(Ordering::Acquire) {
            self.loops.fetch_add(1, Ordering::Relaxed);
            let mut did_work = false;
            did_work |= self.drain_init_tasks();
            did_work |= self.drain_task_lanes();
            did_work |= self.drain_page_ops();
            did_work |= self.run_session_tasks();
            did_work |= self.execute_next_statement();
            if !did_work {
                self.do_await(loop_interval);
            }
        }
        tracing::debug!(scheduler = self.id, "scheduler loop ended");
    }

    /// One pass over the internal queues, used by the cooperative
    /// listener while it waits.
    fn drain_once(&self) -> bool {
        let mut did_work = false;
        did_work |= self.drain_task_lanes();
        did_work |= self.drain_page_ops();
        did_work
    }

    fn drain_init_tasks(&self) -> bool {
        let mut did_work = false;
        loop {
            let admitted = {
                let admission = self.admission.read();
                match &*admission {
                    Some(validator) => validator(),
                    None => true,
                }
            };
            if !admitted {
                return did_work;
            }
            let Some(task) = self.init_tasks.lock().pop_front() else {
                return did_work;
            };
            run_task(task, self.id, "init task");
            did_work = true;
        }
    }

    /// Max, then norm, then min.
    fn drain_task_lanes(&self) -> bool {
        let mut did_work = false;
        for lane in [Priority::Max, Priority::Norm, Priority::Min] {
            loop {
                let Some(task) = self.tasks[lane as usize].lock().pop_front() else {
                    break;
                };
                run_task(task, self.id, "task");
                did_work = true;
            }
        }
        did_work
    }

    fn drain_page_ops(&self) -> bool {
        let mut did_work = false;
        loop {
            let Some(mut op) = self.page_ops.lock().pop_front() else {
                return did_work;
            };
            let ctx = OpContext {
                pool: Arc::clone(&self.pool),
                handler_id: None,
            };
            match catch_unwind(AssertUnwindSafe(|| op.run(&ctx))) {
                Ok(PageOperationResult::Retry) => self.page_ops.lock().push_back(op),
                Ok(PageOperationResult::Shifted) => match op.target_leaf() {
                    Some(leaf) => self.pool.handler_for_leaf(leaf).submit(op),
                    None => self.pool.get_handler().submit(op),
                },
                Ok(_) => {}
                Err(_) => {
                    tracing::error!(scheduler = self.id, "page operation panicked");
                }
            }
            did_work = true;
        }
    }

    fn run_session_tasks(&self) -> bool {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().clone();
        let mut did_work = false;
        for session in sessions {
            for task in session.take_tasks() {
                run_task(task, self.id, "session task");
                did_work = true;
            }
        }
        did_work
    }

    /// Pick the ready command with the highest priority (round-robin
    /// among equals) and run one step of it.
    fn execute_next_statement(&self) -> bool {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().clone();
        if sessions.is_empty() {
            return false;
        }
        let start = self.next_session.fetch_add(1, Ordering::Relaxed) as usize;
        let mut best: Option<(usize, Priority)> = None;
        for offset in 0..sessions.len() {
            let idx = (start + offset) % sessions.len();
            if let Some(p) = sessions[idx].front_priority() {
                if best.map(|(_, bp)| p > bp).unwrap_or(true) {
                    best = Some((idx, p));
                }
            }
        }
        let Some((idx, priority)) = best else {
            return false;
        };

        // Priority of the best command other than the chosen one; feeds
        // yield_if_needed inside the step.
        let mut best_waiting = None;
        for (i, session) in sessions.iter().enumerate() {
            if i == idx {
                continue;
            }
            if let Some(p) = session.front_priority() {
                if best_waiting.map(|bp| p > bp).unwrap_or(true) {
                    best_waiting = Some(p);
                }
            }
        }

        let session = &sessions[idx];
        let Some(mut command) = session.pop_command() else {
            return false;
        };
        let mut ctx = StepContext {
            current_priority: priority,
            preempted: false,
            best_waiting,
        };
        let step = catch_unwind(AssertUnwindSafe(|| (command.step)(&mut ctx)));
        match step {
            Ok(CommandStep::Done) => {}
            Ok(CommandStep::Yielded) => {
                if ctx.preempted {
                    // Promoted one level so an endless stream of equal or
                    // higher arrivals cannot starve it.
                    command.priority = command.priority.promote();
                }
                session.requeue_front(command);
            }
            Err(_) => {
                tracing::error!(
                    scheduler = self.id,
                    session = %session.id(),
                    "session command panicked"
                );
            }
        }
        true
    }

    /// Idle path: timeout sweeps, periodic tasks, then park until work
    /// arrives or the loop interval elapses. A network build would select
    /// on its multiplexer here instead of the condvar.
    fn do_await(&self, loop_interval: Duration) {
        self.check_session_timeouts();
        if let Some(engine) = &self.engine {
            engine.check_timeouts();
        }
        let tasks = Arc::clone(&self.periodic.read());
        for task in tasks.iter() {
            if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                tracing::error!(scheduler = self.id, "periodic task panicked");
            }
        }

        let mut flag = self.wake.lock().unwrap_or_else(|p| p.into_inner());
        if !*flag {
            let (f, _) = self
                .wake_cond
                .wait_timeout(flag, loop_interval)
                .unwrap_or_else(|p| p.into_inner());
            flag = f;
        }
        *flag = false;
    }

    fn check_session_timeouts(&self) {
        let now = Instant::now();
        let sessions: Vec<Arc<Session>> = self.sessions.lock().clone();
        for session in sessions {
            if let Some(deadline) = session.timeout_at() {
                if deadline <= now && !session.is_closed() {
                    tracing::warn!(session = %session.id(), "session timed out");
                    session.close();
                }
            }
        }
    }
}

fn run_task(task: Task, scheduler: usize, what: &str) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        tracing::error!(scheduler, "{what} panicked");
    }
}

/// Transaction listener that runs the scheduler's inner queues while it
/// waits, so a session never deadlocks awaiting work only its own
/// scheduler can perform.
pub struct CooperativeListener {
    state: Arc<SchedulerState>,
    inner: SyncTransactionListener,
}

impl TransactionListener for CooperativeListener {
    fn before_operation(&self) {
        self.inner.before_operation();
    }

    fn operation_complete(&self) {
        self.inner.operation_complete();
        self.state.wake_up();
    }

    fn operation_undo(&self) {
        self.inner.operation_undo();
        self.state.wake_up();
    }

    fn set_exception(&self, error: KestrelError) {
        self.inner.set_exception(error);
        self.state.wake_up();
    }

    fn await_completion(&self, timeout: Option<Duration>) -> Result<(), KestrelError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            // Drain higher-priority work while waiting on the counter.
            while self.state.drain_once() {}
            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return self.inner.await_completion(Some(Duration::ZERO));
                    }
                    (d - now).min(Duration::from_millis(1))
                }
                None => Duration::from_millis(1),
            };
            match self.inner.await_completion(Some(slice)) {
                Ok(()) => return Ok(()),
                Err(KestrelError::Txn(kestrel_common::error::TxnError::LockTimeout(_)))
                    if deadline.map(|d| Instant::now() < d).unwrap_or(true) =>
                {
                    // Slice elapsed without completion: keep cooperating.
                }
                Err(e) => return Err(e),
            }
        }
    }
}
