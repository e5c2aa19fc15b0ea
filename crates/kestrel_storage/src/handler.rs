//! Page-operation handlers: dedicated threads, each owning a FIFO of page
//! operations plus a copy-on-write list of periodic tasks run from the
//! idle path. Writers of the same leaf always land on the same handler
//! (hash affinity), which is what serialises them.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::RwLock;

/// Outcome of running a page operation once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOperationResult {
    /// Terminal; the result listener has been notified.
    Succeeded,
    /// The responsible handler changed mid-operation; retry on the new owner.
    Shifted,
    /// The target leaf latch is held; re-enqueue and try again.
    Retry,
    /// Row-level conflict; a waiter was registered and will resubmit.
    Locked,
}

/// Execution context passed to an operation: which pool it can route
/// through and, when running on a pool thread, that thread's handler id.
/// This replaces thread-identity discovery with an explicit handle.
pub struct OpContext {
    pub pool: Arc<HandlerPool>,
    pub handler_id: Option<usize>,
}

/// A queued unit of page work: either a single-key write or opaque
/// `Runnable` work (leaf moves, replica reconfiguration).
pub trait PageOperation: Send + 'static {
    fn run(&mut self, ctx: &OpContext) -> PageOperationResult;

    /// Leaf the operation last targeted; used to re-route after a shift.
    fn target_leaf(&self) -> Option<u64> {
        None
    }
}

/// Opaque runnable work on a handler thread.
pub struct RunnableOperation<F: FnMut() + Send + 'static>(pub F);

impl<F: FnMut() + Send + 'static> PageOperation for RunnableOperation<F> {
    fn run(&mut self, _ctx: &OpContext) -> PageOperationResult {
        (self.0)();
        PageOperationResult::Succeeded
    }
}

pub type PeriodicTask = Arc<dyn Fn() + Send + Sync>;

/// One handler: a FIFO drained by a dedicated thread.
pub struct PageOperationHandler {
    id: usize,
    queue: Mutex<VecDeque<Box<dyn PageOperation>>>,
    available: Condvar,
    shutdown: AtomicBool,
    /// Copy-on-write task list; the loop clones the Arc and never holds
    /// the lock while running tasks.
    periodic: RwLock<Arc<Vec<PeriodicTask>>>,
    ops_executed: AtomicU64,
    ops_retried: AtomicU64,
}

impl PageOperationHandler {
    fn new(id: usize) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            periodic: RwLock::new(Arc::new(Vec::new())),
            ops_executed: AtomicU64::new(0),
            ops_retried: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn submit(&self, op: Box<dyn PageOperation>) {
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        queue.push_back(op);
        drop(queue);
        self.available.notify_one();
    }

    pub fn add_periodic_task(&self, task: PeriodicTask) {
        let mut list = self.periodic.write();
        let mut next = (**list).clone();
        next.push(task);
        *list = Arc::new(next);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn ops_executed(&self) -> u64 {
        self.ops_executed.load(Ordering::Relaxed)
    }

    fn wake(&self) {
        self.available.notify_all();
    }

    fn run_loop(&self, pool: Arc<HandlerPool>, loop_interval: Duration) {
        let ctx = OpContext {
            pool: Arc::clone(&pool),
            handler_id: Some(self.id),
        };
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return;
            }
            let op = {
                let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
                if queue.is_empty() {
                    let (q, _timeout) = self
                        .available
                        .wait_timeout(queue, loop_interval)
                        .unwrap_or_else(|p| p.into_inner());
                    queue = q;
                }
                queue.pop_front()
            };
            match op {
                Some(mut op) => {
                    let result = catch_unwind(AssertUnwindSafe(|| op.run(&ctx)));
                    self.ops_executed.fetch_add(1, Ordering::Relaxed);
                    match result {
                        Ok(PageOperationResult::Succeeded)
                        | Ok(PageOperationResult::Locked) => {}
                        Ok(PageOperationResult::Retry) => {
                            self.ops_retried.fetch_add(1, Ordering::Relaxed);
                            self.submit(op);
                            std::thread::yield_now();
                        }
                        Ok(PageOperationResult::Shifted) => {
                            pool.resubmit_shifted(op);
                        }
                        Err(panic) => {
                            // One bad task must not poison the loop.
                            tracing::error!(
                                handler = self.id,
                                "page operation panicked: {:?}",
                                panic_message(&panic)
                            );
                        }
                    }
                }
                None => {
                    // Idle path: periodic tasks, never from inside an op.
                    let tasks = Arc::clone(&self.periodic.read());
                    for task in tasks.iter() {
                        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| task())) {
                            tracing::error!(
                                handler = self.id,
                                "periodic task panicked: {:?}",
                                panic_message(&panic)
                            );
                        }
                    }
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".into()
    }
}

/// The pool of page-operation handlers plus their threads.
pub struct HandlerPool {
    handlers: Vec<Arc<PageOperationHandler>>,
    next: AtomicUsize,
    threads: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl HandlerPool {
    /// Start `size` handler threads. `loop_interval` bounds the idle wait
    /// between periodic-task sweeps.
    pub fn start(size: usize, loop_interval: Duration) -> Arc<Self> {
        let size = size.max(1);
        let handlers: Vec<_> = (0..size)
            .map(|id| Arc::new(PageOperationHandler::new(id)))
            .collect();
        let pool = Arc::new(Self {
            handlers,
            next: AtomicUsize::new(0),
            threads: parking_lot::Mutex::new(Vec::new()),
        });
        let mut threads = pool.threads.lock();
        for handler in &pool.handlers {
            let handler = Arc::clone(handler);
            let pool_ref = Arc::clone(&pool);
            let t = std::thread::Builder::new()
                .name(format!("page-op-{}", handler.id()))
                .spawn(move || handler.run_loop(pool_ref, loop_interval))
                .expect("spawn page-op handler");
            threads.push(t);
        }
        drop(threads);
        pool
    }

    pub fn size(&self) -> usize {
        self.handlers.len()
    }

    /// Round-robin handler, for work with no leaf affinity.
    pub fn get_handler(&self) -> &Arc<PageOperationHandler> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handlers.len();
        &self.handlers[i]
    }

    /// Handler index owning a leaf: hash of leaf identity modulo pool size.
    pub fn handler_index_for_leaf(&self, leaf_id: u64) -> usize {
        (leaf_id % self.handlers.len() as u64) as usize
    }

    pub fn handler_for_leaf(&self, leaf_id: u64) -> &Arc<PageOperationHandler> {
        &self.handlers[self.handler_index_for_leaf(leaf_id)]
    }

    /// Queue opaque work on some handler.
    pub fn add_page_operation(&self, op: Box<dyn PageOperation>) {
        self.get_handler().submit(op);
    }

    /// Register a periodic task on every handler.
    pub fn add_periodic_task(&self, task: PeriodicTask) {
        for h in &self.handlers {
            h.add_periodic_task(Arc::clone(&task));
        }
    }

    fn resubmit_shifted(&self, op: Box<dyn PageOperation>) {
        match op.target_leaf() {
            Some(leaf_id) => self.handler_for_leaf(leaf_id).submit(op),
            None => self.get_handler().submit(op),
        }
    }

    /// Stop all handler threads. Idempotent; queued operations that have
    /// not started are dropped.
    pub fn stop(&self) {
        for h in &self.handlers {
            h.shutdown.store(true, Ordering::Release);
            h.wake();
        }
        let mut threads = self.threads.lock();
        for t in threads.drain(..) {
            let _ = t.join();
        }
    }
}

impl Drop for HandlerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_runnable_operation_executes() {
        let pool = HandlerPool::start(2, Duration::from_millis(10));
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let c = Arc::clone(&counter);
            pool.add_page_operation(Box::new(RunnableOperation(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })));
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 10 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.stop();
    }

    #[test]
    fn test_leaf_affinity_is_stable() {
        let pool = HandlerPool::start(4, Duration::from_millis(10));
        let a = pool.handler_index_for_leaf(42);
        assert_eq!(pool.handler_index_for_leaf(42), a);
        assert!(a < pool.size());
        pool.stop();
    }

    #[test]
    fn test_periodic_task_runs_on_idle() {
        let pool = HandlerPool::start(1, Duration::from_millis(5));
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        pool.add_periodic_task(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(counter.load(Ordering::SeqCst) > 0);
        pool.stop();
    }

    #[test]
    fn test_panicking_operation_does_not_poison_loop() {
        let pool = HandlerPool::start(1, Duration::from_millis(10));
        pool.handlers[0].submit(Box::new(RunnableOperation(|| {
            panic!("bad task");
        })));
        let counter = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&counter);
        pool.handlers[0].submit(Box::new(RunnableOperation(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })));
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let pool = HandlerPool::start(2, Duration::from_millis(10));
        pool.stop();
        pool.stop();
    }
}
