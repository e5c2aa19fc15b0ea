//! Sessions: the unit of authentication and transaction ownership, plus
//! the scheduler-local state that drives them.
//!
//! A session's lifetime is bounded by its connection unless it is a root
//! session, which outlives individual connections. Commands within one
//! session run in FIFO order; a command parked on a row lock re-enters
//! the queue in `RetryingReturnResult` when its waiter fires.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use kestrel_common::types::{Priority, SessionId};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Running,
    Waiting,
    /// Woken from a row-lock wait; the statement retries and returns its
    /// result to the caller.
    RetryingReturnResult,
    Closed,
}

/// One step of a session command. `Yielded` means more steps remain and
/// the command re-enters the queue (possibly at a promoted priority).
pub enum CommandStep {
    Done,
    Yielded,
}

/// Context a command step runs under; the cooperative yield point.
pub struct StepContext {
    pub(crate) current_priority: Priority,
    pub(crate) preempted: bool,
    /// Highest priority of any other ready command, set by the scheduler
    /// before the step runs.
    pub(crate) best_waiting: Option<Priority>,
}

impl StepContext {
    /// True when a higher-priority command is ready: the caller should
    /// return `Yielded` promptly. The current command is bumped one
    /// level so it cannot be preempted forever.
    pub fn yield_if_needed(&mut self) -> bool {
        if matches!(self.best_waiting, Some(p) if p > self.current_priority) {
            self.preempted = true;
            true
        } else {
            false
        }
    }
}

/// A queued session command: a priority and a resumable step function.
pub struct SessionCommand {
    pub(crate) priority: Priority,
    pub(crate) step: Box<dyn FnMut(&mut StepContext) -> CommandStep + Send>,
}

impl SessionCommand {
    pub fn new(
        priority: Priority,
        step: impl FnMut(&mut StepContext) -> CommandStep + Send + 'static,
    ) -> Self {
        Self {
            priority,
            step: Box::new(step),
        }
    }

    /// Single-step command.
    pub fn once(priority: Priority, task: impl FnOnce() + Send + 'static) -> Self {
        let mut task = Some(task);
        Self::new(priority, move |_ctx| {
            if let Some(task) = task.take() {
                task();
            }
            CommandStep::Done
        })
    }
}

pub type SessionTask = Box<dyn FnOnce() + Send>;

pub struct Session {
    id: SessionId,
    /// Root sessions survive connection loss.
    root: bool,
    status: Mutex<SessionStatus>,
    pending_tasks: Mutex<VecDeque<SessionTask>>,
    commands: Mutex<VecDeque<SessionCommand>>,
    timeout_at: Mutex<Option<Instant>>,
    closed: AtomicBool,
}

impl Session {
    pub fn new(root: bool) -> Arc<Self> {
        Arc::new(Self {
            id: SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)),
            root,
            status: Mutex::new(SessionStatus::Idle),
            pending_tasks: Mutex::new(VecDeque::new()),
            commands: Mutex::new(VecDeque::new()),
            timeout_at: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.root
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: SessionStatus) {
        *self.status.lock() = status;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the session and revoke everything it still has queued.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.set_status(SessionStatus::Closed);
        self.pending_tasks.lock().clear();
        self.commands.lock().clear();
    }

    pub fn set_timeout_at(&self, deadline: Option<Instant>) {
        *self.timeout_at.lock() = deadline;
    }

    pub fn timeout_at(&self) -> Option<Instant> {
        *self.timeout_at.lock()
    }

    pub fn submit_task(&self, task: SessionTask) {
        if self.is_closed() {
            return;
        }
        self.pending_tasks.lock().push_back(task);
    }

    pub fn submit_command(&self, command: SessionCommand) {
        if self.is_closed() {
            return;
        }
        self.commands.lock().push_back(command);
    }

    pub(crate) fn take_tasks(&self) -> VecDeque<SessionTask> {
        std::mem::take(&mut *self.pending_tasks.lock())
    }

    /// Priority of the command at the queue front, if any.
    pub(crate) fn front_priority(&self) -> Option<Priority> {
        self.commands.lock().front().map(|c| c.priority)
    }

    pub(crate) fn pop_command(&self) -> Option<SessionCommand> {
        self.commands.lock().pop_front()
    }

    /// Put a yielded command back at the front: intra-session FIFO order
    /// is preserved, only the priority may have been promoted.
    pub(crate) fn requeue_front(&self, command: SessionCommand) {
        self.commands.lock().push_front(command);
    }

    pub fn pending_command_count(&self) -> usize {
        self.commands.lock().len()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("root", &self.root)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_revokes_pending_work() {
        let session = Session::new(false);
        session.submit_task(Box::new(|| {}));
        session.submit_command(SessionCommand::once(Priority::Norm, || {}));
        session.close();
        assert!(session.take_tasks().is_empty());
        assert_eq!(session.pending_command_count(), 0);
        // Nothing new is accepted after close.
        session.submit_task(Box::new(|| {}));
        assert!(session.take_tasks().is_empty());
    }

    #[test]
    fn test_front_priority_reflects_queue_head() {
        let session = Session::new(false);
        assert_eq!(session.front_priority(), None);
        session.submit_command(SessionCommand::once(Priority::Min, || {}));
        session.submit_command(SessionCommand::once(Priority::Max, || {}));
        // FIFO: the head stays the first submitted command.
        assert_eq!(session.front_priority(), Some(Priority::Min));
    }
}
