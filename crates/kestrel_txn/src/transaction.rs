//! Transactions: state machine, savepoints, undo/redo, cooperative
//! listeners.
//!
//! A transaction is `Open` from `begin`; a write that hits a foreign row
//! lock parks it in `Waiting` until the owner ends, and `commit` passes
//! through `Committing` on the way to `Closed`. The listener is the
//! cooperative blocking point: the storage layer counts an operation up
//! before submitting and down on completion, and `await_completion`
//! parks until the count drains or an error is posted. Schedulers supply
//! their own listener implementation that runs internal queues while
//! waiting; this is a context-passed handle, never thread identity.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kestrel_common::error::{KestrelError, KestrelResult, TxnError};
use kestrel_common::types::TxnId;

use crate::engine::TransactionEngine;
use crate::undo::UndoLog;

/// SQL isolation levels. The core enforces read-committed visibility and
/// escalates through row locks; stricter levels are honoured by the
/// caller through per-read visibility predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Closed,
    Open,
    Committing,
    Waiting,
}

/// Cooperative blocker bound to the session driving this transaction.
pub trait TransactionListener: Send + Sync {
    /// Count one pending operation before it is submitted.
    fn before_operation(&self);
    /// Count a pending operation down; wakes `await_completion`.
    fn operation_complete(&self);
    /// The operation was undone before completing.
    fn operation_undo(&self);
    /// Post a failure; `await_completion` returns it.
    fn set_exception(&self, error: KestrelError);
    /// Park until pending operations drain or an error arrives.
    fn await_completion(&self, timeout: Option<Duration>) -> KestrelResult<()>;
}

/// Stock listener for plain threads: a counter and a condvar.
pub struct SyncTransactionListener {
    state: StdMutex<ListenerState>,
    ready: Condvar,
}

struct ListenerState {
    pending: i64,
    error: Option<KestrelError>,
}

impl Default for SyncTransactionListener {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransactionListener {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(ListenerState {
                pending: 0,
                error: None,
            }),
            ready: Condvar::new(),
        }
    }
}

impl TransactionListener for SyncTransactionListener {
    fn before_operation(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pending += 1;
    }

    fn operation_complete(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.pending -= 1;
        drop(state);
        self.ready.notify_all();
    }

    fn operation_undo(&self) {
        self.operation_complete();
    }

    fn set_exception(&self, error: KestrelError) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.error = Some(error);
        drop(state);
        self.ready.notify_all();
    }

    fn await_completion(&self, timeout: Option<Duration>) -> KestrelResult<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(e) = state.error.take() {
                return Err(e);
            }
            if state.pending <= 0 {
                return Ok(());
            }
            match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(KestrelError::Txn(TxnError::LockTimeout(TxnId(0))));
                    }
                    let (s, _) = self
                        .ready
                        .wait_timeout(state, d - now)
                        .unwrap_or_else(|p| p.into_inner());
                    state = s;
                }
                None => {
                    state = self.ready.wait(state).unwrap_or_else(|p| p.into_inner());
                }
            }
        }
    }
}

/// A distributed participant joined to this transaction; notified at
/// commit/rollback (replica sessions register here).
pub trait TransactionParticipant: Send + Sync {
    fn participant_commit(&self);
    fn participant_rollback(&self);
}

pub struct Transaction {
    id: TxnId,
    engine: Weak<TransactionEngine>,
    state: Mutex<TxnState>,
    pub(crate) undo: Mutex<UndoLog>,
    savepoints: Mutex<HashMap<String, usize>>,
    isolation: Mutex<IsolationLevel>,
    listener: Mutex<Arc<dyn TransactionListener>>,
    participants: Mutex<Vec<Arc<dyn TransactionParticipant>>>,
    /// Deadline while `Waiting`; swept by `check_timeouts`.
    pub(crate) wait_deadline: Mutex<Option<Instant>>,
}

impl Transaction {
    pub(crate) fn new(id: TxnId, engine: Weak<TransactionEngine>) -> Self {
        Self {
            id,
            engine,
            state: Mutex::new(TxnState::Open),
            undo: Mutex::new(UndoLog::new()),
            savepoints: Mutex::new(HashMap::new()),
            isolation: Mutex::new(IsolationLevel::ReadCommitted),
            listener: Mutex::new(Arc::new(SyncTransactionListener::new())),
            participants: Mutex::new(Vec::new()),
            wait_deadline: Mutex::new(None),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        *self.state.lock() = state;
    }

    /// `Waiting → Open` on wake-up; any other state is left alone.
    pub(crate) fn wake_from_wait(&self) {
        let mut state = self.state.lock();
        if *state == TxnState::Waiting {
            *state = TxnState::Open;
        }
        *self.wait_deadline.lock() = None;
    }

    pub fn check_open(&self) -> KestrelResult<()> {
        match self.state() {
            TxnState::Open => Ok(()),
            _ => Err(KestrelError::Txn(TxnError::NotOpen(self.id))),
        }
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        *self.isolation.lock()
    }

    pub fn set_isolation_level(&self, level: IsolationLevel) {
        *self.isolation.lock() = level;
    }

    pub fn listener(&self) -> Arc<dyn TransactionListener> {
        Arc::clone(&self.listener.lock())
    }

    /// Install the session's cooperative blocker.
    pub fn set_listener(&self, listener: Arc<dyn TransactionListener>) {
        *self.listener.lock() = listener;
    }

    pub fn add_participant(&self, participant: Arc<dyn TransactionParticipant>) {
        self.participants.lock().push(participant);
    }

    pub(crate) fn engine(&self) -> KestrelResult<Arc<TransactionEngine>> {
        self.engine
            .upgrade()
            .ok_or_else(|| KestrelError::Internal("transaction engine is gone".into()))
    }

    // ── Savepoints ──────────────────────────────────────────────────────

    pub fn add_savepoint(&self, name: &str) {
        let log_id = self.undo.lock().log_id();
        self.savepoints.lock().insert(name.to_string(), log_id);
    }

    pub fn savepoint_id(&self, name: &str) -> KestrelResult<usize> {
        self.savepoints
            .lock()
            .get(name)
            .copied()
            .ok_or_else(|| KestrelError::Txn(TxnError::UnknownSavepoint(name.to_string())))
    }

    pub fn rollback_to_savepoint(&self, name: &str) -> KestrelResult<()> {
        let id = self.savepoint_id(name)?;
        self.rollback_to(id)
    }

    /// Pop undo records back to `log_id`, restoring prior cell state and
    /// releasing any locks taken since.
    pub fn rollback_to(&self, log_id: usize) -> KestrelResult<()> {
        self.check_open()?;
        let engine = self.engine()?;
        let (waiters, vacant) = self.undo.lock().rollback_to(self.id, log_id);
        engine.purge_vacant(&vacant);
        engine.wake_waiters(waiters);
        Ok(())
    }

    // ── Commit / rollback ───────────────────────────────────────────────

    /// Commit: persist the redo buffer, convert staged cells in order,
    /// then release waiters.
    pub fn commit(&self) -> KestrelResult<()> {
        let engine = self.engine()?;
        {
            let mut state = self.state.lock();
            match *state {
                TxnState::Open => *state = TxnState::Committing,
                other => {
                    tracing::debug!(txn = %self.id, state = ?other, "commit rejected");
                    return Err(KestrelError::Txn(TxnError::NotOpen(self.id)));
                }
            }
        }

        let (waiters, vacant) = {
            let mut undo = self.undo.lock();
            // Durability point: committed undo records are persisted
            // before acknowledgement.
            if let Some(buffer) = undo.to_redo_buffer() {
                engine.append_redo(self.id, &buffer)?;
            }
            undo.commit(self.id)
        };

        for participant in self.participants.lock().drain(..) {
            participant.participant_commit();
        }

        engine.purge_vacant(&vacant);
        engine.wake_waiters(waiters);
        engine.finish(self.id);
        self.set_state(TxnState::Closed);
        self.savepoints.lock().clear();
        Ok(())
    }

    /// Commit off the calling thread; `task` runs after the commit
    /// completes, on the handler that performed it.
    pub fn commit_async(self: &Arc<Self>, task: Box<dyn FnOnce(KestrelResult<()>) + Send>) {
        let Ok(engine) = self.engine() else {
            task(Err(KestrelError::Internal("transaction engine is gone".into())));
            return;
        };
        let txn = Arc::clone(self);
        let mut task = Some(task);
        engine.pool().add_page_operation(Box::new(
            kestrel_storage::RunnableOperation(move || {
                let result = txn.commit();
                if let Some(task) = task.take() {
                    task(result);
                }
            }),
        ));
    }

    /// Roll everything back and close.
    pub fn rollback(&self) -> KestrelResult<()> {
        let engine = self.engine()?;
        {
            let mut state = self.state.lock();
            match *state {
                TxnState::Closed => return Ok(()),
                _ => *state = TxnState::Committing,
            }
        }
        let (waiters, vacant) = self.undo.lock().rollback_to(self.id, 0);
        for participant in self.participants.lock().drain(..) {
            participant.participant_rollback();
        }
        engine.purge_vacant(&vacant);
        engine.wake_waiters(waiters);
        engine.finish(self.id);
        self.set_state(TxnState::Closed);
        self.savepoints.lock().clear();
        Ok(())
    }

    pub fn undo_log_len(&self) -> usize {
        self.undo.lock().len()
    }

    /// Tag pending records with replication names for coordinator retry.
    pub fn set_retry_replication_names(&self, names: &[String], to_log_id: usize) {
        self.undo
            .lock()
            .set_retry_replication_names(names, to_log_id);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_listener_counts_down() {
        let listener = SyncTransactionListener::new();
        listener.before_operation();
        listener.operation_complete();
        listener.await_completion(Some(Duration::from_millis(50))).unwrap();
    }

    #[test]
    fn test_sync_listener_times_out() {
        let listener = SyncTransactionListener::new();
        listener.before_operation();
        let r = listener.await_completion(Some(Duration::from_millis(20)));
        assert!(r.is_err());
    }

    #[test]
    fn test_sync_listener_propagates_exception() {
        let listener = SyncTransactionListener::new();
        listener.before_operation();
        listener.set_exception(KestrelError::Internal("boom".into()));
        let r = listener.await_completion(None);
        assert!(r.unwrap_err().to_string().contains("boom"));
    }
}
