//! A transaction's view of a B-tree map.
//!
//! Reads resolve transactional cells to the committed value (or the
//! transaction's own staged value). Writes lock-and-stage inside the
//! guarded page operation, so the row-lock check runs in the same
//! serialised window as the tree mutation; a conflict queues a FIFO
//! waiter and parks the transaction in `Waiting`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use kestrel_common::datum::Datum;
use kestrel_common::error::{KestrelError, KestrelResult, TxnError};
use kestrel_common::types::TxnId;

use kestrel_storage::{BTreeMap, GuardDecision, WriteOutcome};

use crate::deadlock::format_cycle;
use crate::transaction::{Transaction, TxnState};
use crate::tvalue::{
    AbsentAttempt, LockAttempt, PrevState, TValue, TransactionalValue, WaitingTransaction,
};

/// How a transactional write treats the current cell.
enum WriteMode {
    /// Unconditional put (or tombstone when the value is `None`).
    Put(Option<Datum>),
    /// Stage only when no value is visible.
    PutIfAbsent(Datum),
    /// Take the row lock without changing the value.
    LockOnly,
}

/// What a single guarded attempt produced.
enum Attempt {
    Done(Option<Datum>),
    Conflict(TxnId),
}

pub struct TransactionMap {
    map: Arc<BTreeMap<TValue>>,
    txn: Arc<Transaction>,
}

impl TransactionMap {
    pub fn new(map: Arc<BTreeMap<TValue>>, txn: Arc<Transaction>) -> Self {
        Self { map, txn }
    }

    pub fn name(&self) -> &str {
        self.map.name()
    }

    pub fn raw_map(&self) -> &Arc<BTreeMap<TValue>> {
        &self.map
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.txn
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// Read-committed visibility, except the owner sees its staged value.
    pub fn get(&self, key: &Datum) -> Option<Datum> {
        self.map
            .get(key)
            .and_then(|cell| cell.read(Some(self.txn.id())))
    }

    /// Read through a caller-supplied visibility predicate (how stricter
    /// isolation levels are layered on top of the core).
    pub fn get_with<F>(&self, key: &Datum, visibility: F) -> Option<Datum>
    where
        F: FnOnce(&TValue) -> Option<Datum>,
    {
        self.map.get(key).and_then(|cell| visibility(&cell))
    }

    pub fn contains_key(&self, key: &Datum) -> bool {
        self.get(key).is_some()
    }

    /// Visible entries of `[from, to]` in key order.
    pub fn cursor(
        &self,
        from: Option<Datum>,
        to: Option<Datum>,
    ) -> impl Iterator<Item = (Datum, Datum)> + '_ {
        let txn_id = self.txn.id();
        self.map
            .cursor(from, to)
            .filter_map(move |(k, cell)| cell.read(Some(txn_id)).map(|v| (k, v)))
    }

    /// Number of visible entries (full scan).
    pub fn count_visible(&self) -> u64 {
        self.cursor(None, None).count() as u64
    }

    pub fn first_key(&self) -> Option<Datum> {
        self.cursor(None, None).next().map(|(k, _)| k)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Transactional put; returns the previously visible value.
    pub fn put(&self, key: Datum, value: Datum) -> KestrelResult<Option<Datum>> {
        self.write(key, WriteMode::Put(Some(value)), false)
    }

    /// Put carrying the FOR UPDATE flag into the undo log.
    pub fn put_for_update(&self, key: Datum, value: Datum) -> KestrelResult<Option<Datum>> {
        self.write(key, WriteMode::Put(Some(value)), true)
    }

    /// Returns the existing visible value, or stages the new one.
    pub fn put_if_absent(&self, key: Datum, value: Datum) -> KestrelResult<Option<Datum>> {
        self.write(key, WriteMode::PutIfAbsent(value), false)
    }

    /// Transactional remove (stages a tombstone); returns the previously
    /// visible value.
    pub fn remove(&self, key: Datum) -> KestrelResult<Option<Datum>> {
        self.write(key, WriteMode::Put(None), false)
    }

    /// Row lock without a value change (SELECT FOR UPDATE). Blocks like
    /// any other write on a conflicting owner.
    pub fn lock_row(&self, key: Datum) -> KestrelResult<()> {
        self.write(key, WriteMode::LockOnly, true).map(|_| ())
    }

    /// Append under a fresh integer key.
    pub fn append(&self, value: Datum) -> KestrelResult<Datum> {
        self.txn.check_open()?;
        let txn_id = self.txn.id();
        let cell = TransactionalValue::new_uncommitted(txn_id, Some(value));
        let key = self.map.append(Arc::clone(&cell))?;
        self.txn.undo.lock().add(
            self.map.name().to_string(),
            key.clone(),
            cell,
            PrevState::NoCell,
            false,
        );
        Ok(key)
    }

    fn write(
        &self,
        key: Datum,
        mode: WriteMode,
        for_update: bool,
    ) -> KestrelResult<Option<Datum>> {
        let txn = &self.txn;
        let engine = txn.engine()?;
        let lock_timeout = match engine.config().lock_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let mode = Arc::new(Mutex::new(mode));

        loop {
            txn.check_open()?;
            let listener = txn.listener();
            listener.before_operation();

            let attempt = match self.attempt(&key, &mode, for_update) {
                Ok(attempt) => attempt,
                Err(e) => {
                    listener.operation_undo();
                    return Err(e);
                }
            };
            match attempt {
                Attempt::Done(prior) => {
                    listener.operation_complete();
                    return Ok(prior);
                }
                Attempt::Conflict(owner) => {
                    // Deadlock check before parking: a cycle through us
                    // aborts the detecting transaction.
                    if let Some(cycle) = engine.wait_graph().add_wait_checked(txn.id(), owner) {
                        let cycle = format_cycle(&cycle);
                        tracing::error!(txn = %txn.id(), %cycle, "deadlock detected");
                        let _ = txn.rollback();
                        return Err(KestrelError::Txn(TxnError::Deadlock(txn.id(), cycle)));
                    }
                    txn.set_state(TxnState::Waiting);
                    *txn.wait_deadline.lock() =
                        lock_timeout.map(|t| Instant::now() + t);
                    let waited = listener.await_completion(lock_timeout);
                    engine.wait_graph().remove_wait(txn.id(), owner);
                    txn.wake_from_wait();
                    if let Err(e) = waited {
                        let _ = txn.rollback();
                        return Err(match e {
                            KestrelError::Txn(TxnError::LockTimeout(_)) => {
                                KestrelError::Txn(TxnError::LockTimeout(txn.id()))
                            }
                            other => other,
                        });
                    }
                    // Woken FIFO; retry from scratch (the leaf may even
                    // have shifted handlers in the meantime).
                }
            }
        }
    }

    /// One guarded pass over the cell, inside the leaf's serialised
    /// window.
    fn attempt(
        &self,
        key: &Datum,
        mode: &Arc<Mutex<WriteMode>>,
        for_update: bool,
    ) -> KestrelResult<Attempt> {
        let txn = Arc::clone(&self.txn);
        let txn_id = txn.id();
        let map_name = self.map.name().to_string();
        let listener = txn.listener();
        let guard_key = key.clone();
        let guard_mode = Arc::clone(mode);
        let conflict: Arc<Mutex<Option<TxnId>>> = Arc::new(Mutex::new(None));
        let prior: Arc<Mutex<Option<Datum>>> = Arc::new(Mutex::new(None));
        let guard_conflict = Arc::clone(&conflict);
        let guard_prior = Arc::clone(&prior);

        let guard = Box::new(move |current: Option<&TValue>| -> GuardDecision<TValue> {
            let waiter = || WaitingTransaction {
                txn_id,
                listener: Arc::clone(&listener),
            };
            let mode = guard_mode.lock();
            match current {
                None => match &*mode {
                    WriteMode::Put(value) => {
                        let cell = TransactionalValue::new_uncommitted(txn_id, value.clone());
                        txn.undo.lock().add(
                            map_name.clone(),
                            guard_key.clone(),
                            Arc::clone(&cell),
                            PrevState::NoCell,
                            for_update,
                        );
                        GuardDecision::Apply(cell)
                    }
                    WriteMode::PutIfAbsent(value) => {
                        let cell =
                            TransactionalValue::new_uncommitted(txn_id, Some(value.clone()));
                        txn.undo.lock().add(
                            map_name.clone(),
                            guard_key.clone(),
                            Arc::clone(&cell),
                            PrevState::NoCell,
                            for_update,
                        );
                        GuardDecision::Apply(cell)
                    }
                    WriteMode::LockOnly => GuardDecision::Keep,
                },
                Some(cell) => {
                    *guard_prior.lock() = cell.read(Some(txn_id));
                    let attempt = match &*mode {
                        WriteMode::Put(value) => {
                            cell.lock_and_stage(txn_id, value.clone(), waiter)
                        }
                        WriteMode::LockOnly => cell.lock_only(txn_id, waiter),
                        WriteMode::PutIfAbsent(value) => {
                            match cell.lock_if_absent(txn_id, Some(value.clone()), waiter) {
                                AbsentAttempt::Staged(prev) => LockAttempt::Acquired(prev),
                                AbsentAttempt::Present(v) => {
                                    *guard_prior.lock() = Some(v);
                                    return GuardDecision::Keep;
                                }
                                AbsentAttempt::Locked(owner) => LockAttempt::Locked(owner),
                            }
                        }
                    };
                    match attempt {
                        LockAttempt::Acquired(prev) => {
                            txn.undo.lock().add(
                                map_name.clone(),
                                guard_key.clone(),
                                Arc::clone(cell),
                                prev,
                                for_update,
                            );
                            GuardDecision::Keep
                        }
                        LockAttempt::Locked(owner) => {
                            *guard_conflict.lock() = Some(owner);
                            GuardDecision::Locked
                        }
                    }
                }
            }
        });

        match self.map.write_guarded(key.clone(), guard)? {
            WriteOutcome::Locked => {
                let owner = conflict.lock().take().ok_or_else(|| {
                    KestrelError::Internal("lock conflict without an owner".into())
                })?;
                Ok(Attempt::Conflict(owner))
            }
            WriteOutcome::Old(_) => Ok(Attempt::Done(prior.lock().take())),
            WriteOutcome::RemoteLeaf(hosts) => Err(KestrelError::Internal(format!(
                "transactional write routed to a remote leaf (replicas: {hosts:?})"
            ))),
            other => Err(KestrelError::Internal(format!(
                "unexpected guarded outcome: {other:?}"
            ))),
        }
    }
}
