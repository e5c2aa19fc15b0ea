//! Transactional value cells.
//!
//! The map stores `Arc<TransactionalValue>` as its value type: a cell
//! carrying the committed value, an uncommitted value owned by at most one
//! transaction, and a FIFO queue of transactions waiting for the row lock.
//! Readers see the committed value unless the reading transaction is the
//! owner; commit flips the uncommitted value in place without touching
//! the tree.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use kestrel_common::datum::Datum;
use kestrel_common::types::TxnId;

use crate::transaction::TransactionListener;

/// The map value type of every transactional map.
pub type TValue = Arc<TransactionalValue>;

/// A transaction parked on a row lock, woken FIFO when the owner ends.
pub struct WaitingTransaction {
    pub txn_id: TxnId,
    pub listener: Arc<dyn TransactionListener>,
}

/// Cell state the transaction layer records so rollback can restore it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrevState {
    /// The cell did not exist; rollback removes it from the tree.
    NoCell,
    /// The cell existed unlocked; rollback releases the lock.
    Unlocked,
    /// The owning transaction had an earlier uncommitted write.
    Uncommitted(Option<Datum>),
}

/// Outcome of a lock attempt made under the leaf latch.
pub enum LockAttempt {
    /// Lock taken (or already held); carries the state to restore on
    /// rollback of this write.
    Acquired(PrevState),
    /// Held by another transaction; the supplied waiter was queued.
    Locked(TxnId),
}

/// Outcome of a put-if-absent attempt.
pub enum AbsentAttempt {
    /// Absent; the value was staged (same contract as `Acquired`).
    Staged(PrevState),
    /// A visible value already exists; nothing changed.
    Present(Datum),
    /// Held by another transaction whose outcome decides absence.
    Locked(TxnId),
}

struct CellState {
    committed: Option<Datum>,
    /// `Some(None)` is an uncommitted tombstone.
    uncommitted: Option<Option<Datum>>,
    owner: Option<TxnId>,
    waiters: VecDeque<WaitingTransaction>,
}

pub struct TransactionalValue {
    state: Mutex<CellState>,
}

impl std::fmt::Debug for TransactionalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionalValue")
            .field("committed", &state.committed)
            .field("owner", &state.owner)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}

impl TransactionalValue {
    /// A committed cell (decoded from a page image).
    pub fn committed(value: Option<Datum>) -> TValue {
        Arc::new(Self {
            state: Mutex::new(CellState {
                committed: value,
                uncommitted: None,
                owner: None,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// A fresh cell created by `owner`'s insert.
    pub fn new_uncommitted(owner: TxnId, value: Option<Datum>) -> TValue {
        Arc::new(Self {
            state: Mutex::new(CellState {
                committed: None,
                uncommitted: Some(value),
                owner: Some(owner),
                waiters: VecDeque::new(),
            }),
        })
    }

    /// Visibility: the committed value, unless `reader` owns the cell.
    pub fn read(&self, reader: Option<TxnId>) -> Option<Datum> {
        let state = self.state.lock();
        match (reader, state.owner) {
            (Some(r), Some(o)) if r == o => state
                .uncommitted
                .clone()
                .unwrap_or_else(|| state.committed.clone()),
            _ => state.committed.clone(),
        }
    }

    pub fn committed_value(&self) -> Option<Datum> {
        self.state.lock().committed.clone()
    }

    pub fn owner(&self) -> Option<TxnId> {
        self.state.lock().owner
    }

    pub fn is_locked_by_other(&self, txn_id: TxnId) -> bool {
        matches!(self.state.lock().owner, Some(o) if o != txn_id)
    }

    /// Try to take the row lock and stage `value`; on conflict the waiter
    /// is queued atomically with the check, so no wakeup can be missed.
    pub fn lock_and_stage(
        &self,
        txn_id: TxnId,
        value: Option<Datum>,
        waiter: impl FnOnce() -> WaitingTransaction,
    ) -> LockAttempt {
        let mut state = self.state.lock();
        match state.owner {
            Some(o) if o != txn_id => {
                state.waiters.push_back(waiter());
                LockAttempt::Locked(o)
            }
            Some(_) => {
                let prev = PrevState::Uncommitted(
                    state
                        .uncommitted
                        .clone()
                        .unwrap_or_else(|| state.committed.clone()),
                );
                state.uncommitted = Some(value);
                LockAttempt::Acquired(prev)
            }
            None => {
                state.owner = Some(txn_id);
                state.uncommitted = Some(value);
                LockAttempt::Acquired(PrevState::Unlocked)
            }
        }
    }

    /// Put-if-absent under the lock: a visible committed value wins
    /// without locking; an absent value is staged like a put.
    pub fn lock_if_absent(
        &self,
        txn_id: TxnId,
        value: Option<Datum>,
        waiter: impl FnOnce() -> WaitingTransaction,
    ) -> AbsentAttempt {
        let mut state = self.state.lock();
        match state.owner {
            Some(o) if o != txn_id => {
                // Another owner: its staged write is invisible to us, but a
                // committed value already decides the outcome.
                if let Some(v) = state.committed.clone() {
                    return AbsentAttempt::Present(v);
                }
                state.waiters.push_back(waiter());
                AbsentAttempt::Locked(o)
            }
            Some(_) => {
                let visible = state
                    .uncommitted
                    .clone()
                    .unwrap_or_else(|| state.committed.clone());
                if let Some(v) = visible {
                    return AbsentAttempt::Present(v);
                }
                let prev = PrevState::Uncommitted(
                    state
                        .uncommitted
                        .clone()
                        .unwrap_or_else(|| state.committed.clone()),
                );
                state.uncommitted = Some(value);
                AbsentAttempt::Staged(prev)
            }
            None => {
                if let Some(v) = state.committed.clone() {
                    return AbsentAttempt::Present(v);
                }
                state.owner = Some(txn_id);
                state.uncommitted = Some(value);
                AbsentAttempt::Staged(PrevState::Unlocked)
            }
        }
    }

    /// Take the row lock without changing the value (SELECT FOR UPDATE).
    pub fn lock_only(
        &self,
        txn_id: TxnId,
        waiter: impl FnOnce() -> WaitingTransaction,
    ) -> LockAttempt {
        let mut state = self.state.lock();
        match state.owner {
            Some(o) if o != txn_id => {
                state.waiters.push_back(waiter());
                LockAttempt::Locked(o)
            }
            Some(_) => {
                let current = state
                    .uncommitted
                    .clone()
                    .unwrap_or_else(|| state.committed.clone());
                let prev = PrevState::Uncommitted(current.clone());
                state.uncommitted = Some(current);
                LockAttempt::Acquired(prev)
            }
            None => {
                state.owner = Some(txn_id);
                LockAttempt::Acquired(PrevState::Unlocked)
            }
        }
    }

    /// Commit the owner's staged value; returns the waiters to wake.
    pub fn commit(&self, txn_id: TxnId) -> Vec<WaitingTransaction> {
        let mut state = self.state.lock();
        if state.owner != Some(txn_id) {
            return Vec::new();
        }
        if let Some(staged) = state.uncommitted.take() {
            state.committed = staged;
        }
        state.owner = None;
        state.waiters.drain(..).collect()
    }

    /// Undo one write by the owner, restoring `prev`. Returns waiters to
    /// wake when the lock was released.
    pub fn rollback(&self, txn_id: TxnId, prev: &PrevState) -> Vec<WaitingTransaction> {
        let mut state = self.state.lock();
        if state.owner != Some(txn_id) {
            return Vec::new();
        }
        match prev {
            PrevState::Uncommitted(v) => {
                state.uncommitted = Some(v.clone());
                Vec::new()
            }
            PrevState::Unlocked | PrevState::NoCell => {
                state.uncommitted = None;
                state.owner = None;
                state.waiters.drain(..).collect()
            }
        }
    }

    /// True when nothing committed, nothing staged and nobody owns the
    /// cell; such cells are physically removed from the tree.
    pub fn is_vacant(&self) -> bool {
        let state = self.state.lock();
        state.committed.is_none() && state.uncommitted.is_none() && state.owner.is_none()
    }
}

/// Value type for transactional maps: pages persist the committed value
/// only, so an image read back starts every cell unlocked.
pub struct TValueType;

impl kestrel_storage::ValueType<TValue> for TValueType {
    fn compare(&self, a: &TValue, b: &TValue) -> std::cmp::Ordering {
        a.committed_value().cmp(&b.committed_value())
    }

    fn encode(&self, v: &TValue, buf: &mut Vec<u8>) {
        let committed = v.committed_value();
        let bytes = bincode::serialize(&committed).expect("datum serialization is infallible");
        buf.extend_from_slice(&bytes);
    }

    fn decode(&self, buf: &[u8]) -> Result<TValue, String> {
        let committed: Option<Datum> = bincode::deserialize(buf).map_err(|e| e.to_string())?;
        Ok(TransactionalValue::committed(committed))
    }
}
