//! The per-transaction undo log and its redo serialisation.
//!
//! Every write appends a record before the operation is acknowledged.
//! `rollback_to` pops records back to a savepoint, restoring the prior
//! cell state; `commit` converts the staged values in order and hands
//! back the waiters released along the way.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

use kestrel_common::datum::Datum;
use kestrel_common::types::TxnId;

use crate::tvalue::{PrevState, TValue, WaitingTransaction};

pub struct UndoLogRecord {
    pub map_name: String,
    pub key: Datum,
    pub cell: TValue,
    pub prev: PrevState,
    pub for_update: bool,
    /// Replication names a replica should treat as already applied when
    /// the coordinator retries this write.
    pub retry_replication_names: Vec<String>,
}

/// One redo entry: the committed effect of a single undo record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedoEntry {
    pub map_name: String,
    pub key: Datum,
    pub value: Option<Datum>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retry_replication_names: Vec<String>,
}

/// Capacity hint carried between redo serialisations, capped at 1 KiB to
/// bound allocation on busy sessions.
static LAST_CAPACITY: AtomicUsize = AtomicUsize::new(1024);
const CAPACITY_CAP: usize = 1024;

#[derive(Default)]
pub struct UndoLog {
    records: Vec<UndoLogRecord>,
}

impl UndoLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next record index; savepoints are snapshots of this.
    pub fn log_id(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn last(&self) -> Option<&UndoLogRecord> {
        self.records.last()
    }

    pub fn records(&self) -> &[UndoLogRecord] {
        &self.records
    }

    pub fn add(
        &mut self,
        map_name: String,
        key: Datum,
        cell: TValue,
        prev: PrevState,
        for_update: bool,
    ) {
        self.records.push(UndoLogRecord {
            map_name,
            key,
            cell,
            prev,
            for_update,
            retry_replication_names: Vec::new(),
        });
    }

    /// Drop the last record without restoring it (the operation was
    /// cancelled before acknowledgement).
    pub fn undo(&mut self) {
        self.records.pop();
    }

    /// Commit all records in order; returns released waiters and the keys
    /// of cells that became vacant (to purge from the tree).
    pub fn commit(&mut self, txn_id: TxnId) -> (Vec<WaitingTransaction>, Vec<(String, Datum)>) {
        let mut waiters = Vec::new();
        let mut vacant = Vec::new();
        for record in &self.records {
            waiters.extend(record.cell.commit(txn_id));
            if record.cell.is_vacant() {
                vacant.push((record.map_name.clone(), record.key.clone()));
            }
        }
        self.records.clear();
        (waiters, vacant)
    }

    /// Pop records while `log_id > to_log_id`, restoring prior state.
    /// Returns released waiters and cells to purge (aborted inserts).
    pub fn rollback_to(
        &mut self,
        txn_id: TxnId,
        to_log_id: usize,
    ) -> (Vec<WaitingTransaction>, Vec<(String, Datum)>) {
        let mut waiters = Vec::new();
        let mut vacant = Vec::new();
        while self.records.len() > to_log_id {
            let record = self.records.pop().expect("length checked");
            waiters.extend(record.cell.rollback(txn_id, &record.prev));
            if record.cell.is_vacant() {
                vacant.push((record.map_name, record.key));
            }
        }
        (waiters, vacant)
    }

    /// Tag records at or above `to_log_id` with the replication names a
    /// replica must recognise on coordinator retry.
    pub fn set_retry_replication_names(&mut self, names: &[String], to_log_id: usize) {
        for record in self.records.iter_mut().skip(to_log_id) {
            record.retry_replication_names = names.to_vec();
        }
    }

    /// Serialise all records of a committing transaction into one redo
    /// buffer. Returns `None` for a read-only transaction.
    pub fn to_redo_buffer(&self) -> Option<Vec<u8>> {
        if self.records.is_empty() {
            return None;
        }
        let mut buf = Vec::with_capacity(LAST_CAPACITY.load(Ordering::Relaxed));
        for record in &self.records {
            let entry = RedoEntry {
                map_name: record.map_name.clone(),
                key: record.key.clone(),
                value: record.cell.read(record.cell.owner()),
                retry_replication_names: record.retry_replication_names.clone(),
            };
            let bytes = bincode::serialize(&entry).expect("redo entry serialization");
            buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            buf.extend_from_slice(&bytes);
        }
        LAST_CAPACITY.store(buf.len().min(CAPACITY_CAP), Ordering::Relaxed);
        Some(buf)
    }

    /// Decode a redo buffer back into entries (recovery and tests).
    pub fn parse_redo_buffer(buf: &[u8]) -> Vec<RedoEntry> {
        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 4 <= buf.len() {
            let len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > buf.len() {
                break;
            }
            match bincode::deserialize(&buf[pos..pos + len]) {
                Ok(entry) => entries.push(entry),
                Err(_) => break,
            }
            pos += len;
        }
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tvalue::TransactionalValue;

    fn int(k: i64) -> Datum {
        Datum::Int(k)
    }

    #[test]
    fn test_log_id_tracks_records() {
        let mut log = UndoLog::new();
        assert_eq!(log.log_id(), 0);
        let cell = TransactionalValue::new_uncommitted(TxnId(1), Some(int(1)));
        log.add("m".into(), int(1), cell, PrevState::NoCell, false);
        assert_eq!(log.log_id(), 1);
        log.undo();
        assert_eq!(log.log_id(), 0);
    }

    #[test]
    fn test_rollback_to_restores_in_reverse_order() {
        let txn = TxnId(1);
        let mut log = UndoLog::new();
        let cell = TransactionalValue::committed(Some(int(1)));

        let crate::tvalue::LockAttempt::Acquired(prev1) =
            cell.lock_and_stage(txn, Some(int(2)), || unreachable!())
        else {
            panic!()
        };
        log.add("m".into(), int(1), cell.clone(), prev1, false);

        let crate::tvalue::LockAttempt::Acquired(prev2) =
            cell.lock_and_stage(txn, Some(int(3)), || unreachable!())
        else {
            panic!()
        };
        log.add("m".into(), int(1), cell.clone(), prev2, false);

        log.rollback_to(txn, 0);
        assert_eq!(cell.read(None), Some(int(1)));
        assert_eq!(cell.owner(), None);
        assert_eq!(log.log_id(), 0);
    }

    #[test]
    fn test_commit_reports_vacant_cells() {
        let txn = TxnId(2);
        let mut log = UndoLog::new();
        // A remove staged on a cell that was never committed ends vacant.
        let cell = TransactionalValue::new_uncommitted(txn, None);
        log.add("m".into(), int(5), cell, PrevState::NoCell, false);
        let (_, vacant) = log.commit(txn);
        assert_eq!(vacant, vec![("m".to_string(), int(5))]);
    }

    #[test]
    fn test_redo_buffer_round_trip() {
        let txn = TxnId(3);
        let mut log = UndoLog::new();
        for k in 1..=3 {
            let cell = TransactionalValue::new_uncommitted(txn, Some(int(k * 10)));
            log.add("m".into(), int(k), cell, PrevState::NoCell, false);
        }
        let buf = log.to_redo_buffer().expect("non-empty log");
        let entries = UndoLog::parse_redo_buffer(&buf);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].key, int(1));
        assert_eq!(entries[2].value, Some(int(30)));
    }

    #[test]
    fn test_empty_log_has_no_redo() {
        let log = UndoLog::new();
        assert!(log.to_redo_buffer().is_none());
    }

    #[test]
    fn test_retry_replication_names_tagging() {
        let txn = TxnId(4);
        let mut log = UndoLog::new();
        for k in 0..3 {
            let cell = TransactionalValue::new_uncommitted(txn, Some(int(k)));
            log.add("m".into(), int(k), cell, PrevState::NoCell, false);
        }
        log.set_retry_replication_names(&["rn-7".into()], 1);
        assert!(log.records()[0].retry_replication_names.is_empty());
        assert_eq!(log.records()[1].retry_replication_names, vec!["rn-7"]);
        assert_eq!(log.records()[2].retry_replication_names, vec!["rn-7"]);
    }
}
