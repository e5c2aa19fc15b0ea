//! KestrelDB transaction engine: MVCC transactional values over the
//! B-tree map, per-transaction undo logs with savepoints, redo
//! persistence at commit, FIFO row-lock waiters and deadlock detection.

pub mod deadlock;
pub mod engine;
pub mod redo;
pub mod tmap;
pub mod transaction;
pub mod tvalue;
pub mod undo;

#[cfg(test)]
mod tests;

pub use deadlock::WaitForGraph;
pub use engine::TransactionEngine;
pub use redo::RedoWriter;
pub use tmap::TransactionMap;
pub use transaction::{
    IsolationLevel, SyncTransactionListener, Transaction, TransactionListener,
    TransactionParticipant, TxnState,
};
pub use tvalue::{
    AbsentAttempt, LockAttempt, PrevState, TValue, TValueType, TransactionalValue,
    WaitingTransaction,
};
pub use undo::{RedoEntry, UndoLog, UndoLogRecord};
