use thiserror::Error;

use crate::types::TxnId;

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`   — bad input, write on read-only map, unknown savepoint
/// - `Retryable`   — write conflict, page shifted, move plan lost; caller SHOULD retry
/// - `Transient`   — timeout, quorum miss, backpressure; caller MAY retry after back-off
/// - `InternalBug` — should never happen; logged as fatal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage layer errors (page store, B-tree map, page operations).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Map is closed: {0}")]
    MapClosed(String),

    #[error("Map is read-only: {0}")]
    ReadOnly(String),

    #[error("Null value rejected for key {0}")]
    NullValue(String),

    #[error("Corrupt chunk {chunk_id}: {reason}")]
    CorruptChunk { chunk_id: u64, reason: String },

    #[error("Page not found at pos {0:#x}")]
    PageNotFound(u64),

    #[error("Map {0} is in-memory, nothing to save")]
    InMemory(String),

    #[error("Sharding mode requires initReplicationNodes on first open")]
    MissingReplicationNodes,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Transaction layer errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Transaction {0} is not open")]
    NotOpen(TxnId),

    #[error("Transaction {0} write conflict on locked row")]
    WriteConflict(TxnId),

    #[error("Transaction {0} aborted")]
    Aborted(TxnId),

    #[error("Transaction {0} lock wait timeout")]
    LockTimeout(TxnId),

    #[error("Deadlock detected, transaction {0} aborted (cycle: {1})")]
    Deadlock(TxnId, String),

    #[error("Unknown savepoint: {0}")]
    UnknownSavepoint(String),
}

/// Replication / cluster errors.
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Quorum not reached: {acks}/{required} acks for {op}")]
    QuorumFailed {
        op: String,
        acks: usize,
        required: usize,
    },

    #[error("Replica {0} unavailable")]
    ReplicaUnavailable(String),

    #[error("Leaf move plan for {page_key} lost round {index}")]
    MovePlanLost { page_key: String, index: u32 },

    #[error("No replicas configured for page")]
    EmptyReplicaSet,
}

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::Storage(StorageError::ReadOnly(_))
            | KestrelError::Storage(StorageError::NullValue(_))
            | KestrelError::Storage(StorageError::MissingReplicationNodes)
            | KestrelError::Txn(TxnError::UnknownSavepoint(_)) => ErrorKind::UserError,

            KestrelError::Txn(TxnError::WriteConflict(_))
            | KestrelError::Txn(TxnError::Aborted(_))
            | KestrelError::Cluster(ClusterError::MovePlanLost { .. }) => ErrorKind::Retryable,

            KestrelError::Txn(TxnError::LockTimeout(_))
            | KestrelError::Cluster(ClusterError::QuorumFailed { .. })
            | KestrelError::Cluster(ClusterError::ReplicaUnavailable(_)) => ErrorKind::Transient,

            // Deadlock aborts are fatal for the detecting transaction; the
            // statement is not retried as-is.
            KestrelError::Txn(TxnError::Deadlock(_, _)) => ErrorKind::InternalBug,

            _ => ErrorKind::InternalBug,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Emit a structured log entry for fatal errors. Called once at the
    /// point where the error reaches a session boundary.
    pub fn log_if_fatal(&self) {
        if self.kind() == ErrorKind::InternalBug {
            tracing::error!(component = self.component(), "FATAL: {}", self);
        }
    }

    fn component(&self) -> &'static str {
        match self {
            KestrelError::Storage(_) => "storage",
            KestrelError::Txn(_) => "txn",
            KestrelError::Cluster(_) => "cluster",
            KestrelError::Internal(_) => "internal",
        }
    }
}

/// Add context to a Result, wrapping into `KestrelError::Internal` while
/// keeping the original message.
pub trait ErrorContext<T> {
    fn ctx(self, context: &str) -> KestrelResult<T>;
}

impl<T, E: Into<KestrelError>> ErrorContext<T> for Result<T, E> {
    fn ctx(self, context: &str) -> KestrelResult<T> {
        self.map_err(|e| {
            let e = e.into();
            KestrelError::Internal(format!("{context}: {e}"))
        })
    }
}
