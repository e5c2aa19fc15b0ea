use serde::{Deserialize, Serialize};

/// Transaction identifier, allocated monotonically by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl std::fmt::Display for TxnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn-{}", self.0)
    }
}

/// Session identifier, scheduler-local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sess-{}", self.0)
    }
}

/// Cluster host identifier ("host:port" or a symbolic node name).
/// Replication-name tie-breaks compare these lexicographically.
pub type HostId = String;

/// Task priority inside a scheduler. Commands yield to higher lanes;
/// `yield_if_needed` promotes a preempted command one level at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Min = 0,
    Norm = 1,
    Max = 2,
}

impl Priority {
    /// One level up, saturating at `Max`.
    pub fn promote(self) -> Priority {
        match self {
            Priority::Min => Priority::Norm,
            Priority::Norm | Priority::Max => Priority::Max,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Min => write!(f, "min"),
            Priority::Norm => write!(f, "norm"),
            Priority::Max => write!(f, "max"),
        }
    }
}

/// Outcome of an asynchronous map or transaction operation, delivered to
/// a completion handler on the owning page-operation handler thread.
#[derive(Debug)]
pub struct AsyncResult<T> {
    pub value: Option<T>,
    pub error: Option<crate::error::KestrelError>,
}

impl<T> AsyncResult<T> {
    pub fn succeeded(value: T) -> Self {
        Self {
            value: Some(value),
            error: None,
        }
    }

    /// A successful completion carrying no value (absent key, no-op remove).
    pub fn empty() -> Self {
        Self {
            value: None,
            error: None,
        }
    }

    pub fn failed(error: crate::error::KestrelError) -> Self {
        Self {
            value: None,
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Unpack into a `Result`, mapping a missing value to `Ok(None)`.
    pub fn into_result(self) -> Result<Option<T>, crate::error::KestrelError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.value),
        }
    }
}

/// Completion handler for the async map API.
pub type AsyncHandler<T> = Box<dyn FnOnce(AsyncResult<T>) + Send + 'static>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_promote_saturates() {
        assert_eq!(Priority::Min.promote(), Priority::Norm);
        assert_eq!(Priority::Norm.promote(), Priority::Max);
        assert_eq!(Priority::Max.promote(), Priority::Max);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Max > Priority::Norm);
        assert!(Priority::Norm > Priority::Min);
    }

    #[test]
    fn test_async_result_into_result() {
        let ok: AsyncResult<i32> = AsyncResult::succeeded(7);
        assert_eq!(ok.into_result().unwrap(), Some(7));

        let empty: AsyncResult<i32> = AsyncResult::empty();
        assert_eq!(empty.into_result().unwrap(), None);

        let failed: AsyncResult<i32> = AsyncResult::failed(
            crate::error::KestrelError::Internal("boom".into()),
        );
        assert!(failed.into_result().is_err());
    }
}
