//! Single-key write operations.
//!
//! Every map write is packaged as a `SingleWrite` so it can be queued on
//! the handler owning the target leaf. An operation locates its leaf at
//! run time, reports `Shifted` when it lands on the wrong handler,
//! `Retry` when the leaf latch is held, and otherwise applies the
//! mutation and notifies its result listener on the running thread.

use std::sync::{Arc, Condvar, Mutex};

use kestrel_common::datum::Datum;
use kestrel_common::error::{KestrelError, StorageError};
use kestrel_common::types::{AsyncHandler, AsyncResult, HostId};

use crate::handler::{OpContext, PageOperation, PageOperationResult};
use crate::map::BTreeMap;
use crate::page::Value;

/// What a guarded write decided after inspecting the current value under
/// the leaf latch. The transaction layer uses this to do row-lock checks
/// inside the serialised window.
pub enum GuardDecision<V> {
    /// Store this value (insert or overwrite).
    Apply(V),
    /// Leave the map untouched; report the existing value.
    Keep,
    /// Remove the entry (transactional physical cleanup).
    Delete,
    /// Row-level conflict; the guard registered a waiter that will
    /// resubmit. Nothing is modified.
    Locked,
}

/// The five single-key writes plus the guarded form.
pub enum WriteKind<V: Value> {
    Put { value: V },
    PutIfAbsent { value: V },
    Replace { old: V, new: V },
    Remove,
    /// Key was pre-reserved from the map's append counter.
    Append { value: V },
    Guarded {
        guard: Box<dyn FnMut(Option<&V>) -> GuardDecision<V> + Send>,
    },
}

/// Operation outcome delivered to the result listener.
#[derive(Debug)]
pub enum WriteOutcome<V> {
    /// Prior value at the key (for put / put-if-absent / remove / guarded).
    Old(Option<V>),
    /// Whether a compare-and-replace matched.
    Replaced(bool),
    /// The key an append landed on.
    Appended(Datum),
    /// Row-level conflict; a waiter is registered.
    Locked,
    /// The key's leaf lives elsewhere; route through these replicas.
    RemoteLeaf(Vec<HostId>),
}

pub struct SingleWrite<V: Value> {
    map: Arc<BTreeMap<V>>,
    key: Datum,
    kind: WriteKind<V>,
    listener: Option<AsyncHandler<WriteOutcome<V>>>,
    last_leaf: Option<u64>,
}

impl<V: Value> SingleWrite<V> {
    pub fn new(map: Arc<BTreeMap<V>>, key: Datum, kind: WriteKind<V>) -> Self {
        Self {
            map,
            key,
            kind,
            listener: None,
            last_leaf: None,
        }
    }

    pub fn set_listener(&mut self, listener: AsyncHandler<WriteOutcome<V>>) {
        self.listener = Some(listener);
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    fn deliver(&mut self, result: AsyncResult<WriteOutcome<V>>) {
        if let Some(listener) = self.listener.take() {
            listener(result);
        }
    }
}

impl<V: Value> PageOperation for SingleWrite<V> {
    fn run(&mut self, ctx: &OpContext) -> PageOperationResult {
        let map = Arc::clone(&self.map);
        if map.is_closed() {
            self.deliver(AsyncResult::failed(KestrelError::Storage(
                StorageError::MapClosed(map.name().to_string()),
            )));
            return PageOperationResult::Succeeded;
        }

        let descent = map.descend(&self.key);
        let leaf = descent.leaf.clone();
        if leaf.is_remote() {
            let hosts = leaf.replication_host_ids().unwrap_or_default();
            self.deliver(AsyncResult::succeeded(WriteOutcome::RemoteLeaf(hosts)));
            return PageOperationResult::Succeeded;
        }
        self.last_leaf = Some(leaf.id());

        // Pool threads only run writes for leaves they own.
        if let Some(handler_id) = ctx.handler_id {
            if ctx.pool.handler_index_for_leaf(leaf.id()) != handler_id {
                return PageOperationResult::Shifted;
            }
        }

        let Some(latch) = map.try_latch_leaf(leaf.id()) else {
            return PageOperationResult::Retry;
        };

        // The slot may have been swung between descent and latch; retry
        // on a fresh descent if the leaf identity moved under us.
        let descent = map.descend(&self.key);
        if descent.leaf.id() != leaf.id() {
            drop(latch);
            return PageOperationResult::Retry;
        }

        let outcome = map.apply_write(&self.key, &mut self.kind, &descent);
        let locked = matches!(outcome, WriteOutcome::Locked);
        drop(latch);

        self.deliver(AsyncResult::succeeded(outcome));
        if locked {
            PageOperationResult::Locked
        } else {
            PageOperationResult::Succeeded
        }
    }

    fn target_leaf(&self) -> Option<u64> {
        self.last_leaf
    }
}

/// Couples a one-shot result slot with a condvar so a synchronous caller
/// can park until the handler thread delivers.
pub struct SyncListener<T> {
    slot: Mutex<Option<AsyncResult<T>>>,
    ready: Condvar,
}

impl<T: Send + 'static> SyncListener<T> {
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        })
    }

    /// The completion handler half; hand this to the operation.
    pub fn handler(self: &Arc<Self>) -> AsyncHandler<T> {
        let listener = Arc::clone(self);
        Box::new(move |result| {
            let mut slot = listener.slot.lock().unwrap_or_else(|p| p.into_inner());
            *slot = Some(result);
            drop(slot);
            listener.ready.notify_all();
        })
    }

    /// Park until the result arrives.
    pub fn await_result(&self) -> AsyncResult<T> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            slot = self.ready.wait(slot).unwrap_or_else(|p| p.into_inner());
        }
    }

    /// Non-blocking probe, used after an inline (dummy handler) attempt.
    pub fn try_take(&self) -> Option<AsyncResult<T>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}
