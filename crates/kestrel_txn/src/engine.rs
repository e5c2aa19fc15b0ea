//! The transaction engine: transaction lifecycle, the open-map registry,
//! waiter wake-up, deadlock bookkeeping and the timeout sweep.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use kestrel_common::config::StoreConfig;
use kestrel_common::datum::Datum;
use kestrel_common::error::{KestrelError, KestrelResult, TxnError};
use kestrel_common::types::{HostId, TxnId};

use kestrel_storage::{BTreeMap, GuardDecision, HandlerPool};

use crate::deadlock::WaitForGraph;
use crate::redo::RedoWriter;
use crate::tmap::TransactionMap;
use crate::transaction::Transaction;
use crate::tvalue::{TValue, TValueType, WaitingTransaction};

pub struct TransactionEngine {
    config: StoreConfig,
    dir: Option<PathBuf>,
    pool: Arc<HandlerPool>,
    local_host: Option<HostId>,
    next_txn_id: AtomicU64,
    active: DashMap<TxnId, Arc<Transaction>>,
    maps: DashMap<String, Arc<BTreeMap<TValue>>>,
    wait_graph: WaitForGraph,
    redo: Option<RedoWriter>,
}

impl TransactionEngine {
    pub fn new(config: StoreConfig, dir: Option<PathBuf>) -> KestrelResult<Arc<Self>> {
        let pool = HandlerPool::start(
            config.handler_pool_size,
            Duration::from_millis(config.handler_loop_interval_ms),
        );
        Self::with_pool(config, dir, pool, None)
    }

    /// Build against a shared handler pool (the server wires its own).
    pub fn with_pool(
        config: StoreConfig,
        dir: Option<PathBuf>,
        pool: Arc<HandlerPool>,
        local_host: Option<HostId>,
    ) -> KestrelResult<Arc<Self>> {
        let redo = match (&dir, config.in_memory) {
            (Some(d), false) => Some(RedoWriter::open(&d.join("redo")).map_err(KestrelError::Storage)?),
            _ => None,
        };
        Ok(Arc::new(Self {
            config,
            dir,
            pool,
            local_host,
            next_txn_id: AtomicU64::new(1),
            active: DashMap::new(),
            maps: DashMap::new(),
            wait_graph: WaitForGraph::new(),
            redo,
        }))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<HandlerPool> {
        &self.pool
    }

    pub fn wait_graph(&self) -> &WaitForGraph {
        &self.wait_graph
    }

    pub fn local_host(&self) -> Option<&HostId> {
        self.local_host.as_ref()
    }

    pub fn begin(self: &Arc<Self>) -> Arc<Transaction> {
        let id = TxnId(self.next_txn_id.fetch_add(1, Ordering::AcqRel));
        let txn = Arc::new(Transaction::new(id, Arc::downgrade(self)));
        self.active.insert(id, Arc::clone(&txn));
        txn
    }

    pub fn get_transaction(&self, id: TxnId) -> Option<Arc<Transaction>> {
        self.active.get(&id).map(|t| Arc::clone(&t))
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Open (or fetch) the named transactional map.
    pub fn open_map(&self, name: &str) -> KestrelResult<Arc<BTreeMap<TValue>>> {
        if let Some(map) = self.maps.get(name) {
            return Ok(Arc::clone(&map));
        }
        let map = BTreeMap::open(
            name,
            self.dir.as_deref(),
            self.config.clone(),
            Arc::new(TValueType),
            Arc::clone(&self.pool),
            self.local_host.clone(),
        )?;
        let entry = self
            .maps
            .entry(name.to_string())
            .or_insert_with(|| Arc::clone(&map));
        Ok(Arc::clone(&entry))
    }

    /// A transaction's view of the named map.
    pub fn open_transaction_map(
        &self,
        name: &str,
        txn: &Arc<Transaction>,
    ) -> KestrelResult<TransactionMap> {
        let map = self.open_map(name)?;
        Ok(TransactionMap::new(map, Arc::clone(txn)))
    }

    pub fn get_map(&self, name: &str) -> Option<Arc<BTreeMap<TValue>>> {
        self.maps.get(name).map(|m| Arc::clone(&m))
    }

    /// Persist a committing transaction's redo buffer before the commit
    /// is acknowledged.
    pub(crate) fn append_redo(&self, txn_id: TxnId, buffer: &[u8]) -> KestrelResult<()> {
        if let Some(redo) = &self.redo {
            redo.append(txn_id, buffer).map_err(KestrelError::Storage)?;
        }
        Ok(())
    }

    /// Wake released waiters FIFO: `Waiting → Open`, then notify the
    /// session listener so the parked write retries.
    pub(crate) fn wake_waiters(&self, waiters: Vec<WaitingTransaction>) {
        for waiter in waiters {
            if let Some(txn) = self.get_transaction(waiter.txn_id) {
                txn.wake_from_wait();
            }
            waiter.listener.operation_complete();
        }
    }

    /// Physically drop cells that ended vacant (aborted inserts,
    /// committed removes). Guarded so a cell revived by a concurrent
    /// writer survives. Asynchronous: commits may run on handler
    /// threads, which must never park on their own queues.
    pub(crate) fn purge_vacant(&self, vacant: &[(String, Datum)]) {
        for (map_name, key) in vacant {
            let Some(map) = self.get_map(map_name) else {
                continue;
            };
            let warn_key = format!("{map_name}/{key}");
            map.write_guarded_async(
                key.clone(),
                Box::new(|current: Option<&TValue>| match current {
                    Some(cell) if cell.is_vacant() => GuardDecision::Delete,
                    _ => GuardDecision::Keep,
                }),
                Box::new(move |result| {
                    if let Err(e) = result.into_result() {
                        tracing::warn!(cell = %warn_key, "vacant purge failed: {e}");
                    }
                }),
            );
        }
    }

    /// Commit/rollback epilogue: forget the transaction.
    pub(crate) fn finish(&self, txn_id: TxnId) {
        self.active.remove(&txn_id);
        self.wait_graph.remove_txn(txn_id);
    }

    /// Scheduler-driven sweep: abort waiters past their deadline.
    pub fn check_timeouts(&self) {
        let now = Instant::now();
        for entry in self.active.iter() {
            let txn = entry.value();
            let deadline = *txn.wait_deadline.lock();
            let expired = deadline.map(|d| d <= now).unwrap_or(false);
            if expired {
                tracing::warn!(txn = %txn.id(), "lock wait timed out, aborting waiter");
                txn.listener()
                    .set_exception(KestrelError::Txn(TxnError::LockTimeout(txn.id())));
            }
        }
    }

    /// Flush every open map to its page store.
    pub fn save_all(&self) -> KestrelResult<()> {
        for entry in self.maps.iter() {
            entry.value().save()?;
        }
        Ok(())
    }

    pub fn close(&self) {
        for entry in self.maps.iter() {
            entry.value().close();
        }
        self.maps.clear();
    }
}
