//! The logical storage RPC surface and an in-process transport.
//!
//! Network transports are an external collaborator; the cluster core only
//! speaks this trait. `LocalNode` implements it directly against a
//! transaction engine and is what the tests (and embedded deployments)
//! run against. Every write RPC carries a replication name; the replica
//! orders conflicting writes by name and discards duplicates on retry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use kestrel_common::datum::Datum;
use kestrel_common::error::{ClusterError, KestrelError, KestrelResult};
use kestrel_common::types::HostId;

use kestrel_storage::{LeafPageMovePlan, PageKey};
use kestrel_txn::TransactionEngine;

use crate::replication::ReplicationName;

/// The replication RPC surface (spec'd wire operations, transport-free).
pub trait StorageRpc: Send + Sync {
    fn host_id(&self) -> HostId;

    fn get(&self, map_name: &str, key: &Datum) -> KestrelResult<Option<Datum>>;

    fn put(
        &self,
        rn: &ReplicationName,
        map_name: &str,
        key: Datum,
        value: Datum,
        add_if_absent: bool,
    ) -> KestrelResult<Option<Datum>>;

    fn append(&self, rn: &ReplicationName, map_name: &str, value: Datum) -> KestrelResult<Datum>;

    fn replace(
        &self,
        rn: &ReplicationName,
        map_name: &str,
        key: Datum,
        old: Datum,
        new: Datum,
    ) -> KestrelResult<bool>;

    fn remove(&self, rn: &ReplicationName, map_name: &str, key: Datum)
        -> KestrelResult<Option<Datum>>;

    fn prepare_move_leaf_page(
        &self,
        map_name: &str,
        plan: &LeafPageMovePlan,
    ) -> KestrelResult<Option<LeafPageMovePlan>>;

    fn move_leaf_page(
        &self,
        map_name: &str,
        page_key: &PageKey,
        image: &[u8],
        add_page: bool,
    ) -> KestrelResult<()>;

    fn remove_leaf_page(&self, map_name: &str, page_key: &PageKey) -> KestrelResult<()>;

    fn read_remote_page(&self, map_name: &str, page_key: &PageKey) -> KestrelResult<Vec<u8>>;

    /// Seal a coordinated write: mark the retried replication names as
    /// applied for the key so a duplicate delivery is discarded.
    fn replication_commit(
        &self,
        map_name: &str,
        valid_key: Option<Datum>,
        auto_commit: bool,
        retry_replication_names: &[ReplicationName],
    ) -> KestrelResult<()>;
}

/// In-process replica node: the trait applied straight to a local engine.
pub struct LocalNode {
    host: HostId,
    engine: Arc<TransactionEngine>,
    /// Last applied replication name per (map, key); stale or duplicate
    /// names are discarded, which is what makes retries idempotent.
    applied: DashMap<(String, Datum), ReplicationName>,
    /// Test/failure hook: a downed replica rejects everything.
    down: AtomicBool,
}

impl LocalNode {
    pub fn new(host: HostId, engine: Arc<TransactionEngine>) -> Arc<Self> {
        Arc::new(Self {
            host,
            engine,
            applied: DashMap::new(),
            down: AtomicBool::new(false),
        })
    }

    pub fn engine(&self) -> &Arc<TransactionEngine> {
        &self.engine
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Release);
    }

    fn check_up(&self) -> KestrelResult<()> {
        if self.down.load(Ordering::Acquire) {
            return Err(KestrelError::Cluster(ClusterError::ReplicaUnavailable(
                self.host.clone(),
            )));
        }
        Ok(())
    }

    /// Order check: apply only names newer than the last applied for the
    /// key. Returns false for duplicates/stale retries.
    fn should_apply(&self, map_name: &str, key: &Datum, rn: &ReplicationName) -> bool {
        let slot = (map_name.to_string(), key.clone());
        match self.applied.entry(slot) {
            dashmap::mapref::entry::Entry::Occupied(mut e) => {
                if rn > e.get() {
                    e.insert(rn.clone());
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(rn.clone());
                true
            }
        }
    }

    /// Run one auto-committed transactional operation.
    fn auto_commit<T>(
        &self,
        map_name: &str,
        op: impl FnOnce(&kestrel_txn::TransactionMap) -> KestrelResult<T>,
    ) -> KestrelResult<T> {
        let txn = self.engine.begin();
        let map = self.engine.open_transaction_map(map_name, &txn)?;
        match op(&map) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(e) => {
                let _ = txn.rollback();
                Err(e)
            }
        }
    }
}

impl StorageRpc for LocalNode {
    fn host_id(&self) -> HostId {
        self.host.clone()
    }

    fn get(&self, map_name: &str, key: &Datum) -> KestrelResult<Option<Datum>> {
        self.check_up()?;
        let txn = self.engine.begin();
        let map = self.engine.open_transaction_map(map_name, &txn)?;
        let value = map.get(key);
        txn.rollback()?;
        Ok(value)
    }

    fn put(
        &self,
        rn: &ReplicationName,
        map_name: &str,
        key: Datum,
        value: Datum,
        add_if_absent: bool,
    ) -> KestrelResult<Option<Datum>> {
        self.check_up()?;
        if !self.should_apply(map_name, &key, rn) {
            tracing::debug!(host = %self.host, %rn, "discarding stale replicated put");
            return self.get(map_name, &key);
        }
        self.auto_commit(map_name, |map| {
            if add_if_absent {
                map.put_if_absent(key.clone(), value)
            } else {
                map.put(key.clone(), value)
            }
        })
    }

    fn append(&self, rn: &ReplicationName, map_name: &str, value: Datum) -> KestrelResult<Datum> {
        self.check_up()?;
        let key = self.auto_commit(map_name, |map| map.append(value))?;
        // Appends get their order slot under the key they landed on.
        self.should_apply(map_name, &key, rn);
        Ok(key)
    }

    fn replace(
        &self,
        rn: &ReplicationName,
        map_name: &str,
        key: Datum,
        old: Datum,
        new: Datum,
    ) -> KestrelResult<bool> {
        self.check_up()?;
        if !self.should_apply(map_name, &key, rn) {
            return Ok(self.get(map_name, &key)?.as_ref() == Some(&new));
        }
        self.auto_commit(map_name, |map| {
            let current = map.get(&key);
            if current.as_ref() == Some(&old) {
                map.put(key.clone(), new)?;
                Ok(true)
            } else {
                Ok(false)
            }
        })
    }

    fn remove(
        &self,
        rn: &ReplicationName,
        map_name: &str,
        key: Datum,
    ) -> KestrelResult<Option<Datum>> {
        self.check_up()?;
        if !self.should_apply(map_name, &key, rn) {
            return self.get(map_name, &key);
        }
        self.auto_commit(map_name, |map| map.remove(key.clone()))
    }

    fn prepare_move_leaf_page(
        &self,
        map_name: &str,
        plan: &LeafPageMovePlan,
    ) -> KestrelResult<Option<LeafPageMovePlan>> {
        self.check_up()?;
        let map = self.engine.open_map(map_name)?;
        Ok(map.prepare_move_leaf_page(plan))
    }

    fn move_leaf_page(
        &self,
        map_name: &str,
        page_key: &PageKey,
        image: &[u8],
        add_page: bool,
    ) -> KestrelResult<()> {
        self.check_up()?;
        let map = self.engine.open_map(map_name)?;
        let page = map.deserialize_leaf(image)?;
        map.add_leaf_page(Some(page_key), page, add_page)
    }

    fn remove_leaf_page(&self, map_name: &str, page_key: &PageKey) -> KestrelResult<()> {
        self.check_up()?;
        let map = self.engine.open_map(map_name)?;
        map.remove_leaf_page(Some(page_key))
    }

    fn read_remote_page(&self, map_name: &str, page_key: &PageKey) -> KestrelResult<Vec<u8>> {
        self.check_up()?;
        let map = self.engine.open_map(map_name)?;
        map.serialize_leaf(page_key, false)
    }

    fn replication_commit(
        &self,
        map_name: &str,
        valid_key: Option<Datum>,
        auto_commit: bool,
        retry_replication_names: &[ReplicationName],
    ) -> KestrelResult<()> {
        self.check_up()?;
        // Mark the names as applied so the coordinator's retries of the
        // same logical write are discarded.
        if let Some(key) = valid_key {
            for rn in retry_replication_names {
                self.should_apply(map_name, &key, rn);
            }
        }
        if !auto_commit {
            tracing::debug!(host = %self.host, "replication commit deferred to session commit");
        }
        Ok(())
    }
}
