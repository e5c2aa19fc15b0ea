//! Quorum replication.
//!
//! Writes fan out to all replicas in parallel and succeed at
//! `W = N/2 + 1` acknowledgements; reads pick a random replica and retry
//! elsewhere on failure. Conflicting writes to one key are totally
//! ordered by replication name: `(sequence, coordinator host id)`, the
//! host id breaking ties between coordinators lexicographically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use kestrel_common::datum::Datum;
use kestrel_common::error::{ClusterError, KestrelError, KestrelResult};
use kestrel_common::types::HostId;

use crate::rpc::StorageRpc;

/// Per-write identifier giving conflicting replicated writes a total
/// order per key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicationName {
    pub seq: u64,
    pub coordinator: HostId,
}

impl std::fmt::Display for ReplicationName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.seq, self.coordinator)
    }
}

/// Monotonic replication-name source, one per coordinating session.
pub struct ReplicationNameSource {
    coordinator: HostId,
    seq: AtomicU64,
}

impl ReplicationNameSource {
    pub fn new(coordinator: HostId) -> Self {
        Self {
            coordinator,
            seq: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> ReplicationName {
        ReplicationName {
            seq: self.seq.fetch_add(1, Ordering::AcqRel) + 1,
            coordinator: self.coordinator.clone(),
        }
    }

    pub fn coordinator(&self) -> &HostId {
        &self.coordinator
    }
}

/// The replicas backing one leaf (or one whole map outside sharding).
pub struct ReplicaGroup {
    nodes: Vec<Arc<dyn StorageRpc>>,
    max_tries: usize,
}

impl ReplicaGroup {
    pub fn new(nodes: Vec<Arc<dyn StorageRpc>>, max_tries: usize) -> Self {
        Self {
            nodes,
            max_tries: max_tries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Arc<dyn StorageRpc>] {
        &self.nodes
    }

    /// Write quorum: `N/2 + 1`.
    pub fn write_quorum(&self) -> usize {
        self.nodes.len() / 2 + 1
    }

    /// Fan `op` out to every replica in parallel; succeed once `W`
    /// acknowledge, retrying the round up to `max_tries` times.
    pub fn quorum_write<T, F>(&self, what: &str, op: F) -> KestrelResult<T>
    where
        T: Send,
        F: Fn(&dyn StorageRpc) -> KestrelResult<T> + Sync,
    {
        if self.nodes.is_empty() {
            return Err(KestrelError::Cluster(ClusterError::EmptyReplicaSet));
        }
        let required = self.write_quorum();
        let mut last_acks = 0;
        for round in 1..=self.max_tries {
            let mut results: Vec<Option<KestrelResult<T>>> =
                (0..self.nodes.len()).map(|_| None).collect();
            std::thread::scope(|s| {
                for (slot, node) in results.iter_mut().zip(&self.nodes) {
                    let op = &op;
                    s.spawn(move || {
                        *slot = Some(op(node.as_ref()));
                    });
                }
            });
            let mut acks = Vec::new();
            for (node, result) in self.nodes.iter().zip(results) {
                match result {
                    Some(Ok(value)) => acks.push(value),
                    Some(Err(e)) => {
                        tracing::warn!(host = %node.host_id(), %what, round, "replica nack: {e}");
                    }
                    None => {}
                }
            }
            last_acks = acks.len();
            if last_acks >= required {
                return Ok(acks.remove(0));
            }
            tracing::warn!(%what, round, acks = last_acks, required, "quorum miss, retrying");
        }
        Err(KestrelError::Cluster(ClusterError::QuorumFailed {
            op: what.to_string(),
            acks: last_acks,
            required,
        }))
    }

    /// Read from one random replica, retrying up to `max_tries` times.
    pub fn any_read<T, F>(&self, what: &str, op: F) -> KestrelResult<T>
    where
        F: Fn(&dyn StorageRpc) -> KestrelResult<T>,
    {
        if self.nodes.is_empty() {
            return Err(KestrelError::Cluster(ClusterError::EmptyReplicaSet));
        }
        let mut rng = rand::thread_rng();
        let mut last_err = None;
        for _ in 0..self.max_tries {
            let node = &self.nodes[rng.gen_range(0..self.nodes.len())];
            match op(node.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(host = %node.host_id(), %what, "replica read failed: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(KestrelError::Cluster(ClusterError::EmptyReplicaSet)))
    }
}

/// A map API routed through quorum replication.
pub struct ReplicatedMap {
    name: String,
    group: ReplicaGroup,
    names: ReplicationNameSource,
}

impl ReplicatedMap {
    pub fn new(name: &str, group: ReplicaGroup, coordinator: HostId) -> Self {
        Self {
            name: name.to_string(),
            group,
            names: ReplicationNameSource::new(coordinator),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &ReplicaGroup {
        &self.group
    }

    pub fn get(&self, key: &Datum) -> KestrelResult<Option<Datum>> {
        self.group.any_read("get", |node| node.get(&self.name, key))
    }

    pub fn put(&self, key: Datum, value: Datum) -> KestrelResult<Option<Datum>> {
        let rn = self.names.next();
        let prior = self.group.quorum_write("put", |node| {
            node.put(&rn, &self.name, key.clone(), value.clone(), false)
        })?;
        self.seal(&key, &rn);
        Ok(prior)
    }

    pub fn put_if_absent(&self, key: Datum, value: Datum) -> KestrelResult<Option<Datum>> {
        let rn = self.names.next();
        let prior = self.group.quorum_write("put_if_absent", |node| {
            node.put(&rn, &self.name, key.clone(), value.clone(), true)
        })?;
        self.seal(&key, &rn);
        Ok(prior)
    }

    pub fn replace(&self, key: Datum, old: Datum, new: Datum) -> KestrelResult<bool> {
        let rn = self.names.next();
        let replaced = self.group.quorum_write("replace", |node| {
            node.replace(&rn, &self.name, key.clone(), old.clone(), new.clone())
        })?;
        self.seal(&key, &rn);
        Ok(replaced)
    }

    pub fn remove(&self, key: Datum) -> KestrelResult<Option<Datum>> {
        let rn = self.names.next();
        let prior = self
            .group
            .quorum_write("remove", |node| node.remove(&rn, &self.name, key.clone()))?;
        self.seal(&key, &rn);
        Ok(prior)
    }

    pub fn append(&self, value: Datum) -> KestrelResult<Datum> {
        let rn = self.names.next();
        let key = self
            .group
            .quorum_write("append", |node| node.append(&rn, &self.name, value.clone()))?;
        self.seal(&key, &rn);
        Ok(key)
    }

    /// Retry a write with its original name (recovering a missed
    /// replica); replicas that already applied it discard the duplicate.
    pub fn retry_put(&self, rn: &ReplicationName, key: Datum, value: Datum) -> KestrelResult<()> {
        self.group.quorum_write("retry_put", |node| {
            node.put(rn, &self.name, key.clone(), value.clone(), false)
        })?;
        Ok(())
    }

    /// Mark the round's name applied cluster-wide (best effort; a missed
    /// replica is repaired by the next retry).
    fn seal(&self, key: &Datum, rn: &ReplicationName) {
        for node in self.group.nodes() {
            if let Err(e) = node.replication_commit(
                &self.name,
                Some(key.clone()),
                true,
                std::slice::from_ref(rn),
            ) {
                tracing::debug!(host = %node.host_id(), "replication commit skipped: {e}");
            }
        }
    }

    pub fn next_name(&self) -> ReplicationName {
        self.names.next()
    }
}
