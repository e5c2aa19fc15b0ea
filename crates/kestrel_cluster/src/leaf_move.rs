//! Leaf-page move negotiation: the small two-phase agreement run before
//! a leaf changes hands.
//!
//! The coordinator proposes a `LeafPageMovePlan` to the old replicas;
//! each replica keeps the plan with the largest round index it has seen
//! and answers with what it accepted. The coordinator validates at
//! quorum: (a) a plan with ≥W identical mover acknowledgements wins,
//! (b) otherwise the lexicographically largest mover among ≥W total
//! acks wins, (c) otherwise the round repeats with `index + 1`. A losing
//! coordinator only updates its local replica list. The same algorithm
//! covers the client-server → replication → sharding transitions: the
//! old-node set is just empty, single or multi-valued.

use std::collections::HashMap;
use std::sync::Arc;

use kestrel_common::error::{ClusterError, KestrelError, KestrelResult};
use kestrel_common::types::HostId;

use kestrel_storage::{BTreeMap, LeafPageMovePlan, Page, PageKey, Value};

use crate::rpc::StorageRpc;

/// What a negotiation round concluded.
#[derive(Debug)]
pub enum MoveDecision {
    /// This coordinator won; it must ship the page.
    Mover(LeafPageMovePlan),
    /// Another coordinator won; adopt its replica list and stand down.
    Yield(LeafPageMovePlan),
}

pub struct LeafMoveCoordinator {
    local_host: HostId,
    max_rounds: u32,
}

impl LeafMoveCoordinator {
    pub fn new(local_host: HostId, max_rounds: u32) -> Self {
        Self {
            local_host,
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn local_host(&self) -> &HostId {
        &self.local_host
    }

    /// Negotiate who moves the leaf under `page_key`.
    ///
    /// With zero or one old replica there is nothing to agree on: the
    /// proposal stands as-is (the mode-transition fast path).
    pub fn negotiate(
        &self,
        map_name: &str,
        page_key: PageKey,
        new_replicas: Vec<HostId>,
        old_replicas: &[Arc<dyn StorageRpc>],
    ) -> KestrelResult<MoveDecision> {
        let mut plan =
            LeafPageMovePlan::new(self.local_host.clone(), new_replicas, page_key.clone());
        if old_replicas.len() <= 1 {
            return Ok(MoveDecision::Mover(plan));
        }
        let required = old_replicas.len() / 2 + 1;

        for _ in 0..self.max_rounds {
            let mut acks: Vec<LeafPageMovePlan> = Vec::new();
            for node in old_replicas {
                match node.prepare_move_leaf_page(map_name, &plan) {
                    Ok(Some(accepted)) => acks.push(accepted),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(host = %node.host_id(), "prepare_move_leaf_page failed: {e}");
                    }
                }
            }

            // (a) ≥W replicas accepted the same mover for this round.
            let mut by_mover: HashMap<&HostId, usize> = HashMap::new();
            for ack in &acks {
                *by_mover.entry(&ack.mover_host_id).or_default() += 1;
            }
            let winner = by_mover
                .iter()
                .find(|(_, count)| **count >= required)
                .map(|(mover, _)| (*mover).clone());
            if let Some(mover) = winner {
                let plan = acks
                    .iter()
                    .find(|a| a.mover_host_id == mover)
                    .cloned()
                    .expect("winner counted from acks");
                return Ok(self.decide(plan));
            }

            // (b) enough acks overall: the largest mover id wins.
            if acks.len() >= required {
                let plan = acks
                    .iter()
                    .max_by(|a, b| a.mover_host_id.cmp(&b.mover_host_id))
                    .cloned()
                    .expect("non-empty acks");
                return Ok(self.decide(plan));
            }

            // (c) no agreement: next round with a larger index.
            tracing::debug!(
                page_key = %plan.page_key,
                index = plan.index,
                acks = acks.len(),
                "move round inconclusive, retrying"
            );
            plan = plan.next_round();
        }

        Err(KestrelError::Cluster(ClusterError::MovePlanLost {
            page_key: page_key.to_string(),
            index: plan.index,
        }))
    }

    fn decide(&self, plan: LeafPageMovePlan) -> MoveDecision {
        if plan.mover_host_id == self.local_host {
            MoveDecision::Mover(plan)
        } else {
            MoveDecision::Yield(plan)
        }
    }

    /// Carry out a won move: ship the leaf image to the new replicas, a
    /// metadata-only record to the other candidates, and rewire the local
    /// parent to a remote reference if this host left the replica set.
    pub fn execute_move<V: Value>(
        &self,
        map: &Arc<BTreeMap<V>>,
        plan: &LeafPageMovePlan,
        candidates: &[Arc<dyn StorageRpc>],
    ) -> KestrelResult<()> {
        // Re-resolve by key: the page may have taken writes since the
        // proposal, and moving a stale image would lose them.
        let Some(leaf) = map.set_leaf_page_move_plan(&plan.page_key, plan.clone()) else {
            return Ok(());
        };
        leaf.set_replication_host_ids(Some(plan.replication_nodes.clone()));

        let data_image = map.serialize_leaf(&plan.page_key, false)?;
        let meta_image = map.serialize_leaf(&plan.page_key, true)?;

        for node in candidates {
            let host = node.host_id();
            if host == self.local_host {
                continue;
            }
            let (image, add_page) = if plan.replication_nodes.contains(&host) {
                (&data_image, true)
            } else {
                (&meta_image, false)
            };
            if let Err(e) = node.move_leaf_page(map.name(), &plan.page_key, image, add_page) {
                tracing::warn!(host = %host, "move_leaf_page failed: {e}");
            }
        }

        if !plan.replication_nodes.contains(&self.local_host) {
            // No longer a replica here: the parent keeps only a remote
            // placeholder carrying the new host list.
            let remote: Arc<Page<V>> = Page::remote(plan.replication_nodes.clone());
            map.add_leaf_page(Some(&plan.page_key), remote, false)?;
        }
        Ok(())
    }

    /// Stand down after losing the round: adopt the winner's replica
    /// list locally.
    pub fn adopt_plan<V: Value>(&self, map: &Arc<BTreeMap<V>>, plan: &LeafPageMovePlan) {
        if let Some(leaf) = map.set_leaf_page_move_plan(&plan.page_key, plan.clone()) {
            leaf.set_replication_host_ids(Some(plan.replication_nodes.clone()));
        }
    }
}
