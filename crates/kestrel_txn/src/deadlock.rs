//! Deadlock detection via a wait-for graph.
//!
//! A transaction blocked on a row lock adds the edge `waiter → holder`
//! before parking. A cycle through the waiter means deadlock; the
//! detecting transaction aborts. Edges are removed on wake, commit and
//! rollback.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use kestrel_common::types::TxnId;

pub struct WaitForGraph {
    /// waiter → holders it is blocked on.
    edges: Mutex<HashMap<TxnId, HashSet<TxnId>>>,
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            edges: Mutex::new(HashMap::new()),
        }
    }

    /// Record the wait and check whether it closes a cycle back to
    /// `waiter`. On deadlock the edge is removed again and the cycle
    /// returned for the error message.
    pub fn add_wait_checked(&self, waiter: TxnId, holder: TxnId) -> Option<Vec<TxnId>> {
        let mut edges = self.edges.lock();
        edges.entry(waiter).or_default().insert(holder);

        // Iterative walk of the lock-holder chain from the new holder.
        let mut stack = vec![(holder, vec![waiter, holder])];
        let mut visited = HashSet::new();
        while let Some((node, path)) = stack.pop() {
            if !visited.insert(node) {
                continue;
            }
            if let Some(next) = edges.get(&node) {
                for &n in next {
                    if n == waiter {
                        // Undo the edge before reporting; the waiter aborts.
                        if let Some(holders) = edges.get_mut(&waiter) {
                            holders.remove(&holder);
                            if holders.is_empty() {
                                edges.remove(&waiter);
                            }
                        }
                        return Some(path);
                    }
                    let mut p = path.clone();
                    p.push(n);
                    stack.push((n, p));
                }
            }
        }
        None
    }

    /// Drop all wait edges involving a transaction (commit, rollback,
    /// wake-up).
    pub fn remove_txn(&self, txn_id: TxnId) {
        let mut edges = self.edges.lock();
        edges.remove(&txn_id);
        for holders in edges.values_mut() {
            holders.remove(&txn_id);
        }
    }

    pub fn remove_wait(&self, waiter: TxnId, holder: TxnId) {
        let mut edges = self.edges.lock();
        if let Some(holders) = edges.get_mut(&waiter) {
            holders.remove(&holder);
            if holders.is_empty() {
                edges.remove(&waiter);
            }
        }
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().values().map(|s| s.len()).sum()
    }
}

pub fn format_cycle(cycle: &[TxnId]) -> String {
    cycle
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_cycle_on_chain() {
        let wfg = WaitForGraph::new();
        assert!(wfg.add_wait_checked(TxnId(1), TxnId(2)).is_none());
        assert!(wfg.add_wait_checked(TxnId(2), TxnId(3)).is_none());
        assert_eq!(wfg.edge_count(), 2);
    }

    #[test]
    fn test_two_txn_cycle_detected() {
        let wfg = WaitForGraph::new();
        assert!(wfg.add_wait_checked(TxnId(1), TxnId(2)).is_none());
        let cycle = wfg.add_wait_checked(TxnId(2), TxnId(1)).expect("cycle");
        assert!(cycle.contains(&TxnId(1)));
        assert!(cycle.contains(&TxnId(2)));
        // The losing edge was rolled back.
        assert_eq!(wfg.edge_count(), 1);
    }

    #[test]
    fn test_three_txn_cycle_detected() {
        let wfg = WaitForGraph::new();
        assert!(wfg.add_wait_checked(TxnId(1), TxnId(2)).is_none());
        assert!(wfg.add_wait_checked(TxnId(2), TxnId(3)).is_none());
        assert!(wfg.add_wait_checked(TxnId(3), TxnId(1)).is_some());
    }

    #[test]
    fn test_remove_breaks_cycle_potential() {
        let wfg = WaitForGraph::new();
        assert!(wfg.add_wait_checked(TxnId(1), TxnId(2)).is_none());
        wfg.remove_txn(TxnId(1));
        assert!(wfg.add_wait_checked(TxnId(2), TxnId(1)).is_none());
    }
}
