//! KestrelDB cluster layer: quorum replication over the B-tree map,
//! replication-name ordering, and the two-phase leaf-page move.

pub mod leaf_move;
pub mod replication;
pub mod rpc;


pub use leaf_move::{LeafMoveCoordinator, MoveDecision};
pub use replication::{ReplicaGroup, ReplicatedMap, ReplicationName, ReplicationNameSource};
pub use rpc::{LocalNode, StorageRpc};
