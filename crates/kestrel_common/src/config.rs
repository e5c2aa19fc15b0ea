use serde::{Deserialize, Serialize};

/// How leaf page images are laid out on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStorageMode {
    /// Interleaved (key, value) pairs.
    #[default]
    RowStorage,
    /// All keys, then all values. Lets a column read skip the value block.
    ColumnStorage,
}

/// Configuration recognised by the storage and execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Reject all writes.
    #[serde(default)]
    pub read_only: bool,
    /// Skip persistence entirely.
    #[serde(default)]
    pub in_memory: bool,
    /// Run the map in sharding mode (leaf pages carry replica sets and
    /// splits trigger leaf moves).
    #[serde(default)]
    pub sharding_mode: bool,
    /// Ampersand-separated host list, required in sharding mode on the
    /// first open of a map.
    #[serde(default)]
    pub init_replication_nodes: String,
    #[serde(default)]
    pub page_storage_mode: PageStorageMode,
    /// Keys per leaf before a split.
    #[serde(default = "default_btree_fanout")]
    pub btree_fanout: usize,
    /// Scheduler idle wait when no work is ready (ms).
    #[serde(default = "default_loop_interval_ms")]
    pub scheduler_loop_interval_ms: u64,
    /// Page-operation handler idle wait (ms).
    #[serde(default = "default_loop_interval_ms")]
    pub handler_loop_interval_ms: u64,
    /// Page-operation handler pool size.
    #[serde(default = "default_handler_pool_size")]
    pub handler_pool_size: usize,
    /// Idle sessions cached per remote URL.
    #[serde(default = "default_session_pool_queue_size")]
    pub session_pool_queue_size: usize,
    /// Replication read/write retry rounds.
    #[serde(default = "default_max_tries")]
    pub max_tries: usize,
    /// Row-lock wait deadline (ms). 0 = no timeout.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_btree_fanout() -> usize {
    32
}

fn default_loop_interval_ms() -> u64 {
    100
}

fn default_handler_pool_size() -> usize {
    4
}

fn default_session_pool_queue_size() -> usize {
    3
}

fn default_max_tries() -> usize {
    3
}

fn default_lock_timeout_ms() -> u64 {
    10_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_only: false,
            in_memory: false,
            sharding_mode: false,
            init_replication_nodes: String::new(),
            page_storage_mode: PageStorageMode::default(),
            btree_fanout: default_btree_fanout(),
            scheduler_loop_interval_ms: default_loop_interval_ms(),
            handler_loop_interval_ms: default_loop_interval_ms(),
            handler_pool_size: default_handler_pool_size(),
            session_pool_queue_size: default_session_pool_queue_size(),
            max_tries: default_max_tries(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// In-memory config for tests and embedded use.
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Default::default()
        }
    }

    /// Parse the ampersand-separated replication node list.
    pub fn init_replication_node_list(&self) -> Vec<String> {
        if self.init_replication_nodes.is_empty() {
            return Vec::new();
        }
        self.init_replication_nodes
            .split('&')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}
