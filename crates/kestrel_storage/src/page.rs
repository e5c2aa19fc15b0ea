//! B-tree pages and the reference slots that link them.
//!
//! A page is one of three variants: a leaf (sorted keys + parallel values),
//! a node (separator keys + child slots), or a remote placeholder standing
//! in for a leaf owned elsewhere. Page content is immutable once published;
//! mutation builds a replacement page and swings the owning `PageRef` slot.
//! Only two metadata fields mutate in place: the persisted position (written
//! once per save) and the replica-host list (rewritten by leaf moves).

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use kestrel_common::datum::Datum;
use kestrel_common::types::HostId;

/// Stable identity counter for leaf pages; drives handler affinity.
static NEXT_PAGE_ID: AtomicU64 = AtomicU64::new(1);

fn next_page_id() -> u64 {
    NEXT_PAGE_ID.fetch_add(1, AtomicOrdering::Relaxed)
}

/// Values stored in a map. The bound is intentionally loose; comparison and
/// serialization come from the injected [`ValueType`].
pub trait Value: Clone + Send + Sync + std::fmt::Debug + 'static {}
impl<T: Clone + Send + Sync + std::fmt::Debug + 'static> Value for T {}

/// Injected comparator + serialiser for map values.
pub trait ValueType<V>: Send + Sync + 'static {
    fn compare(&self, a: &V, b: &V) -> Ordering;
    fn encode(&self, v: &V, buf: &mut Vec<u8>);
    fn decode(&self, buf: &[u8]) -> Result<V, String>;

    /// Whether the value counts as null at the write boundary.
    fn is_null(&self, _v: &V) -> bool {
        false
    }
}

/// Stock value type for plain `Datum` values.
pub struct DatumType;

impl ValueType<Datum> for DatumType {
    fn compare(&self, a: &Datum, b: &Datum) -> Ordering {
        a.cmp(b)
    }

    fn encode(&self, v: &Datum, buf: &mut Vec<u8>) {
        let bytes = bincode::serialize(v).expect("datum serialization is infallible");
        buf.extend_from_slice(&bytes);
    }

    fn decode(&self, buf: &[u8]) -> Result<Datum, String> {
        bincode::deserialize(buf).map_err(|e| e.to_string())
    }

    fn is_null(&self, v: &Datum) -> bool {
        v.is_null()
    }
}

/// Separator key naming a leaf page: the key, a flag distinguishing the
/// left/right child that share the separator, and the persisted position.
/// Equality and ordering ignore `pos`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageKey {
    pub key: Datum,
    pub first: bool,
    pub pos: u64,
}

impl PageKey {
    pub fn new(key: Datum, first: bool) -> Self {
        Self { key, first, pos: 0 }
    }

    pub fn with_pos(key: Datum, first: bool, pos: u64) -> Self {
        Self { key, first, pos }
    }
}

impl PartialEq for PageKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.first == other.first
    }
}

impl Eq for PageKey {}

impl std::hash::Hash for PageKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key.hash(state);
        self.first.hash(state);
    }
}

impl std::fmt::Display for PageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.key, if self.first { "/first" } else { "" })
    }
}

/// Proposal negotiated to quorum before a leaf changes hands.
/// Rounds carry an increasing `index`; replicas accept the largest seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafPageMovePlan {
    pub mover_host_id: HostId,
    pub replication_nodes: Vec<HostId>,
    pub page_key: PageKey,
    pub index: u32,
}

impl LeafPageMovePlan {
    pub fn new(mover_host_id: HostId, replication_nodes: Vec<HostId>, page_key: PageKey) -> Self {
        Self {
            mover_host_id,
            replication_nodes,
            page_key,
            index: 1,
        }
    }

    pub fn next_round(&self) -> Self {
        let mut plan = self.clone();
        plan.index += 1;
        plan
    }
}

/// Page content, immutable once published.
#[derive(Debug)]
pub enum PageContent<V: Value> {
    Leaf {
        keys: Vec<Datum>,
        values: Vec<V>,
    },
    Node {
        /// Separator keys; `children.len() == keys.len() + 1`.
        keys: Vec<Datum>,
        children: Vec<Arc<PageRef<V>>>,
    },
    Remote,
}

/// A B-tree page.
pub struct Page<V: Value> {
    /// Stable logical identity. Copy-on-write replacements of the same
    /// leaf keep the id so handler affinity survives rewrites; a split's
    /// right half gets a fresh id.
    id: u64,
    content: PageContent<V>,
    /// chunk_id << 32 | offset once persisted, 0 while dirty/in-memory.
    pos: AtomicU64,
    /// Replica hosts owning this page; `None` outside sharding mode.
    replication_host_ids: RwLock<Option<Vec<HostId>>>,
    /// Move negotiation state for this leaf, if any.
    move_plan: Mutex<Option<LeafPageMovePlan>>,
}

impl<V: Value> std::fmt::Debug for Page<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("key_count", &self.key_count())
            .finish()
    }
}

impl<V: Value> Page<V> {
    pub fn empty_leaf() -> Arc<Self> {
        Self::leaf(Vec::new(), Vec::new())
    }

    pub fn leaf(keys: Vec<Datum>, values: Vec<V>) -> Arc<Self> {
        debug_assert_eq!(keys.len(), values.len());
        Arc::new(Self {
            id: next_page_id(),
            content: PageContent::Leaf { keys, values },
            pos: AtomicU64::new(0),
            replication_host_ids: RwLock::new(None),
            move_plan: Mutex::new(None),
        })
    }

    /// A leaf that replaces `prev` (same logical identity, same replicas).
    pub fn leaf_from(prev: &Page<V>, keys: Vec<Datum>, values: Vec<V>) -> Arc<Self> {
        debug_assert_eq!(keys.len(), values.len());
        Arc::new(Self {
            id: prev.id,
            content: PageContent::Leaf { keys, values },
            pos: AtomicU64::new(0),
            replication_host_ids: RwLock::new(prev.replication_host_ids()),
            move_plan: Mutex::new(prev.move_plan()),
        })
    }

    pub fn node(keys: Vec<Datum>, children: Vec<Arc<PageRef<V>>>) -> Arc<Self> {
        debug_assert_eq!(keys.len() + 1, children.len());
        Arc::new(Self {
            id: next_page_id(),
            content: PageContent::Node { keys, children },
            pos: AtomicU64::new(0),
            replication_host_ids: RwLock::new(None),
            move_plan: Mutex::new(None),
        })
    }

    /// A node that replaces `prev` in its slot.
    pub fn node_from(prev: &Page<V>, keys: Vec<Datum>, children: Vec<Arc<PageRef<V>>>) -> Arc<Self> {
        debug_assert_eq!(keys.len() + 1, children.len());
        Arc::new(Self {
            id: prev.id,
            content: PageContent::Node { keys, children },
            pos: AtomicU64::new(0),
            replication_host_ids: RwLock::new(prev.replication_host_ids()),
            move_plan: Mutex::new(None),
        })
    }

    pub fn remote(hosts: Vec<HostId>) -> Arc<Self> {
        Arc::new(Self {
            id: next_page_id(),
            content: PageContent::Remote,
            pos: AtomicU64::new(0),
            replication_host_ids: RwLock::new(Some(hosts)),
            move_plan: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn content(&self) -> &PageContent<V> {
        &self.content
    }

    pub fn kind(&self) -> &'static str {
        match self.content {
            PageContent::Leaf { .. } => "leaf",
            PageContent::Node { .. } => "node",
            PageContent::Remote => "remote",
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.content, PageContent::Leaf { .. })
    }

    pub fn is_node(&self) -> bool {
        matches!(self.content, PageContent::Node { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.content, PageContent::Remote)
    }

    pub fn key_count(&self) -> usize {
        match &self.content {
            PageContent::Leaf { keys, .. } | PageContent::Node { keys, .. } => keys.len(),
            PageContent::Remote => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.key_count() == 0
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(AtomicOrdering::Acquire)
    }

    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, AtomicOrdering::Release);
    }

    /// Dirty means never persisted under the current content.
    pub fn is_dirty(&self) -> bool {
        self.pos() == 0
    }

    pub fn replication_host_ids(&self) -> Option<Vec<HostId>> {
        self.replication_host_ids.read().clone()
    }

    pub fn set_replication_host_ids(&self, hosts: Option<Vec<HostId>>) {
        *self.replication_host_ids.write() = hosts;
    }

    pub fn move_plan(&self) -> Option<LeafPageMovePlan> {
        self.move_plan.lock().clone()
    }

    pub fn set_move_plan(&self, plan: Option<LeafPageMovePlan>) {
        *self.move_plan.lock() = plan;
    }

    /// Accept a move plan if it carries a larger round index than the one
    /// already held; returns the plan that ends up accepted.
    pub fn accept_move_plan(&self, plan: &LeafPageMovePlan) -> LeafPageMovePlan {
        let mut held = self.move_plan.lock();
        let replace = match held.as_ref() {
            Some(existing) => existing.index < plan.index,
            None => true,
        };
        if replace {
            *held = Some(plan.clone());
            plan.clone()
        } else {
            held.clone().expect("plan held")
        }
    }

    /// Binary search within a page. `Err(i)` is the insertion point.
    pub fn binary_search(&self, key: &Datum) -> Result<usize, usize> {
        match &self.content {
            PageContent::Leaf { keys, .. } | PageContent::Node { keys, .. } => {
                keys.binary_search_by(|k| k.cmp(key))
            }
            PageContent::Remote => Err(0),
        }
    }

    /// Child index a key routes to in a node. A key equal to a separator
    /// routes right, so the separator's own entries live in the right child.
    pub fn page_index(&self, key: &Datum) -> usize {
        match self.binary_search(key) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    pub fn leaf_keys(&self) -> &[Datum] {
        match &self.content {
            PageContent::Leaf { keys, .. } => keys,
            _ => &[],
        }
    }

    pub fn leaf_entry(&self, index: usize) -> Option<(&Datum, &V)> {
        match &self.content {
            PageContent::Leaf { keys, values } => Some((keys.get(index)?, values.get(index)?)),
            _ => None,
        }
    }

    pub fn node_children(&self) -> &[Arc<PageRef<V>>] {
        match &self.content {
            PageContent::Node { children, .. } => children,
            _ => &[],
        }
    }

    pub fn node_keys(&self) -> &[Datum] {
        match &self.content {
            PageContent::Node { keys, .. } => keys,
            _ => &[],
        }
    }

    /// Descend to the leaf (or remote placeholder) that owns `key`.
    pub fn goto_leaf(self: &Arc<Self>, key: &Datum) -> Arc<Page<V>> {
        let mut p = Arc::clone(self);
        loop {
            match p.content() {
                PageContent::Node { children, .. } => {
                    let idx = p.page_index(key);
                    let child = children[idx].page();
                    p = child;
                }
                _ => return p,
            }
        }
    }

    /// Descend for a page key. The `first` flag picks the left of the two
    /// children sharing the separator; a plain key lookup always routes
    /// right on equality.
    pub fn goto_leaf_for(self: &Arc<Self>, page_key: &PageKey) -> Arc<Page<V>> {
        let mut p = Arc::clone(self);
        loop {
            match p.content() {
                PageContent::Node { children, .. } => {
                    let idx = match p.binary_search(&page_key.key) {
                        Ok(i) => {
                            if page_key.first {
                                i
                            } else {
                                i + 1
                            }
                        }
                        Err(i) => i,
                    };
                    let child = children[idx].page();
                    p = child;
                }
                _ => return p,
            }
        }
    }
}

/// The slot through which a parent (or the map root) points at a page.
/// Replacing the slot's page is the only publication step a mutation needs;
/// readers clone the `Arc` and never block each other.
pub struct PageRef<V: Value> {
    page: RwLock<Arc<Page<V>>>,
}

impl<V: Value> PageRef<V> {
    pub fn new(page: Arc<Page<V>>) -> Arc<Self> {
        Arc::new(Self {
            page: RwLock::new(page),
        })
    }

    pub fn page(&self) -> Arc<Page<V>> {
        Arc::clone(&self.page.read())
    }

    /// Swing the slot to a fully constructed replacement page.
    pub fn replace(&self, page: Arc<Page<V>>) {
        *self.page.write() = page;
    }
}

impl<V: Value> std::fmt::Debug for PageRef<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PageRef({:?})", self.page())
    }
}
