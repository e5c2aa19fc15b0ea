//! The copy-on-write B-tree map.
//!
//! Reads take no page locks: a descent clones `Arc`s out of reference
//! slots and always observes fully constructed pages. Writes are packaged
//! as single-key page operations serialised per leaf by the handler pool;
//! structural changes (splits, replica-side splices, clear) additionally
//! take the whole-tree latch. Split publication is ordered parent-first
//! so no key ever disappears from concurrent readers.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::handler::PageOperation;
use kestrel_common::config::StoreConfig;
use kestrel_common::datum::Datum;
use kestrel_common::error::{KestrelError, KestrelResult, StorageError};
use kestrel_common::types::{AsyncHandler, AsyncResult, HostId};

use crate::chunk::{LeafBody, PageImage};
use crate::cursor::MapCursor;
use crate::handler::{HandlerPool, OpContext, PageOperationResult, RunnableOperation};
use crate::page::{LeafPageMovePlan, Page, PageContent, PageKey, PageRef, Value, ValueType};
use crate::page_op::{GuardDecision, SingleWrite, SyncListener, WriteKind, WriteOutcome};
use crate::store::PageStore;

/// Listener invoked with the split key after a leaf page split.
pub type SplitListener = Arc<dyn Fn(Datum) + Send + Sync>;
/// Listener invoked when a leaf empties: (page key, its replica hosts).
pub type RemoveListener = Arc<dyn Fn(PageKey, Vec<HostId>) + Send + Sync>;

/// A write descent: the target leaf, its slot, and the node path taken,
/// root first.
pub struct Descent<V: Value> {
    pub leaf: Arc<Page<V>>,
    pub slot: Arc<PageRef<V>>,
    pub path: Vec<(Arc<Page<V>>, Arc<PageRef<V>>, usize)>,
}

pub struct BTreeMap<V: Value> {
    name: String,
    config: StoreConfig,
    value_type: Arc<dyn ValueType<V>>,
    store: PageStore<V>,
    pool: Arc<HandlerPool>,
    /// The root reference; the only mutable global of a map. Written under
    /// the tree latch, read locklessly.
    root: Arc<PageRef<V>>,
    size: AtomicU64,
    max_key: AtomicI64,
    /// Whole-tree latch: shared for `save`, exclusive for structural work.
    latch: RwLock<()>,
    closed: AtomicBool,
    /// Leaf ids with a write in flight; the short-lived latch behind the
    /// dummy handler's "no contention" fast path.
    busy_leaves: dashmap::DashMap<u64, ()>,
    local_host: Option<HostId>,
    split_listener: RwLock<Option<SplitListener>>,
    remove_listener: RwLock<Option<RemoveListener>>,
}

/// Releases the per-leaf write latch on drop.
pub struct LeafLatch<'a, V: Value> {
    map: &'a BTreeMap<V>,
    leaf_id: u64,
}

impl<V: Value> Drop for LeafLatch<'_, V> {
    fn drop(&mut self) {
        self.map.busy_leaves.remove(&self.leaf_id);
    }
}

impl<V: Value> BTreeMap<V> {
    /// Open (or create) a map. `dir` is the storage root; the map's chunks
    /// live under `dir/<name>/`. In-memory maps ignore `dir`.
    pub fn open(
        name: &str,
        dir: Option<&Path>,
        config: StoreConfig,
        value_type: Arc<dyn ValueType<V>>,
        pool: Arc<HandlerPool>,
        local_host: Option<HostId>,
    ) -> KestrelResult<Arc<Self>> {
        let store_dir = if config.in_memory {
            None
        } else {
            dir.map(|d| d.join(name))
        };
        let store = PageStore::new(store_dir, Arc::clone(&value_type), config.page_storage_mode)
            .map_err(KestrelError::Storage)?;

        let map = Self {
            name: name.to_string(),
            config,
            value_type,
            store,
            pool,
            root: PageRef::new(Page::empty_leaf()),
            size: AtomicU64::new(0),
            max_key: AtomicI64::new(0),
            latch: RwLock::new(()),
            closed: AtomicBool::new(false),
            busy_leaves: dashmap::DashMap::new(),
            local_host,
            split_listener: RwLock::new(None),
            remove_listener: RwLock::new(None),
        };

        if let Some(loaded) = map.store.load_last().map_err(KestrelError::Storage)? {
            map.size.store(loaded.map_size, Ordering::Release);
            if let Some(hosts) = loaded.replication_host_ids {
                loaded.root.set_replication_host_ids(Some(hosts));
            }
            map.root.replace(loaded.root);
            // The append counter resumes past both the sealed counter and
            // the largest stored integer key.
            let mut max_key = loaded.max_key;
            if let Some(Datum::Int(last)) = map.last_key() {
                max_key = max_key.max(last);
            }
            map.max_key.store(max_key, Ordering::Release);
        } else if map.config.sharding_mode {
            let nodes = map.config.init_replication_node_list();
            if nodes.is_empty() {
                return Err(KestrelError::Storage(StorageError::MissingReplicationNodes));
            }
            let local = map
                .local_host
                .as_ref()
                .map(|h| nodes.iter().any(|n| n == h))
                .unwrap_or(false);
            let root = if local {
                let r = Page::empty_leaf();
                r.set_replication_host_ids(Some(nodes));
                r
            } else {
                Page::remote(nodes)
            };
            map.root.replace(Arc::clone(&root));
            // Seal the replica metadata before serving anything.
            map.store
                .save(&root, 0, 0, true)
                .map_err(KestrelError::Storage)?;
        }

        Ok(Arc::new(map))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn value_type(&self) -> &Arc<dyn ValueType<V>> {
        &self.value_type
    }

    pub fn pool(&self) -> &Arc<HandlerPool> {
        &self.pool
    }

    pub fn local_host(&self) -> Option<&HostId> {
        self.local_host.as_ref()
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.store.is_closed()
    }

    pub fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    pub fn is_sharding(&self) -> bool {
        self.config.sharding_mode
    }

    pub fn root_page(&self) -> Arc<Page<V>> {
        self.root.page()
    }

    pub fn set_split_listener(&self, listener: SplitListener) {
        *self.split_listener.write() = Some(listener);
    }

    pub fn set_remove_listener(&self, listener: RemoveListener) {
        *self.remove_listener.write() = Some(listener);
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub fn get(&self, key: &Datum) -> Option<V> {
        let leaf = self.root.page().goto_leaf(key);
        match leaf.binary_search(key) {
            Ok(i) => leaf.leaf_entry(i).map(|(_, v)| v.clone()),
            Err(_) => None,
        }
    }

    pub fn contains_key(&self, key: &Datum) -> bool {
        self.get(key).is_some()
    }

    pub fn get_async(&self, key: &Datum, handler: AsyncHandler<V>) {
        match self.get(key) {
            Some(v) => handler(AsyncResult::succeeded(v)),
            None => handler(AsyncResult::empty()),
        }
    }

    pub fn first_key(&self) -> Option<Datum> {
        first_last(&self.root.page(), true)
    }

    pub fn last_key(&self) -> Option<Datum> {
        first_last(&self.root.page(), false)
    }

    /// Largest key strictly below `key`.
    pub fn lower_key(&self, key: &Datum) -> Option<Datum> {
        min_max(&self.root.page(), key, true, true)
    }

    /// Largest key at or below `key`.
    pub fn floor_key(&self, key: &Datum) -> Option<Datum> {
        min_max(&self.root.page(), key, true, false)
    }

    /// Smallest key strictly above `key`.
    pub fn higher_key(&self, key: &Datum) -> Option<Datum> {
        min_max(&self.root.page(), key, false, true)
    }

    /// Smallest key at or above `key`.
    pub fn ceiling_key(&self, key: &Datum) -> Option<Datum> {
        min_max(&self.root.page(), key, false, false)
    }

    pub fn are_values_equal(&self, a: &V, b: &V) -> bool {
        self.value_type.compare(a, b).is_eq()
    }

    /// Lazy forward cursor over `[from, to]`.
    pub fn cursor(&self, from: Option<Datum>, to: Option<Datum>) -> MapCursor<V> {
        MapCursor::new(self.root.page(), from, to)
    }

    /// Cursor over exactly the given leaf pages, in the given order.
    pub fn cursor_over_pages(
        &self,
        page_keys: Vec<PageKey>,
        from: Option<Datum>,
        to: Option<Datum>,
    ) -> MapCursor<V> {
        MapCursor::over_pages(self.root.page(), page_keys, from, to)
    }

    // ── Writes ──────────────────────────────────────────────────────────

    fn check_write(&self) -> KestrelResult<()> {
        if self.is_closed() {
            return Err(KestrelError::Storage(StorageError::MapClosed(
                self.name.clone(),
            )));
        }
        if self.config.read_only {
            return Err(KestrelError::Storage(StorageError::ReadOnly(
                self.name.clone(),
            )));
        }
        Ok(())
    }

    fn check_write_value(&self, value: &V) -> KestrelResult<()> {
        if self.value_type.is_null(value) {
            return Err(KestrelError::Storage(StorageError::NullValue(
                self.name.clone(),
            )));
        }
        self.check_write()
    }

    pub fn put(self: &Arc<Self>, key: Datum, value: V) -> KestrelResult<Option<V>> {
        self.check_write_value(&value)?;
        let op = SingleWrite::new(Arc::clone(self), key, WriteKind::Put { value });
        expect_old(self.run_page_operation(op)?)
    }

    pub fn put_async(self: &Arc<Self>, key: Datum, value: V, handler: AsyncHandler<Option<V>>) {
        if let Err(e) = self.check_write_value(&value) {
            handler(AsyncResult::failed(e));
            return;
        }
        let mut op = SingleWrite::new(Arc::clone(self), key, WriteKind::Put { value });
        op.set_listener(adapt_old(handler));
        self.run_page_operation_async(op);
    }

    pub fn put_if_absent(self: &Arc<Self>, key: Datum, value: V) -> KestrelResult<Option<V>> {
        self.check_write_value(&value)?;
        let op = SingleWrite::new(Arc::clone(self), key, WriteKind::PutIfAbsent { value });
        expect_old(self.run_page_operation(op)?)
    }

    pub fn put_if_absent_async(
        self: &Arc<Self>,
        key: Datum,
        value: V,
        handler: AsyncHandler<Option<V>>,
    ) {
        if let Err(e) = self.check_write_value(&value) {
            handler(AsyncResult::failed(e));
            return;
        }
        let mut op = SingleWrite::new(Arc::clone(self), key, WriteKind::PutIfAbsent { value });
        op.set_listener(adapt_old(handler));
        self.run_page_operation_async(op);
    }

    /// Compare-and-replace by the value comparator.
    pub fn replace(self: &Arc<Self>, key: Datum, old: V, new: V) -> KestrelResult<bool> {
        self.check_write_value(&new)?;
        let op = SingleWrite::new(Arc::clone(self), key, WriteKind::Replace { old, new });
        match self.run_page_operation(op)? {
            WriteOutcome::Replaced(done) => Ok(done),
            other => Err(unexpected(&other)),
        }
    }

    pub fn replace_async(
        self: &Arc<Self>,
        key: Datum,
        old: V,
        new: V,
        handler: AsyncHandler<bool>,
    ) {
        if let Err(e) = self.check_write_value(&new) {
            handler(AsyncResult::failed(e));
            return;
        }
        let mut op = SingleWrite::new(Arc::clone(self), key, WriteKind::Replace { old, new });
        op.set_listener(Box::new(move |result: AsyncResult<WriteOutcome<V>>| {
            handler(match result.into_result() {
                Ok(Some(WriteOutcome::Replaced(done))) => AsyncResult::succeeded(done),
                Ok(_) => AsyncResult::succeeded(false),
                Err(e) => AsyncResult::failed(e),
            })
        }));
        self.run_page_operation_async(op);
    }

    pub fn remove(self: &Arc<Self>, key: Datum) -> KestrelResult<Option<V>> {
        self.check_write()?;
        let op = SingleWrite::new(Arc::clone(self), key, WriteKind::Remove);
        expect_old(self.run_page_operation(op)?)
    }

    pub fn remove_async(self: &Arc<Self>, key: Datum, handler: AsyncHandler<Option<V>>) {
        if let Err(e) = self.check_write() {
            handler(AsyncResult::failed(e));
            return;
        }
        let mut op = SingleWrite::new(Arc::clone(self), key, WriteKind::Remove);
        op.set_listener(adapt_old(handler));
        self.run_page_operation_async(op);
    }

    /// Append under a fresh key reserved from the append counter. The
    /// counter is the only state `append` mutates besides the tree.
    pub fn append(self: &Arc<Self>, value: V) -> KestrelResult<Datum> {
        self.check_write_value(&value)?;
        let key = Datum::Int(self.max_key.fetch_add(1, Ordering::AcqRel) + 1);
        let op = SingleWrite::new(Arc::clone(self), key.clone(), WriteKind::Append { value });
        match self.run_page_operation(op)? {
            WriteOutcome::Appended(k) => Ok(k),
            other => Err(unexpected(&other)),
        }
    }

    pub fn append_async(self: &Arc<Self>, value: V, handler: AsyncHandler<Datum>) {
        if let Err(e) = self.check_write_value(&value) {
            handler(AsyncResult::failed(e));
            return;
        }
        let key = Datum::Int(self.max_key.fetch_add(1, Ordering::AcqRel) + 1);
        let mut op = SingleWrite::new(Arc::clone(self), key, WriteKind::Append { value });
        op.set_listener(Box::new(move |result: AsyncResult<WriteOutcome<V>>| {
            handler(match result.into_result() {
                Ok(Some(WriteOutcome::Appended(k))) => AsyncResult::succeeded(k),
                Ok(_) => AsyncResult::empty(),
                Err(e) => AsyncResult::failed(e),
            })
        }));
        self.run_page_operation_async(op);
    }

    /// A write whose decision runs under the leaf latch, seeing the
    /// current value. The transaction layer's row-lock window.
    pub fn write_guarded(
        self: &Arc<Self>,
        key: Datum,
        guard: Box<dyn FnMut(Option<&V>) -> GuardDecision<V> + Send>,
    ) -> KestrelResult<WriteOutcome<V>> {
        self.check_write()?;
        let op = SingleWrite::new(Arc::clone(self), key, WriteKind::Guarded { guard });
        self.run_page_operation(op)
    }

    /// Async guarded write. The only form safe to call from a handler
    /// thread, which must never park on its own queue.
    pub fn write_guarded_async(
        self: &Arc<Self>,
        key: Datum,
        guard: Box<dyn FnMut(Option<&V>) -> GuardDecision<V> + Send>,
        handler: AsyncHandler<WriteOutcome<V>>,
    ) {
        if let Err(e) = self.check_write() {
            handler(AsyncResult::failed(e));
            return;
        }
        let mut op = SingleWrite::new(Arc::clone(self), key, WriteKind::Guarded { guard });
        op.set_listener(handler);
        self.run_page_operation_async(op);
    }

    /// Route a prepared operation: inline fast path first, then the pool
    /// handler owning the target leaf, parking the caller on a sync
    /// listener.
    fn run_page_operation(
        self: &Arc<Self>,
        mut op: SingleWrite<V>,
    ) -> KestrelResult<WriteOutcome<V>> {
        let listener = SyncListener::new();
        op.set_listener(listener.handler());
        let inline = OpContext {
            pool: Arc::clone(&self.pool),
            handler_id: None,
        };
        match op.run(&inline) {
            PageOperationResult::Succeeded | PageOperationResult::Locked => {
                return take_outcome(listener.try_take());
            }
            PageOperationResult::Retry | PageOperationResult::Shifted => {}
        }
        match op.target_leaf() {
            Some(leaf_id) => self.pool.handler_for_leaf(leaf_id).submit(Box::new(op)),
            None => self.pool.get_handler().submit(Box::new(op)),
        }
        take_outcome(Some(listener.await_result()))
    }

    /// Async routing: the caller's listener is already installed; a
    /// non-inline completion is delivered on the owning handler thread.
    fn run_page_operation_async(self: &Arc<Self>, mut op: SingleWrite<V>) {
        let inline = OpContext {
            pool: Arc::clone(&self.pool),
            handler_id: None,
        };
        match op.run(&inline) {
            PageOperationResult::Succeeded | PageOperationResult::Locked => {}
            PageOperationResult::Retry | PageOperationResult::Shifted => match op.target_leaf() {
                Some(leaf_id) => self.pool.handler_for_leaf(leaf_id).submit(Box::new(op)),
                None => self.pool.get_handler().submit(Box::new(op)),
            },
        }
    }

    // ── Descent and mutation internals (used by SingleWrite) ────────────

    pub(crate) fn descend(&self, key: &Datum) -> Descent<V> {
        let mut slot = Arc::clone(&self.root);
        let mut page = slot.page();
        let mut path = Vec::new();
        loop {
            match page.content() {
                PageContent::Node { children, .. } => {
                    let idx = page.page_index(key);
                    let child_slot = Arc::clone(&children[idx]);
                    path.push((Arc::clone(&page), Arc::clone(&slot), idx));
                    slot = child_slot;
                    page = slot.page();
                }
                _ => {
                    return Descent {
                        leaf: page,
                        slot,
                        path,
                    }
                }
            }
        }
    }

    pub(crate) fn try_latch_leaf(&self, leaf_id: u64) -> Option<LeafLatch<'_, V>> {
        match self.busy_leaves.entry(leaf_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(v) => {
                v.insert(());
                Some(LeafLatch { map: self, leaf_id })
            }
        }
    }

    /// Apply a single-key mutation to the latched leaf.
    pub(crate) fn apply_write(
        &self,
        key: &Datum,
        kind: &mut WriteKind<V>,
        descent: &Descent<V>,
    ) -> WriteOutcome<V> {
        let leaf = &descent.leaf;
        let search = leaf.binary_search(key);
        match kind {
            WriteKind::Put { value } => match search {
                Ok(i) => {
                    let old = leaf.leaf_entry(i).map(|(_, v)| v.clone());
                    self.replace_leaf_value(descent, i, value.clone());
                    WriteOutcome::Old(old)
                }
                Err(i) => {
                    self.insert_leaf_entry(descent, i, key.clone(), value.clone());
                    WriteOutcome::Old(None)
                }
            },
            WriteKind::PutIfAbsent { value } => match search {
                Ok(i) => WriteOutcome::Old(leaf.leaf_entry(i).map(|(_, v)| v.clone())),
                Err(i) => {
                    self.insert_leaf_entry(descent, i, key.clone(), value.clone());
                    WriteOutcome::Old(None)
                }
            },
            WriteKind::Replace { old, new } => match search {
                Ok(i) => {
                    let current = leaf.leaf_entry(i).map(|(_, v)| v.clone());
                    match current {
                        Some(ref cur) if self.value_type.compare(cur, old).is_eq() => {
                            self.replace_leaf_value(descent, i, new.clone());
                            WriteOutcome::Replaced(true)
                        }
                        _ => WriteOutcome::Replaced(false),
                    }
                }
                Err(_) => WriteOutcome::Replaced(false),
            },
            WriteKind::Remove => match search {
                Ok(i) => {
                    let old = leaf.leaf_entry(i).map(|(_, v)| v.clone());
                    self.remove_leaf_entry(descent, i);
                    WriteOutcome::Old(old)
                }
                Err(_) => WriteOutcome::Old(None),
            },
            WriteKind::Append { value } => {
                let i = match search {
                    Ok(i) | Err(i) => i,
                };
                self.insert_leaf_entry(descent, i, key.clone(), value.clone());
                WriteOutcome::Appended(key.clone())
            }
            WriteKind::Guarded { guard } => {
                let current_idx = search.ok();
                let decision = {
                    let current = current_idx.and_then(|i| leaf.leaf_entry(i).map(|(_, v)| v));
                    guard(current)
                };
                match decision {
                    GuardDecision::Apply(v) => match search {
                        Ok(i) => {
                            let old = leaf.leaf_entry(i).map(|(_, v)| v.clone());
                            self.replace_leaf_value(descent, i, v);
                            WriteOutcome::Old(old)
                        }
                        Err(i) => {
                            self.insert_leaf_entry(descent, i, key.clone(), v);
                            WriteOutcome::Old(None)
                        }
                    },
                    GuardDecision::Keep => {
                        WriteOutcome::Old(current_idx.and_then(|i| {
                            leaf.leaf_entry(i).map(|(_, v)| v.clone())
                        }))
                    }
                    GuardDecision::Delete => match search {
                        Ok(i) => {
                            let old = leaf.leaf_entry(i).map(|(_, v)| v.clone());
                            self.remove_leaf_entry(descent, i);
                            WriteOutcome::Old(old)
                        }
                        Err(_) => WriteOutcome::Old(None),
                    },
                    GuardDecision::Locked => WriteOutcome::Locked,
                }
            }
        }
    }

    fn leaf_entries(leaf: &Page<V>) -> (Vec<Datum>, Vec<V>) {
        match leaf.content() {
            PageContent::Leaf { keys, values } => (keys.clone(), values.clone()),
            _ => (Vec::new(), Vec::new()),
        }
    }

    fn replace_leaf_value(&self, descent: &Descent<V>, index: usize, value: V) {
        let (keys, mut values) = Self::leaf_entries(&descent.leaf);
        values[index] = value;
        descent
            .slot
            .replace(Page::leaf_from(&descent.leaf, keys, values));
    }

    fn insert_leaf_entry(&self, descent: &Descent<V>, index: usize, key: Datum, value: V) {
        let (mut keys, mut values) = Self::leaf_entries(&descent.leaf);
        keys.insert(index, key.clone());
        values.insert(index, value);
        let oversized = keys.len() > self.config.btree_fanout;
        descent
            .slot
            .replace(Page::leaf_from(&descent.leaf, keys, values));
        self.size.fetch_add(1, Ordering::AcqRel);
        if oversized {
            self.split_leaf(descent.leaf.id(), &key);
        }
    }

    fn remove_leaf_entry(&self, descent: &Descent<V>, index: usize) {
        let (mut keys, mut values) = Self::leaf_entries(&descent.leaf);
        keys.remove(index);
        values.remove(index);
        let emptied = keys.is_empty();
        descent
            .slot
            .replace(Page::leaf_from(&descent.leaf, keys, values));
        self.size.fetch_sub(1, Ordering::AcqRel);
        if emptied && self.config.sharding_mode && !descent.path.is_empty() {
            self.fire_leaf_page_remove(descent);
        }
    }

    /// Split the oversized leaf, propagating upward. Publication order is
    /// parent before child trim so concurrent readers never miss keys.
    fn split_leaf(&self, leaf_id: u64, key_hint: &Datum) {
        let _w = self.latch.write();
        let descent = self.descend(key_hint);
        let leaf = &descent.leaf;
        if leaf.id() != leaf_id || leaf.key_count() <= self.config.btree_fanout {
            return;
        }

        let (mut keys, mut values) = Self::leaf_entries(leaf);
        let at = keys.len() / 2;
        let right_keys = keys.split_off(at);
        let right_values = values.split_off(at);
        let split_key = right_keys[0].clone();

        let left: Arc<Page<V>> = Page::leaf_from(leaf, keys, values);
        let right: Arc<Page<V>> = Page::leaf(right_keys, right_values);
        right.set_replication_host_ids(leaf.replication_host_ids());

        // Collected bottom-up, applied top-down.
        let mut replacements: Vec<(Arc<PageRef<V>>, Arc<Page<V>>)> = Vec::new();
        let mut sep = split_key.clone();
        let mut left_page = left;
        let mut right_page = right;
        let mut child_slot = Arc::clone(&descent.slot);
        let mut settled = false;

        for (node, node_slot, child_idx) in descent.path.iter().rev() {
            replacements.push((Arc::clone(&child_slot), left_page.clone()));
            let right_slot = PageRef::new(right_page.clone());
            let mut nkeys = node.node_keys().to_vec();
            let mut nchildren = node.node_children().to_vec();
            nkeys.insert(*child_idx, sep.clone());
            nchildren.insert(child_idx + 1, right_slot);
            if nkeys.len() <= self.config.btree_fanout {
                replacements.push((Arc::clone(node_slot), Page::node_from(node, nkeys, nchildren)));
                settled = true;
                break;
            }
            // Node overflow: promote the median and keep climbing.
            let mid = nkeys.len() / 2;
            let promoted = nkeys[mid].clone();
            let right_nkeys = nkeys.split_off(mid + 1);
            nkeys.pop();
            let right_nchildren = nchildren.split_off(mid + 1);
            left_page = Page::node_from(node, nkeys, nchildren);
            right_page = Page::node(right_nkeys, right_nchildren);
            sep = promoted;
            child_slot = Arc::clone(node_slot);
        }

        if !settled {
            // The root itself split (or the root was the leaf); the last
            // slot climbed to is the root reference.
            let left_slot = PageRef::new(left_page);
            let right_slot = PageRef::new(right_page);
            let new_root = Page::node(vec![sep], vec![left_slot, right_slot]);
            replacements.push((child_slot, new_root));
        }

        for (slot, page) in replacements.into_iter().rev() {
            slot.replace(page);
        }

        self.fire_leaf_page_split(split_key);
    }

    fn fire_leaf_page_split(&self, split_key: Datum) {
        if !self.config.sharding_mode {
            return;
        }
        if let Some(listener) = self.split_listener.read().clone() {
            // The move negotiation runs as opaque handler work, never
            // inside the write operation that caused the split.
            self.pool
                .add_page_operation(Box::new(RunnableOperation(move || {
                    listener(split_key.clone())
                })));
        }
    }

    fn fire_leaf_page_remove(&self, descent: &Descent<V>) {
        let Some(page_key) = leaf_page_key(descent) else {
            return;
        };
        let hosts = descent.leaf.replication_host_ids().unwrap_or_default();
        // Only the first replica initiates the cluster-wide removal.
        if let (Some(local), Some(first)) = (self.local_host.as_ref(), hosts.first()) {
            if local != first {
                return;
            }
        }
        if let Some(listener) = self.remove_listener.read().clone() {
            self.pool
                .add_page_operation(Box::new(RunnableOperation(move || {
                    listener(page_key.clone(), hosts.clone())
                })));
        }
    }

    // ── Whole-tree operations ───────────────────────────────────────────

    /// Drop all entries, keeping the root's replica-host list.
    pub fn clear(&self) -> KestrelResult<()> {
        self.check_write()?;
        let _w = self.latch.write();
        let hosts = self.root.page().replication_host_ids();
        let fresh = Page::empty_leaf();
        fresh.set_replication_host_ids(hosts);
        self.root.replace(fresh);
        self.size.store(0, Ordering::Release);
        self.max_key.store(0, Ordering::Release);
        Ok(())
    }

    /// Publish dirty pages as a new chunk.
    pub fn save(&self) -> KestrelResult<()> {
        let _r = self.latch.read();
        self.store
            .save(
                &self.root.page(),
                self.size(),
                self.max_key.load(Ordering::Acquire),
                false,
            )
            .map_err(KestrelError::Storage)
    }

    /// Write a chunk even when clean; seals replica metadata.
    pub fn force_save(&self) -> KestrelResult<()> {
        let _r = self.latch.read();
        self.store
            .save(
                &self.root.page(),
                self.size(),
                self.max_key.load(Ordering::Acquire),
                true,
            )
            .map_err(KestrelError::Storage)
    }

    pub fn close(&self) {
        let _w = self.latch.write();
        self.closed.store(true, Ordering::Release);
        self.store.close();
    }

    /// Delete the map's persisted chunks and close it.
    pub fn destroy(&self) -> KestrelResult<()> {
        let _w = self.latch.write();
        self.closed.store(true, Ordering::Release);
        self.store.remove().map_err(KestrelError::Storage)
    }

    pub fn read_page(&self, pos: u64) -> KestrelResult<Arc<Page<V>>> {
        self.store.read_page(pos).map_err(KestrelError::Storage)
    }

    pub fn disk_space_used(&self) -> u64 {
        self.store.disk_space_used()
    }

    // ── Sharding support ────────────────────────────────────────────────

    /// Replica hosts owning the leaf for `key`.
    pub fn replication_hosts_for(&self, key: &Datum) -> Option<Vec<HostId>> {
        self.root.page().goto_leaf(key).replication_host_ids()
    }

    /// Replica hosts owning the rightmost leaf (append routing).
    pub fn last_leaf_hosts(&self) -> Option<Vec<HostId>> {
        let mut p = self.root.page();
        loop {
            match p.content() {
                PageContent::Node { children, .. } => {
                    p = children[children.len() - 1].page();
                }
                _ => return p.replication_host_ids(),
            }
        }
    }

    /// Replica-side half of the move negotiation: keep the plan with the
    /// largest round index and report what is accepted.
    pub fn prepare_move_leaf_page(
        &self,
        plan: &LeafPageMovePlan,
    ) -> Option<LeafPageMovePlan> {
        let leaf = self.root.page().goto_leaf_for(&plan.page_key);
        if leaf.is_leaf() {
            Some(leaf.accept_move_plan(plan))
        } else {
            None
        }
    }

    /// Install the accepted plan on the live leaf (re-resolved by key, as
    /// the page may have taken new writes since the proposal).
    pub fn set_leaf_page_move_plan(&self, page_key: &PageKey, plan: LeafPageMovePlan) -> Option<Arc<Page<V>>> {
        let leaf = self.root.page().goto_leaf_for(page_key);
        if leaf.is_leaf() {
            leaf.set_move_plan(Some(plan));
            Some(leaf)
        } else {
            None
        }
    }

    /// Serialise the leaf owning `page_key` for shipping. `metadata_only`
    /// produces a remote (host-list) image instead of the data image.
    pub fn serialize_leaf(&self, page_key: &PageKey, metadata_only: bool) -> KestrelResult<Vec<u8>> {
        let leaf = self.root.page().goto_leaf_for(page_key);
        self.serialize_page(&leaf, metadata_only)
    }

    pub fn serialize_page(&self, page: &Arc<Page<V>>, metadata_only: bool) -> KestrelResult<Vec<u8>> {
        let hosts = page.replication_host_ids();
        let image = if metadata_only || page.is_remote() {
            PageImage::Remote {
                hosts: hosts.unwrap_or_default(),
            }
        } else {
            let (keys, values) = Self::leaf_entries(page);
            let mut encoded = Vec::with_capacity(values.len());
            for v in &values {
                let mut buf = Vec::new();
                self.value_type.encode(v, &mut buf);
                encoded.push(buf);
            }
            PageImage::Leaf {
                hosts,
                body: LeafBody::build(self.config.page_storage_mode, keys, encoded),
            }
        };
        bincode::serialize(&image)
            .map_err(|e| KestrelError::Storage(StorageError::Serialization(e.to_string())))
    }

    pub fn deserialize_leaf(&self, bytes: &[u8]) -> KestrelResult<Arc<Page<V>>> {
        let image: PageImage = bincode::deserialize(bytes)
            .map_err(|e| KestrelError::Storage(StorageError::Serialization(e.to_string())))?;
        match image {
            PageImage::Leaf { hosts, body } => {
                let (keys, encoded) = body.into_pairs();
                let mut values = Vec::with_capacity(encoded.len());
                for bytes in &encoded {
                    values.push(
                        self.value_type
                            .decode(bytes)
                            .map_err(|e| KestrelError::Storage(StorageError::Serialization(e)))?,
                    );
                }
                let page = Page::leaf(keys, values);
                page.set_replication_host_ids(hosts);
                Ok(page)
            }
            PageImage::Remote { hosts } => Ok(Page::remote(hosts)),
            PageImage::Node { .. } => Err(KestrelError::Storage(StorageError::Serialization(
                "expected leaf image, found node".into(),
            ))),
        }
    }

    /// Splice a received leaf (or remote placeholder) into the local tree.
    /// `page_key = None` replaces the root. With `add_page`, the image is
    /// a split-off right half and the existing child stays as the left.
    pub fn add_leaf_page(
        &self,
        page_key: Option<&PageKey>,
        page: Arc<Page<V>>,
        add_page: bool,
    ) -> KestrelResult<()> {
        self.check_write()?;
        let _w = self.latch.write();
        let Some(pk) = page_key else {
            self.root.replace(page);
            return Ok(());
        };
        let root = self.root.page();
        if !root.is_node() {
            // Grow a leaf/remote root into a two-child node.
            let empty: Arc<Page<V>> = if root.is_leaf() {
                Page::empty_leaf()
            } else {
                Page::remote(root.replication_host_ids().unwrap_or_default())
            };
            empty.set_replication_host_ids(root.replication_host_ids());
            let (left, right) = if pk.first {
                (page, empty)
            } else {
                (empty, page)
            };
            let node = Page::node(
                vec![pk.key.clone()],
                vec![PageRef::new(left), PageRef::new(right)],
            );
            self.root.replace(node);
            return Ok(());
        }
        let descent = self.descend(&pk.key);
        let Some((node, node_slot, child_idx)) = descent.path.last() else {
            return Ok(());
        };
        let mut nkeys = node.node_keys().to_vec();
        let mut nchildren = node.node_children().to_vec();
        if add_page {
            // Existing child keeps the left half; the image is the right.
            nkeys.insert(*child_idx, pk.key.clone());
            nchildren.insert(child_idx + 1, PageRef::new(page));
            node_slot.replace(Page::node_from(node, nkeys, nchildren));
        } else {
            nchildren[*child_idx].replace(page);
        }
        Ok(())
    }

    /// Drop the local copy of a leaf; collapses a single-child parent.
    pub fn remove_leaf_page(&self, page_key: Option<&PageKey>) -> KestrelResult<()> {
        self.check_write()?;
        let _w = self.latch.write();
        let Some(pk) = page_key else {
            // Removing the root leaf leaves a fresh empty one.
            self.root.replace(Page::empty_leaf());
            return Ok(());
        };
        let root = self.root.page();
        if !root.is_node() {
            self.root.replace(Page::empty_leaf());
            return Ok(());
        }
        let descent = self.descend(&pk.key);
        let Some((node, node_slot, child_idx)) = descent.path.last() else {
            return Ok(());
        };
        let mut idx = *child_idx;
        if pk.first {
            idx = 0;
        }
        let mut nkeys = node.node_keys().to_vec();
        let mut nchildren = node.node_children().to_vec();
        if nchildren.len() <= 1 {
            return Ok(());
        }
        nchildren.remove(idx);
        if idx == 0 {
            nkeys.remove(0);
        } else {
            nkeys.remove(idx - 1);
        }
        if nkeys.is_empty() {
            // Single child left: collapse the node into it.
            let survivor = nchildren[0].page();
            node_slot.replace(survivor);
        } else {
            node_slot.replace(Page::node_from(node, nkeys, nchildren));
        }
        Ok(())
    }

    /// Enumerate the leaf pages covering `[from, to]`, grouped by their
    /// replica-host set. Does not read remote pages.
    pub fn node_to_page_key_map(
        &self,
        from: Option<&Datum>,
        to: Option<&Datum>,
    ) -> Vec<(Vec<HostId>, Vec<PageKey>)> {
        let root = self.root.page();
        let mut groups: Vec<(Vec<HostId>, Vec<PageKey>)> = Vec::new();
        if !root.is_node() {
            let key = root.leaf_keys().first().cloned().unwrap_or(Datum::Null);
            push_group(
                &mut groups,
                root.replication_host_ids().unwrap_or_default(),
                PageKey::with_pos(key, true, root.pos()),
            );
            return groups;
        }
        collect_page_keys(&root, from, to, &mut groups);
        groups
    }
}

// ── Free helpers ────────────────────────────────────────────────────────

fn first_last<V: Value>(p: &Arc<Page<V>>, first: bool) -> Option<Datum> {
    match p.content() {
        PageContent::Leaf { keys, .. } => {
            if first {
                keys.first().cloned()
            } else {
                keys.last().cloned()
            }
        }
        PageContent::Node { children, .. } => {
            // Walk children in order, skipping empty subtrees.
            let indices: Vec<usize> = if first {
                (0..children.len()).collect()
            } else {
                (0..children.len()).rev().collect()
            };
            for i in indices {
                if let Some(k) = first_last(&children[i].page(), first) {
                    return Some(k);
                }
            }
            None
        }
        PageContent::Remote => None,
    }
}

/// Neighbour-key walk: smallest/largest key relative to the bound,
/// descending by page index and probing sibling subtrees when a child
/// comes up empty.
pub(crate) fn min_max<V: Value>(
    p: &Arc<Page<V>>,
    key: &Datum,
    min: bool,
    excluding: bool,
) -> Option<Datum> {
    match p.content() {
        PageContent::Leaf { keys, .. } => {
            let x: isize = match p.binary_search(key) {
                Ok(i) => {
                    if excluding {
                        i as isize + if min { -1 } else { 1 }
                    } else {
                        i as isize
                    }
                }
                Err(ins) => ins as isize - if min { 1 } else { 0 },
            };
            if x < 0 || x as usize >= keys.len() {
                return None;
            }
            Some(keys[x as usize].clone())
        }
        PageContent::Node { children, .. } => {
            let mut x = p.page_index(key) as isize;
            loop {
                if x < 0 || x as usize >= children.len() {
                    return None;
                }
                if let Some(k) = min_max(&children[x as usize].page(), key, min, excluding) {
                    return Some(k);
                }
                x += if min { -1 } else { 1 };
            }
        }
        PageContent::Remote => None,
    }
}

fn leaf_page_key<V: Value>(descent: &Descent<V>) -> Option<PageKey> {
    let (node, _, idx) = descent.path.last()?;
    let keys = node.node_keys();
    let key = if *idx == 0 {
        keys.first()?.clone()
    } else {
        keys[idx - 1].clone()
    };
    Some(PageKey::with_pos(key, *idx == 0, descent.leaf.pos()))
}

fn push_group(
    groups: &mut Vec<(Vec<HostId>, Vec<PageKey>)>,
    hosts: Vec<HostId>,
    pk: PageKey,
) {
    let mut sorted = hosts.clone();
    sorted.sort();
    for (group_hosts, keys) in groups.iter_mut() {
        let mut existing = group_hosts.clone();
        existing.sort();
        if existing == sorted {
            keys.push(pk);
            return;
        }
    }
    groups.push((hosts, vec![pk]));
}

fn collect_page_keys<V: Value>(
    node: &Arc<Page<V>>,
    from: Option<&Datum>,
    to: Option<&Datum>,
    groups: &mut Vec<(Vec<HostId>, Vec<PageKey>)>,
) {
    let keys = node.node_keys();
    let children = node.node_children();
    for idx in 0..children.len() {
        // Child idx covers [keys[idx-1], keys[idx]).
        if let Some(f) = from {
            if idx < keys.len() && &keys[idx] <= f {
                continue;
            }
        }
        if let Some(t) = to {
            if idx > 0 && &keys[idx - 1] > t {
                break;
            }
        }
        let child = children[idx].page();
        if child.is_node() {
            collect_page_keys(&child, from, to, groups);
        } else {
            let key = if idx == 0 {
                keys.first().cloned().unwrap_or(Datum::Null)
            } else {
                keys[idx - 1].clone()
            };
            push_group(
                groups,
                child.replication_host_ids().unwrap_or_default(),
                PageKey::with_pos(key, idx == 0, child.pos()),
            );
        }
    }
}

fn expect_old<V: std::fmt::Debug>(outcome: WriteOutcome<V>) -> KestrelResult<Option<V>> {
    match outcome {
        WriteOutcome::Old(old) => Ok(old),
        other => Err(unexpected(&other)),
    }
}

fn unexpected<V: std::fmt::Debug>(outcome: &WriteOutcome<V>) -> KestrelError {
    match outcome {
        WriteOutcome::RemoteLeaf(hosts) => KestrelError::Internal(format!(
            "key is owned by a remote leaf (replicas: {hosts:?})"
        )),
        WriteOutcome::Locked => {
            KestrelError::Internal("unexpected row-lock outcome for a raw map write".into())
        }
        other => KestrelError::Internal(format!("unexpected write outcome: {other:?}")),
    }
}

fn take_outcome<V>(
    result: Option<AsyncResult<WriteOutcome<V>>>,
) -> KestrelResult<WriteOutcome<V>> {
    match result {
        Some(r) => match r.into_result()? {
            Some(outcome) => Ok(outcome),
            None => Err(KestrelError::Internal("operation delivered no outcome".into())),
        },
        None => Err(KestrelError::Internal(
            "operation finished without delivering a result".into(),
        )),
    }
}

fn adapt_old<V: Value>(handler: AsyncHandler<Option<V>>) -> AsyncHandler<WriteOutcome<V>> {
    Box::new(move |result: AsyncResult<WriteOutcome<V>>| {
        handler(match result.into_result() {
            Ok(Some(WriteOutcome::Old(old))) => AsyncResult::succeeded(old),
            Ok(_) => AsyncResult::empty(),
            Err(e) => AsyncResult::failed(e),
        })
    })
}
