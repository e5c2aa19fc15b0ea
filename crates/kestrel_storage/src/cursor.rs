//! Lazy forward cursors.
//!
//! A cursor captures the root at creation and buffers one leaf at a time;
//! stepping to the next leaf is a fresh descent for the smallest key above
//! the last one returned. Pages already visited stay stable (they are
//! immutable), while unvisited leaves reflect slot swaps that landed after
//! the cursor was created — the weak-snapshot contract.

use std::collections::VecDeque;
use std::sync::Arc;

use kestrel_common::datum::Datum;

use crate::map::min_max;
use crate::page::{Page, PageContent, PageKey, Value};

pub struct MapCursor<V: Value> {
    root: Arc<Page<V>>,
    to: Option<Datum>,
    from: Option<Datum>,
    /// Entries buffered from the current leaf.
    buffer: VecDeque<(Datum, V)>,
    last_key: Option<Datum>,
    /// When set, iterate exactly these leaf pages in order instead of the
    /// whole tree (sharded range scans).
    page_keys: Option<VecDeque<PageKey>>,
    exhausted: bool,
}

impl<V: Value> MapCursor<V> {
    pub(crate) fn new(root: Arc<Page<V>>, from: Option<Datum>, to: Option<Datum>) -> Self {
        Self {
            root,
            to,
            from,
            buffer: VecDeque::new(),
            last_key: None,
            page_keys: None,
            exhausted: false,
        }
    }

    pub(crate) fn over_pages(
        root: Arc<Page<V>>,
        page_keys: Vec<PageKey>,
        from: Option<Datum>,
        to: Option<Datum>,
    ) -> Self {
        Self {
            root,
            to,
            from,
            buffer: VecDeque::new(),
            last_key: None,
            page_keys: Some(page_keys.into()),
            exhausted: false,
        }
    }

    fn in_range(&self, key: &Datum) -> bool {
        if let Some(f) = &self.from {
            if key < f {
                return false;
            }
        }
        if let Some(t) = &self.to {
            if key > t {
                return false;
            }
        }
        true
    }

    fn buffer_leaf(&mut self, leaf: &Arc<Page<V>>, above: Option<&Datum>) {
        if let PageContent::Leaf { keys, values } = leaf.content() {
            for (k, v) in keys.iter().zip(values.iter()) {
                if let Some(min) = above {
                    if k <= min {
                        continue;
                    }
                }
                if self.in_range(k) {
                    self.buffer.push_back((k.clone(), v.clone()));
                }
            }
        }
    }

    /// Load the next leaf's qualifying entries. Returns false at the end.
    fn fill(&mut self) -> bool {
        if self.exhausted {
            return false;
        }
        if self.page_keys.is_some() {
            // Enumerated-page mode: walk the listed leaves in given order.
            loop {
                let next = self
                    .page_keys
                    .as_mut()
                    .and_then(|page_keys| page_keys.pop_front());
                let Some(pk) = next else {
                    self.exhausted = true;
                    return false;
                };
                let leaf = self.root.goto_leaf_for(&pk);
                if !leaf.is_leaf() {
                    continue;
                }
                let above = self.last_key.clone();
                self.buffer_leaf(&leaf, above.as_ref());
                if !self.buffer.is_empty() {
                    return true;
                }
            }
        }
        loop {
            // Smallest key strictly above the last one returned (or the
            // lower bound on the first fill).
            let next_key = match &self.last_key {
                Some(k) => min_max(&self.root, k, false, true),
                None => match &self.from {
                    Some(f) => min_max(&self.root, f, false, false),
                    None => first_key(&self.root),
                },
            };
            let Some(next_key) = next_key else {
                self.exhausted = true;
                return false;
            };
            if let Some(t) = &self.to {
                if &next_key > t {
                    self.exhausted = true;
                    return false;
                }
            }
            let leaf = self.root.goto_leaf(&next_key);
            let above = self.last_key.clone();
            self.buffer_leaf(&leaf, above.as_ref());
            if self.buffer.is_empty() {
                // The leaf turned over between probe and read; advance past
                // the probed key so the walk still terminates.
                self.last_key = Some(next_key);
                continue;
            }
            return true;
        }
    }
}

fn first_key<V: Value>(p: &Arc<Page<V>>) -> Option<Datum> {
    match p.content() {
        PageContent::Leaf { keys, .. } => keys.first().cloned(),
        PageContent::Node { children, .. } => {
            for child in children {
                if let Some(k) = first_key(&child.page()) {
                    return Some(k);
                }
            }
            None
        }
        PageContent::Remote => None,
    }
}

impl<V: Value> Iterator for MapCursor<V> {
    type Item = (Datum, V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((k, v)) = self.buffer.pop_front() {
                if let Some(t) = &self.to {
                    if &k > t {
                        self.exhausted = true;
                        self.buffer.clear();
                        return None;
                    }
                }
                self.last_key = Some(k.clone());
                return Some((k, v));
            }
            if !self.fill() {
                return None;
            }
        }
    }
}
