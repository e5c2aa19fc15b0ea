//! The per-map page store: persists page images into chunk files and
//! resolves the last committed chunk at open time.
//!
//! `save` is atomic at chunk granularity: a new chunk is built in memory,
//! published with a rename, and only then are the in-memory pages stamped
//! with their positions. A crash mid-save leaves the prior chunk
//! authoritative.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use kestrel_common::config::PageStorageMode;
use kestrel_common::error::StorageError;
use kestrel_common::types::HostId;

use crate::chunk::{
    parse_chunk_id, unpack_pos, ChunkReader, ChunkRecord, ChunkTrailer, ChunkWriter, LeafBody,
    PageImage,
};
use crate::page::{Page, PageRef, Value, ValueType};

/// State recovered from the last committed chunk.
pub struct LoadedState<V: Value> {
    pub root: Arc<Page<V>>,
    pub map_size: u64,
    pub max_key: i64,
    pub replication_host_ids: Option<Vec<HostId>>,
}

pub struct PageStore<V: Value> {
    /// `None` in in-memory mode.
    dir: Option<PathBuf>,
    value_type: Arc<dyn ValueType<V>>,
    mode: PageStorageMode,
    last_chunk_id: AtomicU64,
    closed: AtomicBool,
}

impl<V: Value> PageStore<V> {
    pub fn new(
        dir: Option<PathBuf>,
        value_type: Arc<dyn ValueType<V>>,
        mode: PageStorageMode,
    ) -> Result<Self, StorageError> {
        if let Some(d) = &dir {
            fs::create_dir_all(d)?;
        }
        Ok(Self {
            dir,
            value_type,
            mode,
            last_chunk_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_in_memory(&self) -> bool {
        self.dir.is_none()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Delete all chunk files for this map.
    pub fn remove(&self) -> Result<(), StorageError> {
        if let Some(dir) = &self.dir {
            if dir.exists() {
                fs::remove_dir_all(dir)?;
            }
        }
        self.close();
        Ok(())
    }

    fn chunk_ids_desc(&self) -> Vec<u64> {
        let mut ids = Vec::new();
        if let Some(dir) = &self.dir {
            if let Ok(entries) = fs::read_dir(dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    if let Some(id) = parse_chunk_id(&name.to_string_lossy()) {
                        ids.push(id);
                    }
                }
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        ids
    }

    /// Resolve the last committed chunk and load its tree. Chunks without a
    /// valid trailer (torn saves) are skipped with a warning; the previous
    /// chunk remains authoritative.
    pub fn load_last(&self) -> Result<Option<LoadedState<V>>, StorageError> {
        let ids = self.chunk_ids_desc();
        for chunk_id in ids {
            let reader = match ChunkReader::open(self.dir.as_ref().unwrap(), chunk_id) {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(chunk_id, "skipping unreadable chunk: {e}");
                    continue;
                }
            };
            let Some(trailer) = reader.last_trailer() else {
                tracing::warn!(chunk_id, "skipping uncommitted chunk");
                continue;
            };
            self.last_chunk_id.store(chunk_id, Ordering::Release);
            let mut readers = HashMap::new();
            readers.insert(chunk_id, reader);
            let root = self.read_page_cached(trailer.root_pos, &mut readers)?;
            return Ok(Some(LoadedState {
                root,
                map_size: trailer.map_size,
                max_key: trailer.max_key,
                replication_host_ids: trailer.replication_host_ids,
            }));
        }
        Ok(None)
    }

    /// Read and decode the page at `pos`, loading child pages eagerly.
    pub fn read_page(&self, pos: u64) -> Result<Arc<Page<V>>, StorageError> {
        let mut readers = HashMap::new();
        self.read_page_cached(pos, &mut readers)
    }

    fn read_page_cached(
        &self,
        pos: u64,
        readers: &mut HashMap<u64, ChunkReader>,
    ) -> Result<Arc<Page<V>>, StorageError> {
        if pos == 0 {
            return Err(StorageError::PageNotFound(0));
        }
        let (chunk_id, offset) = unpack_pos(pos);
        if !readers.contains_key(&chunk_id) {
            let reader = ChunkReader::open(self.dir.as_ref().unwrap(), chunk_id)?;
            readers.insert(chunk_id, reader);
        }
        let record = readers[&chunk_id].record_at(offset)?;
        let image = match record {
            ChunkRecord::Page(image) => image,
            ChunkRecord::Trailer(_) => {
                return Err(StorageError::CorruptChunk {
                    chunk_id,
                    reason: format!("expected page at offset {offset}, found trailer"),
                })
            }
        };
        let page = match image {
            PageImage::Leaf { hosts, body } => {
                let (keys, encoded) = body.into_pairs();
                let mut values = Vec::with_capacity(encoded.len());
                for bytes in &encoded {
                    let v = self
                        .value_type
                        .decode(bytes)
                        .map_err(StorageError::Serialization)?;
                    values.push(v);
                }
                let page = Page::leaf(keys, values);
                page.set_replication_host_ids(hosts);
                page
            }
            PageImage::Node {
                hosts,
                keys,
                children,
            } => {
                let mut slots = Vec::with_capacity(children.len());
                for child_pos in children {
                    let child = self.read_page_cached(child_pos, readers)?;
                    slots.push(PageRef::new(child));
                }
                let page = Page::node(keys, slots);
                page.set_replication_host_ids(hosts);
                page
            }
            PageImage::Remote { hosts } => Page::remote(hosts),
        };
        page.set_pos(pos);
        Ok(page)
    }

    /// Publish dirty pages as a new chunk. A no-op when the tree is clean
    /// unless `force` is set (used to seal replica metadata changes).
    pub fn save(
        &self,
        root: &Arc<Page<V>>,
        map_size: u64,
        max_key: i64,
        force: bool,
    ) -> Result<(), StorageError> {
        if self.is_in_memory() || self.is_closed() {
            return Ok(());
        }
        if !force && !subtree_dirty(root) {
            return Ok(());
        }

        let chunk_id = self.last_chunk_id.load(Ordering::Acquire) + 1;
        let mut writer = ChunkWriter::new(chunk_id);
        let mut assigned: Vec<(Arc<Page<V>>, u64)> = Vec::new();
        let (root_pos, _) = self.write_subtree(root, &mut writer, &mut assigned)?;

        writer.append(&ChunkRecord::Trailer(ChunkTrailer {
            chunk_id,
            root_pos,
            map_size,
            max_key,
            replication_host_ids: root.replication_host_ids(),
        }))?;
        writer.publish(self.dir.as_ref().unwrap())?;

        // Chunk is durable; stamp the pages.
        for (page, pos) in assigned {
            page.set_pos(pos);
        }
        self.last_chunk_id.store(chunk_id, Ordering::Release);
        tracing::debug!(chunk_id, root_pos, map_size, "published chunk");
        Ok(())
    }

    /// Write a page (and dirty descendants) into the chunk, bottom-up so
    /// parents can reference child positions. Returns (pos, rewritten).
    fn write_subtree(
        &self,
        page: &Arc<Page<V>>,
        writer: &mut ChunkWriter,
        assigned: &mut Vec<(Arc<Page<V>>, u64)>,
    ) -> Result<(u64, bool), StorageError> {
        use crate::page::PageContent;
        match page.content() {
            PageContent::Leaf { keys, values } => {
                if !page.is_dirty() {
                    return Ok((page.pos(), false));
                }
                let mut encoded = Vec::with_capacity(values.len());
                for v in values {
                    let mut buf = Vec::new();
                    self.value_type.encode(v, &mut buf);
                    encoded.push(buf);
                }
                let image = PageImage::Leaf {
                    hosts: page.replication_host_ids(),
                    body: LeafBody::build(self.mode, keys.clone(), encoded),
                };
                let pos = writer.append(&ChunkRecord::Page(image))?;
                assigned.push((Arc::clone(page), pos));
                Ok((pos, true))
            }
            PageContent::Node { keys, children } => {
                let mut child_pos = Vec::with_capacity(children.len());
                let mut any_rewritten = false;
                for slot in children {
                    let child = slot.page();
                    let (pos, rewritten) = self.write_subtree(&child, writer, assigned)?;
                    child_pos.push(pos);
                    any_rewritten |= rewritten;
                }
                // A node whose child moved must be rewritten even if its own
                // content did not change, so its image points at live pages.
                if !page.is_dirty() && !any_rewritten {
                    return Ok((page.pos(), false));
                }
                let image = PageImage::Node {
                    hosts: page.replication_host_ids(),
                    keys: keys.clone(),
                    children: child_pos,
                };
                let pos = writer.append(&ChunkRecord::Page(image))?;
                assigned.push((Arc::clone(page), pos));
                Ok((pos, true))
            }
            PageContent::Remote => {
                if !page.is_dirty() {
                    return Ok((page.pos(), false));
                }
                let image = PageImage::Remote {
                    hosts: page.replication_host_ids().unwrap_or_default(),
                };
                let pos = writer.append(&ChunkRecord::Page(image))?;
                assigned.push((Arc::clone(page), pos));
                Ok((pos, true))
            }
        }
    }

    /// Bytes on disk across all chunks of this map.
    pub fn disk_space_used(&self) -> u64 {
        let Some(dir) = &self.dir else { return 0 };
        let Ok(entries) = fs::read_dir(dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|e| parse_chunk_id(&e.file_name().to_string_lossy()).is_some())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }
}

fn subtree_dirty<V: Value>(page: &Arc<Page<V>>) -> bool {
    use crate::page::PageContent;
    if page.is_dirty() {
        return true;
    }
    match page.content() {
        PageContent::Node { children, .. } => {
            children.iter().any(|slot| subtree_dirty(&slot.page()))
        }
        _ => false,
    }
}
