//! Chunk file format.
//!
//! A chunk is an append-only file of framed records: a fixed header, a
//! sequence of page images, and a trailer naming the root position and map
//! size. Frames are `[len:4][crc32:4][bincode payload]`; a frame whose
//! checksum fails marks the end of the usable file. The last chunk whose
//! trailer validates defines the map state at open time.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use kestrel_common::config::PageStorageMode;
use kestrel_common::datum::Datum;
use kestrel_common::error::StorageError;
use kestrel_common::types::HostId;

/// Magic bytes at the start of every chunk file.
pub const CHUNK_MAGIC: &[u8; 4] = b"KSTL";

/// Chunk format version for compatibility checks.
pub const CHUNK_FORMAT_VERSION: u32 = 1;

/// Size of the chunk header: magic (4) + format version (4).
pub const CHUNK_HEADER_SIZE: usize = 8;

/// Leaf body layout. Row storage interleaves (key, value) pairs; column
/// storage writes the key block then the value block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LeafBody {
    Rows(Vec<(Datum, Vec<u8>)>),
    Columns(Vec<Datum>, Vec<Vec<u8>>),
}

impl LeafBody {
    pub fn build(mode: PageStorageMode, keys: Vec<Datum>, values: Vec<Vec<u8>>) -> Self {
        match mode {
            PageStorageMode::RowStorage => {
                LeafBody::Rows(keys.into_iter().zip(values).collect())
            }
            PageStorageMode::ColumnStorage => LeafBody::Columns(keys, values),
        }
    }

    pub fn into_pairs(self) -> (Vec<Datum>, Vec<Vec<u8>>) {
        match self {
            LeafBody::Rows(rows) => rows.into_iter().unzip(),
            LeafBody::Columns(keys, values) => (keys, values),
        }
    }
}

/// Self-describing persisted page image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PageImage {
    Leaf {
        hosts: Option<Vec<HostId>>,
        body: LeafBody,
    },
    Node {
        hosts: Option<Vec<HostId>>,
        keys: Vec<Datum>,
        /// Child positions, parallel to `keys.len() + 1` slots.
        children: Vec<u64>,
    },
    Remote {
        hosts: Vec<HostId>,
    },
}

/// Trailer sealing a chunk. The replica list seals the root's replica
/// metadata so `force_save` can persist it without dirty pages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkTrailer {
    pub chunk_id: u64,
    pub root_pos: u64,
    pub map_size: u64,
    pub max_key: i64,
    pub replication_host_ids: Option<Vec<HostId>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChunkRecord {
    Page(PageImage),
    Trailer(ChunkTrailer),
}

pub fn chunk_filename(chunk_id: u64) -> String {
    format!("kestrel_{:06}.chunk", chunk_id)
}

pub fn parse_chunk_id(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("kestrel_")?.strip_suffix(".chunk")?;
    rest.parse().ok()
}

/// Pack (chunk_id, offset) into a page position. Position 0 is reserved
/// for in-memory pages, which the header size guarantees.
pub fn pack_pos(chunk_id: u64, offset: u32) -> u64 {
    (chunk_id << 32) | offset as u64
}

pub fn unpack_pos(pos: u64) -> (u64, u32) {
    (pos >> 32, pos as u32)
}

/// Builds a chunk in memory, then publishes it atomically via rename.
pub struct ChunkWriter {
    chunk_id: u64,
    buf: Vec<u8>,
}

impl ChunkWriter {
    pub fn new(chunk_id: u64) -> Self {
        let mut buf = Vec::with_capacity(4096);
        buf.extend_from_slice(CHUNK_MAGIC);
        buf.extend_from_slice(&CHUNK_FORMAT_VERSION.to_le_bytes());
        Self { chunk_id, buf }
    }

    pub fn chunk_id(&self) -> u64 {
        self.chunk_id
    }

    /// Append a record, returning its packed position.
    pub fn append(&mut self, record: &ChunkRecord) -> Result<u64, StorageError> {
        let offset = self.buf.len() as u32;
        let data =
            bincode::serialize(record).map_err(|e| StorageError::Serialization(e.to_string()))?;
        let checksum = crc32fast::hash(&data);
        self.buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&checksum.to_le_bytes());
        self.buf.extend_from_slice(&data);
        Ok(pack_pos(self.chunk_id, offset))
    }

    /// Write the finished chunk to `dir`. Atomic: a temp file is renamed
    /// into place, so a crash leaves either the whole chunk or none of it.
    pub fn publish(self, dir: &Path) -> Result<PathBuf, StorageError> {
        let path = dir.join(chunk_filename(self.chunk_id));
        let tmp = dir.join(format!("{}.tmp", chunk_filename(self.chunk_id)));
        fs::write(&tmp, &self.buf)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

/// A chunk file loaded for reading.
pub struct ChunkReader {
    chunk_id: u64,
    data: Vec<u8>,
}

impl ChunkReader {
    pub fn open(dir: &Path, chunk_id: u64) -> Result<Self, StorageError> {
        let data = fs::read(dir.join(chunk_filename(chunk_id)))?;
        if data.len() < CHUNK_HEADER_SIZE || &data[0..4] != CHUNK_MAGIC.as_slice() {
            return Err(StorageError::CorruptChunk {
                chunk_id,
                reason: "missing chunk header".into(),
            });
        }
        Ok(Self { chunk_id, data })
    }

    pub fn chunk_id(&self) -> u64 {
        self.chunk_id
    }

    /// Read the record framed at `offset`.
    pub fn record_at(&self, offset: u32) -> Result<ChunkRecord, StorageError> {
        let pos = offset as usize;
        if pos + 8 > self.data.len() {
            return Err(StorageError::CorruptChunk {
                chunk_id: self.chunk_id,
                reason: format!("record offset {pos} beyond chunk end"),
            });
        }
        let len = u32::from_le_bytes(self.data[pos..pos + 4].try_into().unwrap()) as usize;
        let checksum = u32::from_le_bytes(self.data[pos + 4..pos + 8].try_into().unwrap());
        let start = pos + 8;
        if start + len > self.data.len() {
            return Err(StorageError::CorruptChunk {
                chunk_id: self.chunk_id,
                reason: format!("record at {pos} truncated"),
            });
        }
        let payload = &self.data[start..start + len];
        if crc32fast::hash(payload) != checksum {
            return Err(StorageError::CorruptChunk {
                chunk_id: self.chunk_id,
                reason: format!("checksum mismatch at {pos}"),
            });
        }
        bincode::deserialize(payload).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Scan forward and return the last valid trailer, ignoring a torn
    /// tail. `None` means the chunk never committed.
    pub fn last_trailer(&self) -> Option<ChunkTrailer> {
        let mut pos = CHUNK_HEADER_SIZE;
        let mut trailer = None;
        while pos + 8 <= self.data.len() {
            let len =
                u32::from_le_bytes(self.data[pos..pos + 4].try_into().unwrap()) as usize;
            match self.record_at(pos as u32) {
                Ok(ChunkRecord::Trailer(t)) => trailer = Some(t),
                Ok(ChunkRecord::Page(_)) => {}
                Err(_) => {
                    tracing::warn!(
                        chunk_id = self.chunk_id,
                        offset = pos,
                        "discarding torn tail of chunk"
                    );
                    break;
                }
            }
            pos += 8 + len;
        }
        trailer
    }
}
