//! Append-only redo log: the durability point of commit.
//!
//! A committing transaction's redo buffer is framed, checksummed and
//! fsynced before the commit is acknowledged. Recovery tolerates a torn
//! tail by stopping at the first bad frame.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use kestrel_common::error::StorageError;
use kestrel_common::types::TxnId;

const REDO_FILENAME: &str = "kestrel.redo";

pub struct RedoWriter {
    inner: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl RedoWriter {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(REDO_FILENAME);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            inner: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    /// Frame and persist one transaction's redo buffer:
    /// `[txn_id:8][len:4][crc32:4][buffer]`, synced before returning.
    pub fn append(&self, txn_id: TxnId, buffer: &[u8]) -> Result<(), StorageError> {
        let mut writer = self.inner.lock();
        writer.write_all(&txn_id.0.to_le_bytes())?;
        writer.write_all(&(buffer.len() as u32).to_le_bytes())?;
        writer.write_all(&crc32fast::hash(buffer).to_le_bytes())?;
        writer.write_all(buffer)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// All intact redo buffers in append order.
    pub fn read_all(path_dir: &Path) -> Result<Vec<(TxnId, Vec<u8>)>, StorageError> {
        let path = path_dir.join(REDO_FILENAME);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = fs::read(&path)?;
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos + 16 <= data.len() {
            let txn_id = u64::from_le_bytes(data[pos..pos + 8].try_into().unwrap());
            let len = u32::from_le_bytes(data[pos + 8..pos + 12].try_into().unwrap()) as usize;
            let checksum = u32::from_le_bytes(data[pos + 12..pos + 16].try_into().unwrap());
            pos += 16;
            if pos + len > data.len() {
                tracing::warn!("redo log truncated at {pos}, stopping recovery");
                break;
            }
            let buffer = &data[pos..pos + len];
            if crc32fast::hash(buffer) != checksum {
                tracing::warn!("redo checksum mismatch at {pos}, stopping recovery");
                break;
            }
            out.push((TxnId(txn_id), buffer.to_vec()));
            pos += len;
        }
        Ok(out)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let writer = RedoWriter::open(dir.path()).unwrap();
        writer.append(TxnId(1), b"first").unwrap();
        writer.append(TxnId(2), b"second").unwrap();

        let all = RedoWriter::read_all(dir.path()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], (TxnId(1), b"first".to_vec()));
        assert_eq!(all[1], (TxnId(2), b"second".to_vec()));
    }

    #[test]
    fn test_torn_tail_stops_recovery() {
        let dir = TempDir::new().unwrap();
        let writer = RedoWriter::open(dir.path()).unwrap();
        writer.append(TxnId(1), b"intact").unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        let mut data = fs::read(&path).unwrap();
        data.extend_from_slice(&[0xAB; 7]);
        fs::write(&path, &data).unwrap();

        let all = RedoWriter::read_all(dir.path()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].1, b"intact".to_vec());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(RedoWriter::read_all(dir.path()).unwrap().is_empty());
    }
}
