//! On-disk log and stable store using sled
//!
//! Stores, in two trees of one database:
//! - Log entries keyed by big-endian index (so iteration order is index order)
//! - Stable control values keyed by raw bytes

use super::{check_append, Log, LogStore, StableStore};
use crate::common::{Error, Result};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

const TREE_LOGS: &str = "logs";
const TREE_STABLE: &str = "stable";

pub struct DiskStore {
    db: sled::Db,
    logs: sled::Tree,
    stable: sled::Tree,
    /// Serializes the last-index check with the insert
    append_lock: Mutex<()>,
}

fn decode_index(key: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Corrupted(format!("bad log key length {}", key.len())))?;
    Ok(u64::from_be_bytes(arr))
}

fn decode_log(bytes: &[u8]) -> Result<Log> {
    bincode::deserialize(bytes).map_err(|e| Error::Corrupted(e.to_string()))
}

impl DiskStore {
    /// Open or create the store. No background flusher: writes flush themselves.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::Config::new()
            .path(path.as_ref())
            .flush_every_ms(None)
            .open()?;
        let logs = db.open_tree(TREE_LOGS)?;
        let stable = db.open_tree(TREE_STABLE)?;

        Ok(Self {
            db,
            logs,
            stable,
            append_lock: Mutex::new(()),
        })
    }

    /// Flush to disk
    pub fn sync(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl StableStore for DiskStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        match self.stable.get(key)? {
            Some(value) => Ok(value.to_vec()),
            None => Err(Error::NotFound(String::from_utf8_lossy(key).into_owned())),
        }
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.stable.insert(key, val)?;
        self.stable.flush()?;
        Ok(())
    }
}

impl LogStore for DiskStore {
    fn first_index(&self) -> Result<u64> {
        match self.logs.first()? {
            Some((key, _)) => decode_index(&key),
            None => Ok(0),
        }
    }

    fn last_index(&self) -> Result<u64> {
        match self.logs.last()? {
            Some((key, _)) => decode_index(&key),
            None => Ok(0),
        }
    }

    fn get_log(&self, index: u64) -> Result<Log> {
        match self.logs.get(index.to_be_bytes())? {
            Some(bytes) => decode_log(&bytes),
            None => Err(Error::NotFound(format!("log {}", index))),
        }
    }

    fn append(&self, log: &Log) -> Result<()> {
        let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);
        check_append(self.last_index()?, log)?;

        let value = bincode::serialize(log)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.logs.insert(log.index.to_be_bytes(), value)?;
        self.logs.flush()?;
        Ok(())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        if min > max {
            return Ok(());
        }
        let _guard = self.append_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut batch = sled::Batch::default();
        for item in self.logs.range(min.to_be_bytes()..=max.to_be_bytes()) {
            let (key, _) = item?;
            batch.remove(key);
        }
        self.logs.apply_batch(batch)?;
        self.logs.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.sync()
    }
}
