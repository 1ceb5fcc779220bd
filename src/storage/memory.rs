//! In-memory log and stable store
//!
//! Same contract as `DiskStore`, nothing survives a drop. Used by tests and
//! by nodes that do not need durability.

use super::{check_append, Log, LogStore, StableStore};
use crate::common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct MemStore {
    logs: Mutex<BTreeMap<u64, Log>>,
    stable: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn logs(&self) -> MutexGuard<'_, BTreeMap<u64, Log>> {
        self.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stable(&self) -> MutexGuard<'_, HashMap<Vec<u8>, Vec<u8>>> {
        self.stable.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StableStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.stable()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(String::from_utf8_lossy(key).into_owned()))
    }

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()> {
        self.stable().insert(key.to_vec(), val.to_vec());
        Ok(())
    }
}

impl LogStore for MemStore {
    fn first_index(&self) -> Result<u64> {
        Ok(self.logs().keys().next().copied().unwrap_or(0))
    }

    fn last_index(&self) -> Result<u64> {
        Ok(self.logs().keys().next_back().copied().unwrap_or(0))
    }

    fn get_log(&self, index: u64) -> Result<Log> {
        self.logs()
            .get(&index)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("log {}", index)))
    }

    fn append(&self, log: &Log) -> Result<()> {
        let mut logs = self.logs();
        let last = logs.keys().next_back().copied().unwrap_or(0);
        check_append(last, log)?;
        logs.insert(log.index, log.clone());
        Ok(())
    }

    fn delete_range(&self, min: u64, max: u64) -> Result<()> {
        if min > max {
            return Ok(());
        }
        self.logs().retain(|index, _| *index < min || *index > max);
        Ok(())
    }
}
