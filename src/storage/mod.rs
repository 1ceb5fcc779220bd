//! Durable log and stable store contracts
//!
//! The runtime owns exactly one store per node, opened under its root dir.
//! - `LogStore`: append-only, gap-free sequence of `Log` entries
//! - `StableStore`: small control values (last committed index, accepted config)

pub mod disk;
pub mod log;
pub mod memory;

use crate::common::{Error, Result};

pub use disk::DiskStore;
pub use log::Log;
pub use memory::MemStore;

/// Last index committed by this node
pub const KEY_LAST_COMMITTED: &[u8] = b"kayak/last_committed";
/// Term of the accepted peer set
pub const KEY_PEERS_TERM: &[u8] = b"kayak/peers_term";
/// Digest of the accepted peer set
pub const KEY_PEERS_DIGEST: &[u8] = b"kayak/peers_digest";

/// Key/value persistence for small control data
pub trait StableStore: Send + Sync {
    /// Missing keys fail with `Error::NotFound`
    fn get(&self, key: &[u8]) -> Result<Vec<u8>>;

    fn set(&self, key: &[u8], val: &[u8]) -> Result<()>;

    fn get_u64(&self, key: &[u8]) -> Result<u64> {
        let bytes = self.get(key)?;
        let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            Error::Corrupted(format!(
                "{} is not a u64 ({} bytes)",
                String::from_utf8_lossy(key),
                bytes.len()
            ))
        })?;
        Ok(u64::from_be_bytes(arr))
    }

    fn set_u64(&self, key: &[u8], val: u64) -> Result<()> {
        self.set(key, &val.to_be_bytes())
    }
}

/// Append-only log
pub trait LogStore: Send + Sync {
    /// Lowest stored index, 0 when empty
    fn first_index(&self) -> Result<u64>;

    /// Highest stored index, 0 when empty
    fn last_index(&self) -> Result<u64>;

    fn get_log(&self, index: u64) -> Result<Log>;

    /// Fails with `NonMonotonicIndex` unless `log.index == last_index() + 1`
    fn append(&self, log: &Log) -> Result<()>;

    /// Remove entries in `min..=max`
    fn delete_range(&self, min: u64, max: u64) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Read a u64 control value, treating a missing key as `default`.
pub fn get_u64_or(store: &dyn StableStore, key: &[u8], default: u64) -> Result<u64> {
    match store.get_u64(key) {
        Ok(v) => Ok(v),
        Err(e) if e.is_not_found() => Ok(default),
        Err(e) => Err(e),
    }
}

fn check_append(last: u64, log: &Log) -> Result<()> {
    let expected = last + 1;
    if log.index != expected {
        return Err(Error::NonMonotonicIndex {
            expected,
            got: log.index,
        });
    }
    Ok(())
}
