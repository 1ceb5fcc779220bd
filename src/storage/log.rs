//! Log entry

use crate::common::{Blake3Hasher, Error, Hash, Result};
use serde::{Deserialize, Serialize};

/// One ordered write record
///
/// `hash` covers index, term and data and is fixed at creation. It identifies
/// the entry; it does not chain to the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Log {
    pub index: u64,
    pub term: u64,
    pub data: Vec<u8>,
    pub hash: Hash,
}

impl Log {
    pub fn new(index: u64, term: u64, data: Vec<u8>) -> Self {
        let mut log = Self {
            index,
            term,
            data,
            hash: Hash::default(),
        };
        log.compute_hash();
        log
    }

    fn content_hash(&self) -> Hash {
        let mut hasher = Blake3Hasher::new();
        hasher
            .update_u64(self.index)
            .update_u64(self.term)
            .update_framed(&self.data);
        hasher.finalize()
    }

    pub fn compute_hash(&mut self) {
        self.hash = self.content_hash();
    }

    pub fn verify_hash(&self) -> Result<()> {
        let actual = self.content_hash();
        if actual != self.hash {
            return Err(Error::Corrupted(format!(
                "log {} hash mismatch: expected {}, got {}",
                self.index, self.hash, actual
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_covers_all_fields() {
        let log = Log::new(1, 1, b"test data".to_vec());
        log.verify_hash().unwrap();

        assert_ne!(log.hash, Log::new(2, 1, b"test data".to_vec()).hash);
        assert_ne!(log.hash, Log::new(1, 2, b"test data".to_vec()).hash);
        assert_ne!(log.hash, Log::new(1, 1, b"test datb".to_vec()).hash);
    }

    #[test]
    fn test_tampered_entry_fails_verification() {
        let mut log = Log::new(3, 1, b"payload".to_vec());
        log.data.push(b'!');
        assert!(matches!(log.verify_hash(), Err(Error::Corrupted(_))));
        log.compute_hash();
        assert!(log.verify_hash().is_ok());
    }
}
