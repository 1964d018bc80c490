//! In-memory stores
//!
//! Used by tests and as the index behind the file-backed header store.

use crate::core::{BlockHash, StoredHeader, Transaction};
use crate::storage::store::{BlockBodyStore, HeaderStore, StorageError};
use std::collections::{BTreeMap, HashMap};

/// Header store held entirely in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryHeaderStore {
    by_height: BTreeMap<u64, StoredHeader>,
    by_hash: HashMap<BlockHash, u64>,
}

impl MemoryHeaderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_height.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_height.is_empty()
    }

    /// Check that `header` can be inserted without breaking the
    /// height-primary-key / hash-unique invariant
    pub fn check_insert(&self, header: &StoredHeader) -> Result<(), StorageError> {
        if self.by_height.contains_key(&header.height) {
            return Err(StorageError::Conflict(format!(
                "height {} already stored",
                header.height
            )));
        }
        if self.by_hash.contains_key(&header.hash) {
            return Err(StorageError::Conflict(format!(
                "hash {} already stored",
                header.hash
            )));
        }
        Ok(())
    }
}

impl HeaderStore for MemoryHeaderStore {
    fn put(&mut self, header: &StoredHeader) -> Result<(), StorageError> {
        self.check_insert(header)?;
        self.by_hash.insert(header.hash, header.height);
        self.by_height.insert(header.height, *header);
        Ok(())
    }

    fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, StorageError> {
        Ok(self
            .by_hash
            .get(hash)
            .and_then(|height| self.by_height.get(height))
            .copied())
    }

    fn get_by_height(&self, height: u64) -> Result<Option<StoredHeader>, StorageError> {
        Ok(self.by_height.get(&height).copied())
    }

    fn tip(&self) -> Result<Option<StoredHeader>, StorageError> {
        Ok(self.by_height.values().next_back().copied())
    }

    fn contains(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.by_hash.contains_key(hash))
    }
}

/// Body store held entirely in memory
#[derive(Debug, Default, Clone)]
pub struct MemoryBodyStore {
    bodies: HashMap<BlockHash, Vec<Transaction>>,
}

impl MemoryBodyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bodies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bodies.is_empty()
    }
}

impl BlockBodyStore for MemoryBodyStore {
    fn put_body(
        &mut self,
        hash: &BlockHash,
        transactions: &[Transaction],
    ) -> Result<(), StorageError> {
        self.bodies.insert(*hash, transactions.to_vec());
        Ok(())
    }

    fn get_body(&self, hash: &BlockHash) -> Result<Option<Vec<Transaction>>, StorageError> {
        Ok(self.bodies.get(hash).cloned())
    }

    fn has_body(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.bodies.contains_key(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Block, BlockHeader};

    fn child_of(parent: &StoredHeader, nonce: u32) -> StoredHeader {
        let header = BlockHeader {
            prev_hash: parent.hash,
            nonce,
            ..parent.header
        };
        StoredHeader::new(parent.height + 1, header)
    }

    #[test]
    fn test_put_and_lookup() {
        let mut store = MemoryHeaderStore::new();
        let genesis = StoredHeader::new(0, Block::genesis_header());
        store.put(&genesis).unwrap();

        assert_eq!(store.get_by_height(0).unwrap(), Some(genesis));
        assert_eq!(store.get_by_hash(&genesis.hash).unwrap(), Some(genesis));
        assert_eq!(store.tip().unwrap(), Some(genesis));
        assert!(store.get_by_height(1).unwrap().is_none());
    }

    #[test]
    fn test_tip_is_highest() {
        let mut store = MemoryHeaderStore::new();
        let genesis = StoredHeader::new(0, Block::genesis_header());
        let first = child_of(&genesis, 1);
        store.put(&genesis).unwrap();
        store.put(&first).unwrap();

        assert_eq!(store.tip().unwrap().unwrap().height, 1);
    }

    #[test]
    fn test_conflicts_rejected() {
        let mut store = MemoryHeaderStore::new();
        let genesis = StoredHeader::new(0, Block::genesis_header());
        store.put(&genesis).unwrap();

        // Same hash again
        assert!(matches!(
            store.put(&genesis),
            Err(StorageError::Conflict(_))
        ));

        // Different header at an occupied height
        let other = StoredHeader::new(0, child_of(&genesis, 9).header);
        assert!(matches!(store.put(&other), Err(StorageError::Conflict(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_body_store() {
        let mut bodies = MemoryBodyStore::new();
        let genesis = Block::genesis();
        let hash = genesis.hash();

        assert!(!bodies.has_body(&hash).unwrap());
        bodies
            .put_body(&hash, genesis.transactions.as_ref().unwrap())
            .unwrap();
        assert!(bodies.has_body(&hash).unwrap());
        assert_eq!(bodies.get_body(&hash).unwrap(), genesis.transactions);
    }
}
