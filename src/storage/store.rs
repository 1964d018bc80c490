//! Storage contracts
//!
//! The chain engine persists through these two traits. Heights are the
//! primary key of the header store and hashes are unique; bodies are keyed
//! by block hash and are optional per header.

use crate::core::{BlockHash, StoredHeader, Transaction};
use std::io;
use thiserror::Error;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Conflicting entry: {0}")]
    Conflict(String),
    #[error("Corrupt store: {0}")]
    Corrupt(String),
}

/// Persistent header index: height and hash to header
pub trait HeaderStore: Send + 'static {
    /// Insert a header. Fails with `Conflict` if its height or hash exists.
    fn put(&mut self, header: &StoredHeader) -> Result<(), StorageError>;

    fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, StorageError>;

    fn get_by_height(&self, height: u64) -> Result<Option<StoredHeader>, StorageError>;

    /// Header with the greatest height, `None` when empty
    fn tip(&self) -> Result<Option<StoredHeader>, StorageError>;

    fn contains(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.get_by_hash(hash)?.is_some())
    }
}

/// Persistent transaction bodies keyed by block hash
pub trait BlockBodyStore: Send + 'static {
    fn put_body(
        &mut self,
        hash: &BlockHash,
        transactions: &[Transaction],
    ) -> Result<(), StorageError>;

    fn get_body(&self, hash: &BlockHash) -> Result<Option<Vec<Transaction>>, StorageError>;

    fn has_body(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.get_body(hash)?.is_some())
    }
}

impl<T: HeaderStore + ?Sized> HeaderStore for Box<T> {
    fn put(&mut self, header: &StoredHeader) -> Result<(), StorageError> {
        (**self).put(header)
    }

    fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, StorageError> {
        (**self).get_by_hash(hash)
    }

    fn get_by_height(&self, height: u64) -> Result<Option<StoredHeader>, StorageError> {
        (**self).get_by_height(height)
    }

    fn tip(&self) -> Result<Option<StoredHeader>, StorageError> {
        (**self).tip()
    }
}

impl<T: BlockBodyStore + ?Sized> BlockBodyStore for Box<T> {
    fn put_body(
        &mut self,
        hash: &BlockHash,
        transactions: &[Transaction],
    ) -> Result<(), StorageError> {
        (**self).put_body(hash, transactions)
    }

    fn get_body(&self, hash: &BlockHash) -> Result<Option<Vec<Transaction>>, StorageError> {
        (**self).get_body(hash)
    }

    fn has_body(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        (**self).has_body(hash)
    }
}
