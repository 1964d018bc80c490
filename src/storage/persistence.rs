//! File-backed persistence
//!
//! Headers go to an append-only JSON-lines log that is replayed into an
//! in-memory index at open. Bodies are written one file per block hash,
//! through a pluggable `TxCodec`.

use crate::core::{BlockHash, StoredHeader, Transaction};
use crate::storage::codec::{JsonTxCodec, TxCodec};
use crate::storage::memory::MemoryHeaderStore;
use crate::storage::store::{BlockBodyStore, HeaderStore, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Storage configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub headers_file: String,
    pub bodies_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".goldchain"),
            headers_file: "headers.jsonl".to_string(),
            bodies_dir: "transactions".to_string(),
        }
    }
}

impl StorageConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    fn headers_path(&self) -> PathBuf {
        self.data_dir.join(&self.headers_file)
    }

    fn bodies_path(&self) -> PathBuf {
        self.data_dir.join(&self.bodies_dir)
    }
}

// =============================================================================
// Header Log
// =============================================================================

/// Header store backed by an append-only JSON-lines file
pub struct FileHeaderStore {
    index: MemoryHeaderStore,
    /// Unbuffered append handle; a failed write is rolled back at once
    log: File,
    path: PathBuf,
}

impl FileHeaderStore {
    /// Open (or create) the header log and replay it
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        fs::create_dir_all(&config.data_dir)?;
        let path = config.headers_path();

        let mut index = MemoryHeaderStore::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let header: StoredHeader = serde_json::from_str(&line)?;
                if header.header.hash() != header.hash {
                    return Err(StorageError::Corrupt(format!(
                        "line {}: stored hash does not match header",
                        line_no + 1
                    )));
                }
                index.put(&header).map_err(|e| {
                    StorageError::Corrupt(format!("line {}: {}", line_no + 1, e))
                })?;
            }
            log::info!("Loaded {} headers from {}", index.len(), path.display());
        }

        let log = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self { index, log, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl HeaderStore for FileHeaderStore {
    fn put(&mut self, header: &StoredHeader) -> Result<(), StorageError> {
        self.index.check_insert(header)?;

        let mut line = serde_json::to_vec(header)?;
        line.push(b'\n');

        let start = self.log.metadata()?.len();
        if let Err(e) = self.log.write_all(&line) {
            // Cut off whatever part of the line made it to disk
            if let Err(trunc) = self.log.set_len(start) {
                log::error!(
                    "Cannot roll back {} to {} bytes: {}",
                    self.path.display(),
                    start,
                    trunc
                );
            }
            return Err(e.into());
        }

        self.index.put(header)
    }

    fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, StorageError> {
        self.index.get_by_hash(hash)
    }

    fn get_by_height(&self, height: u64) -> Result<Option<StoredHeader>, StorageError> {
        self.index.get_by_height(height)
    }

    fn tip(&self) -> Result<Option<StoredHeader>, StorageError> {
        self.index.tip()
    }

    fn contains(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        self.index.contains(hash)
    }
}

// =============================================================================
// Body Files
// =============================================================================

/// Body store writing one file per block
pub struct FileBodyStore<C: TxCodec = JsonTxCodec> {
    dir: PathBuf,
    codec: C,
}

impl FileBodyStore<JsonTxCodec> {
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        Self::with_codec(config, JsonTxCodec)
    }
}

impl<C: TxCodec> FileBodyStore<C> {
    pub fn with_codec(config: &StorageConfig, codec: C) -> Result<Self, StorageError> {
        let dir = config.bodies_path();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, codec })
    }

    fn body_path(&self, hash: &BlockHash) -> PathBuf {
        self.dir.join(hash.to_string())
    }
}

impl<C: TxCodec> BlockBodyStore for FileBodyStore<C> {
    fn put_body(
        &mut self,
        hash: &BlockHash,
        transactions: &[Transaction],
    ) -> Result<(), StorageError> {
        let bytes = self.codec.encode(transactions)?;

        // Write to temporary file first
        let path = self.body_path(hash);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, bytes)?;

        // Atomic rename
        fs::rename(&temp_path, &path)?;
        Ok(())
    }

    fn get_body(&self, hash: &BlockHash) -> Result<Option<Vec<Transaction>>, StorageError> {
        let path = self.body_path(hash);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(self.codec.decode(&bytes)?))
    }

    fn has_body(&self, hash: &BlockHash) -> Result<bool, StorageError> {
        Ok(self.body_path(hash).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Block, BlockHeader};

    fn config(dir: &tempfile::TempDir) -> StorageConfig {
        StorageConfig::with_data_dir(dir.path())
    }

    #[test]
    fn test_headers_survive_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let genesis = StoredHeader::new(0, Block::genesis_header());
        let next = StoredHeader::new(
            1,
            BlockHeader {
                prev_hash: genesis.hash,
                nonce: 7,
                ..genesis.header
            },
        );

        {
            let mut store = FileHeaderStore::open(&config(&temp_dir)).unwrap();
            assert!(store.is_empty());
            store.put(&genesis).unwrap();
            store.put(&next).unwrap();
        }

        let store = FileHeaderStore::open(&config(&temp_dir)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.tip().unwrap(), Some(next));
        assert_eq!(store.get_by_hash(&genesis.hash).unwrap(), Some(genesis));
    }

    #[test]
    fn test_conflict_not_written() {
        let temp_dir = tempfile::tempdir().unwrap();
        let genesis = StoredHeader::new(0, Block::genesis_header());

        {
            let mut store = FileHeaderStore::open(&config(&temp_dir)).unwrap();
            store.put(&genesis).unwrap();
            assert!(store.put(&genesis).is_err());
        }

        // A conflicting line in the log would make reopening fail
        let store = FileHeaderStore::open(&config(&temp_dir)).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_failed_write_leaves_no_trace() {
        let temp_dir = tempfile::tempdir().unwrap();
        let genesis = StoredHeader::new(0, Block::genesis_header());
        let child = |nonce| {
            StoredHeader::new(
                1,
                BlockHeader {
                    prev_hash: genesis.hash,
                    nonce,
                    ..genesis.header
                },
            )
        };
        let (rejected, accepted) = (child(7), child(8));

        {
            let mut store = FileHeaderStore::open(&config(&temp_dir)).unwrap();
            store.put(&genesis).unwrap();

            // Swap in a handle that cannot write
            let path = store.path().to_path_buf();
            store.log = File::open(&path).unwrap();
            assert!(matches!(store.put(&rejected), Err(StorageError::IoError(_))));
            assert_eq!(store.len(), 1);

            store.log = OpenOptions::new().append(true).open(&path).unwrap();
            store.put(&accepted).unwrap();
        }

        let store = FileHeaderStore::open(&config(&temp_dir)).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.tip().unwrap(), Some(accepted));
        assert_eq!(store.get_by_hash(&rejected.hash).unwrap(), None);
    }

    #[test]
    fn test_corrupt_log_detected() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut genesis = StoredHeader::new(0, Block::genesis_header());
        genesis.hash = BlockHash::from_bytes([1u8; 32]);

        let cfg = config(&temp_dir);
        fs::write(
            cfg.headers_path(),
            format!("{}\n", serde_json::to_string(&genesis).unwrap()),
        )
        .unwrap();

        assert!(matches!(
            FileHeaderStore::open(&cfg),
            Err(StorageError::Corrupt(_))
        ));
    }

    #[test]
    fn test_body_files() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut bodies = FileBodyStore::open(&config(&temp_dir)).unwrap();
        let genesis = Block::genesis();
        let hash = genesis.hash();

        assert_eq!(bodies.get_body(&hash).unwrap(), None);
        bodies
            .put_body(&hash, genesis.transactions.as_ref().unwrap())
            .unwrap();
        assert!(bodies.has_body(&hash).unwrap());
        assert_eq!(bodies.get_body(&hash).unwrap(), genesis.transactions);
    }
}
