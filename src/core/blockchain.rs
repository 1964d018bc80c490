//! Blockchain implementation
//!
//! `Chain` validates headers and links them into a single linear chain
//! extended strictly by `prev_hash == tip.hash`. Headers with an unknown
//! parent are parked in the orphan pool and linked as soon as their parent
//! becomes the tip. There is no cumulative-work fork choice: a header whose
//! parent is stored but is not the tip is reported as a stale branch.
//!
//! `Chain` is synchronous and single-owner; concurrent callers go through
//! [`ChainManager`](crate::core::manager::ChainManager).

use crate::core::block::{Block, BlockHash, BlockHeader, StoredHeader};
use crate::core::chain_state::OrphanPool;
use crate::core::transaction::Transaction;
use crate::storage::{BlockBodyStore, HeaderStore, StorageError};
use std::collections::VecDeque;
use std::time::Instant;
use thiserror::Error;

/// Most headers returned for one `getheaders` request
pub const MAX_HEADERS_PER_MESSAGE: usize = 2000;

/// Blockchain-related errors
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Invalid proof of work: {hash} does not meet bits {bits:#010x}")]
    ProofOfWork { hash: BlockHash, bits: u32 },
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("Chain manager unavailable")]
    Unavailable,
}

/// Result of submitting a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// First header of an empty store, linked at height 0
    Genesis,
    /// Linked on top of the tip; `reattached` orphans followed it
    Extended { height: u64, reattached: usize },
    /// Already stored, nothing changed
    Duplicate,
    /// Already stored as header-only; its body is now stored too
    BodyAttached,
    /// Parent unknown, parked in the orphan pool
    Orphaned,
    /// Parent stored but not the tip, ignored
    StaleBranch,
}

impl SubmitOutcome {
    /// Whether the tip moved
    pub fn advanced_tip(&self) -> bool {
        matches!(self, SubmitOutcome::Genesis | SubmitOutcome::Extended { .. })
    }
}

/// Chain summary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainStats {
    pub height: Option<u64>,
    pub tip: Option<BlockHash>,
    pub orphans: usize,
}

/// The header chain over a header store and a body store
pub struct Chain<H: HeaderStore, B: BlockBodyStore> {
    headers: H,
    bodies: B,
    tip: Option<StoredHeader>,
    orphans: OrphanPool,
}

impl<H: HeaderStore, B: BlockBodyStore> Chain<H, B> {
    /// Open a chain over existing stores, loading the current tip
    pub fn open(headers: H, bodies: B) -> Result<Self, ChainError> {
        let tip = headers.tip()?;
        if let Some(tip) = &tip {
            log::info!("Chain tip at height {} ({})", tip.height, tip.hash);
        }

        Ok(Self {
            headers,
            bodies,
            tip,
            orphans: OrphanPool::new(),
        })
    }

    /// Store `genesis` if the chain is empty.
    /// Returns true if genesis was written.
    pub fn bootstrap_genesis(&mut self, genesis: Block) -> Result<bool, ChainError> {
        if self.tip.is_some() {
            return Ok(false);
        }
        log::info!("Bootstrapping blockchain with genesis block {}", genesis.hash());
        let outcome = self.submit(genesis)?;
        Ok(outcome == SubmitOutcome::Genesis)
    }

    /// Validate a block and link it into the chain
    pub fn submit(&mut self, block: Block) -> Result<SubmitOutcome, ChainError> {
        let hash = block.hash();

        if self.headers.contains(&hash)? {
            if let Some(transactions) = &block.transactions {
                if !self.bodies.has_body(&hash)? {
                    self.bodies.put_body(&hash, transactions)?;
                    log::debug!("Attached body to stored header {}", hash);
                    return Ok(SubmitOutcome::BodyAttached);
                }
            }
            return Ok(SubmitOutcome::Duplicate);
        }

        if self.orphans.contains(&hash) {
            return Ok(SubmitOutcome::Orphaned);
        }

        if !block.header.meets_target(&hash) {
            return Err(ChainError::ProofOfWork {
                hash,
                bits: block.header.bits,
            });
        }

        let tip = match self.tip {
            None => {
                self.link(&block, hash, 0)?;
                log::info!("Accepted genesis header {}", hash);
                self.reattach_orphans(hash);
                return Ok(SubmitOutcome::Genesis);
            }
            Some(tip) => tip,
        };

        if block.header.prev_hash == tip.hash {
            let height = tip.height + 1;
            self.link(&block, hash, height)?;
            log::debug!("Linked header {} at height {}", hash, height);
            let reattached = self.reattach_orphans(hash);
            return Ok(SubmitOutcome::Extended { height, reattached });
        }

        if self.headers.contains(&block.header.prev_hash)? {
            log::debug!(
                "Header {} builds on {} which is not the tip, ignoring",
                hash,
                block.header.prev_hash
            );
            return Ok(SubmitOutcome::StaleBranch);
        }

        log::debug!(
            "Found an orphan {} (parent {})",
            hash,
            block.header.prev_hash
        );
        self.orphans.add(block, hash, Instant::now());
        Ok(SubmitOutcome::Orphaned)
    }

    /// Persist the header and move the tip, then store the body if any.
    /// A body that fails to store can be attached by a later submission.
    fn link(&mut self, block: &Block, hash: BlockHash, height: u64) -> Result<(), ChainError> {
        let stored = StoredHeader {
            height,
            hash,
            header: block.header,
        };
        self.headers.put(&stored)?;
        self.tip = Some(stored);

        if let Some(transactions) = &block.transactions {
            if let Err(e) = self.bodies.put_body(&hash, transactions) {
                log::warn!("Stored header {} without its body: {}", hash, e);
            }
        }
        Ok(())
    }

    /// Link every orphan chain hanging off `parent`. Runs to completion
    /// before returning, so the cascade is atomic for the caller.
    fn reattach_orphans(&mut self, parent: BlockHash) -> usize {
        let mut reattached = 0;
        let mut queue = VecDeque::from([parent]);

        while let Some(parent) = queue.pop_front() {
            for child in self.orphans.take_children(&parent) {
                let tip = match self.tip {
                    Some(tip) => tip,
                    None => break,
                };
                let hash = child.hash();

                if child.header.prev_hash != tip.hash {
                    // A sibling already took this height
                    log::debug!("Orphan {} lost to a sibling, dropping", hash);
                    continue;
                }

                match self.link(&child, hash, tip.height + 1) {
                    Ok(()) => {
                        log::debug!("Found a parent for orphan {}", hash);
                        reattached += 1;
                        queue.push_back(hash);
                    }
                    Err(e) => {
                        log::error!("Failed to link orphan {}: {}", hash, e);
                        self.orphans.add(child, hash, Instant::now());
                    }
                }
            }
        }

        if reattached > 0 {
            log::info!("Reattached {} orphan headers", reattached);
        }
        reattached
    }

    /// Current best header
    pub fn tip(&self) -> Option<&StoredHeader> {
        self.tip.as_ref()
    }

    pub fn height(&self) -> Option<u64> {
        self.tip.map(|t| t.height)
    }

    pub fn lookup_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, ChainError> {
        Ok(self.headers.get_by_hash(hash)?)
    }

    pub fn lookup_by_height(&self, height: u64) -> Result<Option<StoredHeader>, ChainError> {
        Ok(self.headers.get_by_height(height)?)
    }

    pub fn body(&self, hash: &BlockHash) -> Result<Option<Vec<Transaction>>, ChainError> {
        Ok(self.bodies.get_body(hash)?)
    }

    /// Headers following the first locator hash we know, up to and
    /// including `stop` (zero hash for no stop), at most `max` of them.
    /// With no known locator hash the walk starts right after genesis.
    pub fn headers_after(
        &self,
        locator: &[BlockHash],
        stop: &BlockHash,
        max: usize,
    ) -> Result<Vec<BlockHeader>, ChainError> {
        let mut start = 1;
        for hash in locator {
            if let Some(found) = self.headers.get_by_hash(hash)? {
                start = found.height + 1;
                break;
            }
        }

        let mut out = Vec::new();
        let mut height = start;
        while out.len() < max.min(MAX_HEADERS_PER_MESSAGE) {
            let Some(stored) = self.headers.get_by_height(height)? else {
                break;
            };
            out.push(stored.header);
            if !stop.is_zero() && stored.hash == *stop {
                break;
            }
            height += 1;
        }
        Ok(out)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn stats(&self) -> ChainStats {
        ChainStats {
            height: self.height(),
            tip: self.tip.map(|t| t.hash),
            orphans: self.orphans.len(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::block::GENESIS_TIME;
    use crate::storage::{MemoryBodyStore, MemoryHeaderStore};

    /// Regtest difficulty: roughly every other hash qualifies
    pub const EASY_BITS: u32 = 0x207fffff;

    pub fn mine(prev_hash: BlockHash, time: u32) -> BlockHeader {
        let mut header = BlockHeader {
            version: 1,
            prev_hash,
            merkle_root: BlockHash::from_bytes([0xab; 32]),
            time,
            bits: EASY_BITS,
            nonce: 0,
        };
        while !header.meets_target(&header.hash()) {
            header.nonce += 1;
        }
        header
    }

    /// `count` linked headers on top of `parent`
    pub fn mine_chain(parent: BlockHash, count: usize) -> Vec<BlockHeader> {
        let mut out = Vec::with_capacity(count);
        let mut prev = parent;
        for i in 0..count {
            let header = mine(prev, GENESIS_TIME + 600 * (i as u32 + 1));
            prev = header.hash();
            out.push(header);
        }
        out
    }

    pub fn memory_chain() -> Chain<MemoryHeaderStore, MemoryBodyStore> {
        Chain::open(MemoryHeaderStore::new(), MemoryBodyStore::new()).unwrap()
    }

    /// Store that fails every write
    struct ReadOnlyStore(MemoryHeaderStore);

    impl HeaderStore for ReadOnlyStore {
        fn put(&mut self, _header: &StoredHeader) -> Result<(), StorageError> {
            Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }

        fn get_by_hash(&self, hash: &BlockHash) -> Result<Option<StoredHeader>, StorageError> {
            self.0.get_by_hash(hash)
        }

        fn get_by_height(&self, height: u64) -> Result<Option<StoredHeader>, StorageError> {
            self.0.get_by_height(height)
        }

        fn tip(&self) -> Result<Option<StoredHeader>, StorageError> {
            self.0.tip()
        }
    }

    /// Body store that fails every write
    #[derive(Default)]
    struct FullBodyStore(MemoryBodyStore);

    impl BlockBodyStore for FullBodyStore {
        fn put_body(
            &mut self,
            _hash: &BlockHash,
            _transactions: &[Transaction],
        ) -> Result<(), StorageError> {
            Err(StorageError::IoError(std::io::Error::new(
                std::io::ErrorKind::Other,
                "no space left",
            )))
        }

        fn get_body(&self, hash: &BlockHash) -> Result<Option<Vec<Transaction>>, StorageError> {
            self.0.get_body(hash)
        }
    }

    #[test]
    fn test_genesis_accepted_on_empty_store() {
        let mut chain = memory_chain();
        assert!(chain.tip().is_none());

        let outcome = chain.submit(Block::header_only(Block::genesis_header())).unwrap();
        assert_eq!(outcome, SubmitOutcome::Genesis);

        let tip = chain.tip().unwrap();
        assert_eq!(tip.height, 0);
        assert_eq!(
            tip.hash.to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
    }

    #[test]
    fn test_bootstrap_genesis_stores_body() {
        let mut chain = memory_chain();
        assert!(chain.bootstrap_genesis(Block::genesis()).unwrap());
        assert!(!chain.bootstrap_genesis(Block::genesis()).unwrap());

        let hash = Block::genesis_header().hash();
        let body = chain.body(&hash).unwrap().unwrap();
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn test_extend_tip() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let genesis = chain.tip().unwrap().hash;

        for (i, header) in mine_chain(genesis, 3).into_iter().enumerate() {
            let outcome = chain.submit(Block::header_only(header)).unwrap();
            assert_eq!(
                outcome,
                SubmitOutcome::Extended {
                    height: i as u64 + 1,
                    reattached: 0
                }
            );
        }
        assert_eq!(chain.height(), Some(3));
        assert_eq!(chain.lookup_by_height(3).unwrap().unwrap().hash, chain.tip().unwrap().hash);
    }

    #[test]
    fn test_idempotent_submission() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let header = mine(chain.tip().unwrap().hash, GENESIS_TIME + 600);

        assert!(chain.submit(Block::header_only(header)).unwrap().advanced_tip());
        let tip_after_first = *chain.tip().unwrap();

        assert_eq!(
            chain.submit(Block::header_only(header)).unwrap(),
            SubmitOutcome::Duplicate
        );
        assert_eq!(*chain.tip().unwrap(), tip_after_first);
        assert_eq!(chain.lookup_by_height(2).unwrap(), None);
        assert_eq!(
            chain.lookup_by_hash(&header.hash()).unwrap().unwrap().height,
            1
        );
    }

    #[test]
    fn test_body_attached_to_stored_header() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let header = mine(chain.tip().unwrap().hash, GENESIS_TIME + 600);
        chain.submit(Block::header_only(header)).unwrap();
        assert!(chain.body(&header.hash()).unwrap().is_none());

        let body = Block::genesis().transactions.unwrap();
        let outcome = chain
            .submit(Block::with_transactions(header, body.clone()))
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::BodyAttached);
        assert_eq!(chain.body(&header.hash()).unwrap(), Some(body.clone()));

        // Second time round nothing changes
        let outcome = chain.submit(Block::with_transactions(header, body)).unwrap();
        assert_eq!(outcome, SubmitOutcome::Duplicate);
    }

    #[test]
    fn test_orphan_reattachment() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let genesis = chain.tip().unwrap().hash;
        let headers = mine_chain(genesis, 2);
        let (a, b) = (headers[0], headers[1]);

        assert_eq!(
            chain.submit(Block::header_only(b)).unwrap(),
            SubmitOutcome::Orphaned
        );
        assert_eq!(chain.tip().unwrap().hash, genesis);
        assert_eq!(chain.orphan_count(), 1);

        assert_eq!(
            chain.submit(Block::header_only(a)).unwrap(),
            SubmitOutcome::Extended {
                height: 1,
                reattached: 1
            }
        );
        assert_eq!(chain.tip().unwrap().hash, b.hash());
        assert_eq!(chain.height(), Some(2));
        assert_eq!(chain.orphan_count(), 0);
    }

    #[test]
    fn test_orphan_cascade() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let headers = mine_chain(chain.tip().unwrap().hash, 5);

        // Everything but the first arrives in reverse
        for header in headers[1..].iter().rev() {
            assert_eq!(
                chain.submit(Block::header_only(*header)).unwrap(),
                SubmitOutcome::Orphaned
            );
        }
        // Resubmitting an orphan keeps a single copy
        chain.submit(Block::header_only(headers[3])).unwrap();
        assert_eq!(chain.orphan_count(), 4);

        let outcome = chain.submit(Block::header_only(headers[0])).unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Extended {
                height: 1,
                reattached: 4
            }
        );
        assert_eq!(chain.height(), Some(5));
        assert_eq!(chain.orphan_count(), 0);
    }

    #[test]
    fn test_stale_branch_ignored() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let genesis = chain.tip().unwrap().hash;
        let main = mine(genesis, GENESIS_TIME + 600);
        let side = mine(genesis, GENESIS_TIME + 601);

        chain.submit(Block::header_only(main)).unwrap();
        assert_eq!(
            chain.submit(Block::header_only(side)).unwrap(),
            SubmitOutcome::StaleBranch
        );
        assert_eq!(chain.tip().unwrap().hash, main.hash());
        assert_eq!(chain.orphan_count(), 0);
        assert!(chain.lookup_by_hash(&side.hash()).unwrap().is_none());
    }

    #[test]
    fn test_bad_proof_of_work_rejected() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let mut header = mine(BlockHash::from_bytes([9; 32]), GENESIS_TIME);
        // Target of one: no realistic hash meets it
        header.bits = 0x03000001;

        let err = chain.submit(Block::header_only(header)).unwrap_err();
        assert!(matches!(err, ChainError::ProofOfWork { .. }));
        assert_eq!(chain.orphan_count(), 0);
        assert!(chain.lookup_by_hash(&header.hash()).unwrap().is_none());
    }

    #[test]
    fn test_storage_failure_surfaces() {
        let mut chain = Chain::open(ReadOnlyStore(MemoryHeaderStore::new()), MemoryBodyStore::new())
            .unwrap();
        let err = chain
            .submit(Block::header_only(Block::genesis_header()))
            .unwrap_err();
        assert!(matches!(err, ChainError::Storage(_)));
        assert!(chain.tip().is_none());
        assert_eq!(chain.orphan_count(), 0);
    }

    #[test]
    fn test_rejected_header_leaves_no_body() {
        let mut chain = Chain::open(ReadOnlyStore(MemoryHeaderStore::new()), MemoryBodyStore::new())
            .unwrap();
        let genesis = Block::genesis();
        let hash = genesis.hash();

        assert!(chain.submit(genesis).is_err());
        assert!(chain.body(&hash).unwrap().is_none());
    }

    #[test]
    fn test_body_failure_keeps_header() {
        let mut chain = Chain::open(MemoryHeaderStore::new(), FullBodyStore::default()).unwrap();
        let genesis = Block::genesis();
        let hash = genesis.hash();

        assert_eq!(chain.submit(genesis).unwrap(), SubmitOutcome::Genesis);
        assert_eq!(chain.tip().unwrap().hash, hash);
        assert!(chain.body(&hash).unwrap().is_none());
    }

    #[test]
    fn test_headers_after() {
        let mut chain = memory_chain();
        chain.bootstrap_genesis(Block::genesis()).unwrap();
        let genesis = chain.tip().unwrap().hash;
        let headers = mine_chain(genesis, 4);
        for header in &headers {
            chain.submit(Block::header_only(*header)).unwrap();
        }

        let all = chain.headers_after(&[genesis], &BlockHash::zero(), 10).unwrap();
        assert_eq!(all, headers);

        let capped = chain.headers_after(&[genesis], &BlockHash::zero(), 2).unwrap();
        assert_eq!(capped, headers[..2].to_vec());

        let stopped = chain
            .headers_after(&[headers[0].hash()], &headers[2].hash(), 10)
            .unwrap();
        assert_eq!(stopped, headers[1..3].to_vec());

        // Unknown locators fall back to the start of the chain
        let unknown = chain
            .headers_after(&[BlockHash::from_bytes([5; 32])], &BlockHash::zero(), 10)
            .unwrap();
        assert_eq!(unknown, headers);
    }
}
