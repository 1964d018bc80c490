//! Orphan pool
//!
//! Headers whose parent is not yet stored wait here until the parent is
//! linked. Entries are indexed by their own hash and by parent hash so a
//! newly linked header finds its children in one lookup.

use crate::core::block::{Block, BlockHash};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Maximum number of orphan headers to keep in memory
pub const MAX_ORPHAN_BLOCKS: usize = 750;

/// Maximum time an orphan can stay in the pool
pub const ORPHAN_BLOCK_EXPIRE_TIME: Duration = Duration::from_secs(60 * 60);

/// An orphan block waiting for its parent
#[derive(Debug, Clone)]
pub struct OrphanBlock {
    /// The block itself
    pub block: Block,
    pub hash: BlockHash,
    /// When this orphan was received
    pub received_at: Instant,
}

impl OrphanBlock {
    pub fn new(block: Block, hash: BlockHash, received_at: Instant) -> Self {
        Self {
            block,
            hash,
            received_at,
        }
    }

    pub fn parent_hash(&self) -> &BlockHash {
        &self.block.header.prev_hash
    }

    /// Check if this orphan has expired
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.received_at) > ORPHAN_BLOCK_EXPIRE_TIME
    }
}

/// Headers waiting for an unknown parent
#[derive(Debug)]
pub struct OrphanPool {
    orphans: HashMap<BlockHash, OrphanBlock>,
    /// Parent hash to orphan hashes
    by_parent: HashMap<BlockHash, Vec<BlockHash>>,
    max_size: usize,
}

impl Default for OrphanPool {
    fn default() -> Self {
        Self::new()
    }
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::with_capacity(MAX_ORPHAN_BLOCKS)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            orphans: HashMap::new(),
            by_parent: HashMap::new(),
            max_size: max_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.orphans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orphans.is_empty()
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.orphans.contains_key(hash)
    }

    /// Add an orphan block to the pool. Returns false if already present.
    pub fn add(&mut self, block: Block, hash: BlockHash, now: Instant) -> bool {
        if self.orphans.contains_key(&hash) {
            return false;
        }

        if self.orphans.len() >= self.max_size {
            self.prune_expired(now);
        }
        if self.orphans.len() >= self.max_size {
            self.evict_oldest();
        }

        let orphan = OrphanBlock::new(block, hash, now);
        self.by_parent
            .entry(*orphan.parent_hash())
            .or_default()
            .push(hash);
        self.orphans.insert(hash, orphan);

        true
    }

    /// Remove and return every orphan waiting on `parent`, in arrival order
    pub fn take_children(&mut self, parent: &BlockHash) -> Vec<Block> {
        let hashes = self.by_parent.remove(parent).unwrap_or_default();
        hashes
            .iter()
            .filter_map(|h| self.orphans.remove(h))
            .map(|o| o.block)
            .collect()
    }

    /// Remove an orphan block
    pub fn remove(&mut self, hash: &BlockHash) -> Option<Block> {
        let orphan = self.orphans.remove(hash)?;
        let parent = *orphan.parent_hash();
        if let Some(siblings) = self.by_parent.get_mut(&parent) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_parent.remove(&parent);
            }
        }
        Some(orphan.block)
    }

    /// Remove expired orphans
    pub fn prune_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<BlockHash> = self
            .orphans
            .values()
            .filter(|orphan| orphan.is_expired(now))
            .map(|orphan| orphan.hash)
            .collect();

        for hash in &expired {
            self.remove(hash);
        }
        expired.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .orphans
            .values()
            .min_by_key(|orphan| orphan.received_at)
            .map(|orphan| orphan.hash);
        if let Some(hash) = oldest {
            log::debug!("Orphan pool full, evicting {}", hash);
            self.remove(&hash);
        }
    }
}
