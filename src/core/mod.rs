//! Core blockchain components
//!
//! This module contains the fundamental building blocks:
//! - Blocks and headers (double SHA-256 hashing, compact targets)
//! - Transaction bodies (stored, never executed)
//! - The header chain with orphan resolution
//! - The chain manager actor that serializes access to it

pub mod block;
pub mod blockchain;
pub mod chain_state;
pub mod manager;
pub mod transaction;

pub use block::{Block, BlockHash, BlockHeader, StoredHeader, BLOCK_HEADER_SIZE};
pub use blockchain::{Chain, ChainError, ChainStats, SubmitOutcome, MAX_HEADERS_PER_MESSAGE};
pub use chain_state::{OrphanBlock, OrphanPool, MAX_ORPHAN_BLOCKS, ORPHAN_BLOCK_EXPIRE_TIME};
pub use manager::{ChainHandle, ChainManager};
pub use transaction::{Transaction, TransactionInput, TransactionOutput, SEQUENCE_FINAL};
