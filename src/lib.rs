//! Goldchain: a Bitcoin-protocol header-chain node in Rust
//!
//! This crate provides a proof-of-work peer-to-peer node featuring:
//! - Bitcoin wire protocol codec (framing, checksums, varints, addresses)
//! - Per-connection peer sessions with handshake and keepalive
//! - A shared peer directory fed by DNS seeds and `addr` gossip
//! - Header validation against compact proof-of-work targets
//! - Orphan header resolution with a bounded, expiring pool
//! - JSON-lines header storage and per-block transaction bodies
//!
//! # Example
//!
//! ```rust
//! use goldchain::core::{Block, Chain};
//! use goldchain::storage::{MemoryBodyStore, MemoryHeaderStore};
//!
//! let mut chain = Chain::open(MemoryHeaderStore::new(), MemoryBodyStore::new()).unwrap();
//! chain.bootstrap_genesis(Block::genesis()).unwrap();
//!
//! let tip = chain.tip().unwrap();
//! assert_eq!(tip.height, 0);
//! assert_eq!(tip.hash, Block::genesis_header().hash());
//! ```

pub mod core;
pub mod crypto;
pub mod network;
pub mod storage;

// Re-export commonly used types
pub use core::{
    Block, BlockHash, BlockHeader, Chain, ChainError, ChainHandle, ChainManager, ChainStats,
    StoredHeader, SubmitOutcome, Transaction,
};
pub use crypto::Target;
pub use network::{Message, Network, Node, NodeConfig, PeerDirectory, WireError};
pub use storage::{BlockBodyStore, HeaderStore, StorageConfig, StorageError};
