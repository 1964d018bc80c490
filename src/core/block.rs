//! Block implementation for the blockchain
//!
//! A block is an 80-byte header plus an optional list of transactions.
//! Headers-only blocks are the normal case during header-first sync.

use crate::core::transaction::Transaction;
use crate::crypto::{double_sha256, Target, GENESIS_BITS};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

// =============================================================================
// Block Constants
// =============================================================================

/// Serialized block header size in bytes
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Main-network genesis timestamp
pub const GENESIS_TIME: u32 = 1231006505;

/// Main-network genesis nonce
pub const GENESIS_NONCE: u32 = 2083236893;

/// Main-network genesis merkle root, internal byte order
const GENESIS_MERKLE_ROOT: &str =
    "3ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a";

const GENESIS_SCRIPT_SIG: &str = "04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73";

const GENESIS_SCRIPT_PUBKEY: &str = "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac";

const GENESIS_REWARD: i64 = 5_000_000_000;

// =============================================================================
// Block Hash
// =============================================================================

/// A 32-byte hash in natural (little-endian) byte order.
///
/// Displayed and serialized reversed, the way block explorers show it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut reversed = self.0;
        reversed.reverse();
        f.write_str(&hex::encode(reversed))
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self)
    }
}

impl FromStr for BlockHash {
    type Err = hex::FromHexError;

    /// Parse the reversed (display) hex form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Block Header
// =============================================================================

/// Block header as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block version
    pub version: i32,
    /// Hash of the previous block
    pub prev_hash: BlockHash,
    /// Merkle root of all transactions
    pub merkle_root: BlockHash,
    /// Block creation timestamp (unix seconds)
    pub time: u32,
    /// Compact proof-of-work target
    pub bits: u32,
    /// Nonce used for proof of work
    pub nonce: u32,
}

impl BlockHeader {
    /// Serialize to the 80-byte consensus layout
    pub fn to_bytes(&self) -> [u8; BLOCK_HEADER_SIZE] {
        let mut out = [0u8; BLOCK_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.time.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Parse the 80-byte consensus layout
    pub fn from_bytes(bytes: &[u8; BLOCK_HEADER_SIZE]) -> Self {
        let word = |at: usize| [bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]];
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[4..36]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[36..68]);

        Self {
            version: i32::from_le_bytes(word(0)),
            prev_hash: BlockHash::from_bytes(prev),
            merkle_root: BlockHash::from_bytes(merkle),
            time: u32::from_le_bytes(word(68)),
            bits: u32::from_le_bytes(word(72)),
            nonce: u32::from_le_bytes(word(76)),
        }
    }

    /// Calculate the hash of the block header
    pub fn hash(&self) -> BlockHash {
        BlockHash::from_bytes(double_sha256(&self.to_bytes()))
    }

    /// Decoded proof-of-work target, if the compact bits are usable
    pub fn target(&self) -> Option<Target> {
        Target::from_compact(self.bits)
    }

    /// Check that `hash` is at or below the header's target
    pub fn meets_target(&self, hash: &BlockHash) -> bool {
        self.target()
            .map(|target| target.is_met_by(hash.as_bytes()))
            .unwrap_or(false)
    }
}

// =============================================================================
// Stored Header
// =============================================================================

/// A header linked into the local chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    /// Height assigned on acceptance
    pub height: u64,
    /// Cached header hash
    pub hash: BlockHash,
    pub header: BlockHeader,
}

impl StoredHeader {
    pub fn new(height: u64, header: BlockHeader) -> Self {
        Self {
            height,
            hash: header.hash(),
            header,
        }
    }
}

// =============================================================================
// Block
// =============================================================================

/// A header plus optional transaction body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// `None` for headers-only blocks
    pub transactions: Option<Vec<Transaction>>,
}

impl Block {
    /// A block without a body
    pub fn header_only(header: BlockHeader) -> Self {
        Self {
            header,
            transactions: None,
        }
    }

    pub fn with_transactions(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self {
            header,
            transactions: Some(transactions),
        }
    }

    pub fn hash(&self) -> BlockHash {
        self.header.hash()
    }

    pub fn has_body(&self) -> bool {
        self.transactions.is_some()
    }

    /// Get number of transactions in this block
    pub fn tx_count(&self) -> usize {
        self.transactions.as_ref().map(Vec::len).unwrap_or(0)
    }

    /// The main-network genesis header
    pub fn genesis_header() -> BlockHeader {
        Self::genesis_header_with(GENESIS_TIME, GENESIS_BITS, GENESIS_NONCE)
    }

    /// A genesis header over the shared Bitcoin genesis coinbase. Every
    /// network's genesis differs only in time, bits and nonce.
    pub fn genesis_header_with(time: u32, bits: u32, nonce: u32) -> BlockHeader {
        let merkle_root = hex_array(GENESIS_MERKLE_ROOT);
        BlockHeader {
            version: 1,
            prev_hash: BlockHash::zero(),
            merkle_root: BlockHash::from_bytes(merkle_root),
            time,
            bits,
            nonce,
        }
    }

    /// The main-network genesis block with its coinbase transaction
    pub fn genesis() -> Self {
        Self::genesis_with(Self::genesis_header())
    }

    /// `header` with the genesis coinbase as its body
    pub fn genesis_with(header: BlockHeader) -> Self {
        let coinbase = Transaction::coinbase(
            hex_bytes(GENESIS_SCRIPT_SIG),
            GENESIS_REWARD,
            hex_bytes(GENESIS_SCRIPT_PUBKEY),
        );
        Self::with_transactions(header, vec![coinbase])
    }
}

fn hex_bytes(s: &str) -> Vec<u8> {
    // Constants above are checked by the genesis tests
    hex::decode(s).unwrap_or_default()
}

fn hex_array(s: &str) -> [u8; 32] {
    let mut out = [0u8; 32];
    let _ = hex::decode_to_slice(s, &mut out);
    out
}
