//! Transaction bodies
//!
//! Transactions are carried alongside headers but are opaque to chain
//! validation: they are stored and returned, never executed. Scripts are
//! kept as raw bytes.

use crate::core::block::BlockHash;
use serde::{Deserialize, Serialize};

/// Sequence number that disables locktime
pub const SEQUENCE_FINAL: u32 = 0xFFFFFFFF;

/// Output index used by coinbase inputs
pub const COINBASE_OUTPUT_INDEX: u32 = 0xFFFFFFFF;

// =============================================================================
// Transaction Input
// =============================================================================

/// Transaction input (reference to previous output)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionInput {
    /// Hash of the transaction holding the spent output
    pub prev_tx_hash: BlockHash,
    /// Index of the output in the previous transaction
    pub prev_tx_index: u32,
    /// Unlocking script
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
    /// Sequence number
    pub sequence: u32,
}

// =============================================================================
// Transaction Output
// =============================================================================

/// Transaction output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionOutput {
    /// Value in base units
    pub value: i64,
    /// Locking script
    #[serde(with = "hex_bytes")]
    pub script: Vec<u8>,
}

// =============================================================================
// Transaction
// =============================================================================

/// A transaction as carried in a block body
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// Build a coinbase transaction with a single input and output
    pub fn coinbase(script_sig: Vec<u8>, value: i64, script_pubkey: Vec<u8>) -> Self {
        Self {
            version: 1,
            inputs: vec![TransactionInput {
                prev_tx_hash: BlockHash::zero(),
                prev_tx_index: COINBASE_OUTPUT_INDEX,
                script: script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput {
                value,
                script: script_pubkey,
            }],
            lock_time: 0,
        }
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_tx_hash.is_zero()
            && self.inputs[0].prev_tx_index == COINBASE_OUTPUT_INDEX
    }

    /// Sum of all output values
    pub fn total_output(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
