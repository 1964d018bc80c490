//! Transaction body encoding
//!
//! Body files are written through a `TxCodec` so the on-disk format can be
//! swapped without touching the stores or the chain.

use crate::core::Transaction;
use crate::storage::store::StorageError;

/// Encode/decode contract for transaction bodies.
/// `decode(encode(txs))` must yield `txs`.
pub trait TxCodec: Send + Sync + 'static {
    fn encode(&self, transactions: &[Transaction]) -> Result<Vec<u8>, StorageError>;

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Transaction>, StorageError>;
}

/// JSON body encoding via serde
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTxCodec;

impl TxCodec for JsonTxCodec {
    fn encode(&self, transactions: &[Transaction]) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(transactions)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Vec<Transaction>, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Block;

    #[test]
    fn test_json_codec() {
        let codec = JsonTxCodec;
        let txs = Block::genesis().transactions.unwrap();
        let bytes = codec.encode(&txs).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), txs);
    }

    #[test]
    fn test_json_codec_rejects_garbage() {
        assert!(matches!(
            JsonTxCodec.decode(b"not json"),
            Err(StorageError::SerializationError(_))
        ));
    }
}
