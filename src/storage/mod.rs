//! Storage module for header and body persistence

pub mod codec;
pub mod memory;
pub mod persistence;
pub mod store;

pub use codec::{JsonTxCodec, TxCodec};
pub use memory::{MemoryBodyStore, MemoryHeaderStore};
pub use persistence::{FileBodyStore, FileHeaderStore, StorageConfig};
pub use store::{BlockBodyStore, HeaderStore, StorageError};
