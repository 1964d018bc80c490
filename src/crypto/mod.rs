//! Cryptographic utilities for the blockchain
//!
//! This module provides:
//! - SHA-256 hashing and wire checksums
//! - Compact proof-of-work targets

pub mod hash;
pub mod target;

pub use hash::{checksum, double_sha256, sha256};
pub use target::{Target, GENESIS_BITS};
