//! Proof-of-work targets
//!
//! A target is an unsigned 256-bit integer. Headers carry it in the 32-bit
//! "compact" form:
//!
//! ```text
//! | exponent: 8 bits [31-24] | sign: 1 bit [23] | mantissa: 23 bits [22-00] |
//! ```
//!
//! `N = (-1^sign) * mantissa * 256^(exponent - 3)`. Only non-negative values
//! that fit in 256 bits are usable as targets.

use std::fmt;

/// Compact bits of the main-network genesis block (difficulty 1)
pub const GENESIS_BITS: u32 = 0x1d00ffff;

/// A 256-bit unsigned integer stored big-endian
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Target([u8; 32]);

impl Target {
    /// Big-endian bytes of the target
    pub fn to_be_bytes(&self) -> [u8; 32] {
        self.0
    }

    /// Decode a compact representation.
    ///
    /// Returns `None` when the sign bit is set on a non-zero mantissa or when
    /// the value does not fit in 256 bits.
    pub fn from_compact(bits: u32) -> Option<Self> {
        let mut mantissa = bits & 0x007f_ffff;
        let negative = bits & 0x0080_0000 != 0;
        let exponent = (bits >> 24) as usize;

        if negative && mantissa != 0 {
            return None;
        }

        let mut out = [0u8; 32];

        if exponent <= 3 {
            mantissa >>= 8 * (3 - exponent);
            out[28..].copy_from_slice(&mantissa.to_be_bytes());
            return Some(Self(out));
        }

        // The exponent is the byte length of the number, so the mantissa's
        // three bytes end `exponent - 3` bytes above the least significant one.
        let mantissa_bytes = [(mantissa >> 16) as u8, (mantissa >> 8) as u8, mantissa as u8];
        for (i, byte) in mantissa_bytes.iter().enumerate() {
            let position = 32 + i as isize - exponent as isize;
            if position < 0 {
                if *byte != 0 {
                    return None;
                }
                continue;
            }
            out[position as usize] = *byte;
        }

        Some(Self(out))
    }

    /// Whether a hash in natural (little-endian) byte order is numerically
    /// at or below this target
    pub fn is_met_by(&self, hash_le: &[u8; 32]) -> bool {
        let mut hash_be = *hash_le;
        hash_be.reverse();
        hash_be <= self.0
    }

    /// Big-endian hex string of the full 256-bit value
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Target({})", self.to_hex())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
