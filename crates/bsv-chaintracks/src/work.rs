//! Cumulative chain work arithmetic.
//!
//! Work for a single header is derived from its compact difficulty `bits`
//! as `2^256 / (target + 1)`. Cumulative work is carried as a 256-bit
//! unsigned value and serialized as 64 hex characters.

use std::fmt;
use std::ops::Add;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ChaintracksError, Result};

/// Number of hex characters in a serialized chain work value.
pub const CHAIN_WORK_HEX_LEN: usize = 64;

/// Cumulative proof-of-work, a 256-bit unsigned integer.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChainWork(BigUint);

impl ChainWork {
    /// Zero work.
    pub fn zero() -> Self {
        ChainWork(BigUint::zero())
    }

    /// Work contributed by a single header with compact difficulty `bits`.
    pub fn from_bits(bits: u32) -> Self {
        work_from_bits(bits)
    }

    /// Parse a hex string of at most 64 characters.
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.is_empty() || hex_str.len() > CHAIN_WORK_HEX_LEN {
            return Err(ChaintracksError::InvalidChainWork(format!(
                "expected 1..={} hex characters, got {}",
                CHAIN_WORK_HEX_LEN,
                hex_str.len()
            )));
        }
        BigUint::parse_bytes(hex_str.as_bytes(), 16)
            .map(ChainWork)
            .ok_or_else(|| ChaintracksError::InvalidChainWork(hex_str.to_string()))
    }

    /// Zero-padded 64 character hex encoding.
    pub fn to_hex(&self) -> String {
        format!("{:0>width$}", self.0.to_str_radix(16), width = CHAIN_WORK_HEX_LEN)
    }

    /// True when no work has been accumulated.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl Add<&ChainWork> for &ChainWork {
    type Output = ChainWork;

    fn add(self, rhs: &ChainWork) -> ChainWork {
        ChainWork(&self.0 + &rhs.0)
    }
}

impl Add for ChainWork {
    type Output = ChainWork;

    fn add(self, rhs: ChainWork) -> ChainWork {
        ChainWork(self.0 + rhs.0)
    }
}

impl fmt::Display for ChainWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ChainWork {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ChainWork {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ChainWork::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Expand compact `bits` into the full 256-bit target.
///
/// Negative encodings (sign bit set) yield a zero target.
pub fn target_from_bits(bits: u32) -> BigUint {
    let exponent = bits >> 24;
    let mantissa = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 {
        return BigUint::zero();
    }
    if exponent <= 3 {
        BigUint::from(mantissa >> (8 * (3 - exponent)))
    } else {
        BigUint::from(mantissa) << (8 * (exponent - 3))
    }
}

/// Work represented by a header with compact difficulty `bits`.
pub fn work_from_bits(bits: u32) -> ChainWork {
    let target = target_from_bits(bits);
    if target.is_zero() {
        return ChainWork::zero();
    }
    let numerator: BigUint = BigUint::one() << 256u32;
    ChainWork(numerator / (target + 1u32))
}
