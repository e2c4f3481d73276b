//! Synthetic header chains for unit tests.

use crate::hash::{double_hash, Hash};
use crate::header::{BaseBlockHeader, BlockHeader};

/// Easiest regtest difficulty: each header adds 2 units of work.
pub(crate) const EASY_BITS: u32 = 0x207fffff;

/// Build a header on top of `prev` (or a genesis header when `None`).
pub(crate) fn next_header(prev: Option<&BlockHeader>, bits: u32, salt: u32) -> BlockHeader {
    let (previous_hash, height) = match prev {
        Some(p) => (p.hash, p.height + 1),
        None => (Hash::ZERO, 0),
    };
    let mut seed = height.to_le_bytes().to_vec();
    seed.extend_from_slice(&salt.to_le_bytes());
    BlockHeader::new(
        BaseBlockHeader {
            version: 1,
            previous_hash,
            merkle_root: double_hash(&seed),
            time: 1_600_000_000 + height * 600,
            bits,
            nonce: salt,
        },
        height,
    )
}

/// Extend `prev` by `count` headers, all with the same difficulty.
pub(crate) fn extend(prev: Option<&BlockHeader>, count: usize, bits: u32, salt: u32) -> Vec<BlockHeader> {
    let mut out: Vec<BlockHeader> = Vec::with_capacity(count);
    for _ in 0..count {
        let header = next_header(out.last().or(prev), bits, salt);
        out.push(header);
    }
    out
}

/// A chain of `count` headers from a fresh genesis.
pub(crate) fn chain(count: usize) -> Vec<BlockHeader> {
    extend(None, count, EASY_BITS, 0)
}
