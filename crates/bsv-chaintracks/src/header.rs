//! Block header types and the fixed 80-byte header encoding.
//!
//! Wire layout: version (4 LE) | previous hash (32) | merkle root (32) |
//! time (4 LE) | bits (4 LE) | nonce (4 LE). Hashes are written in internal
//! order, which is the byte-reverse of their displayed hex.

use serde::{Deserialize, Serialize};

use crate::error::{ChaintracksError, Result};
use crate::hash::{double_hash, Hash, HASH_SIZE};
use crate::work::ChainWork;

/// Size of an encoded block header in bytes.
pub const HEADER_SIZE: usize = 80;

/// Local surrogate key of a header held in live storage.
pub type HeaderId = u64;

/// The six consensus fields of a block header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseBlockHeader {
    /// Block version.
    pub version: u32,
    /// Hash of the preceding block.
    pub previous_hash: Hash,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash,
    /// Block timestamp (seconds since the epoch).
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
}

impl BaseBlockHeader {
    /// Encode into the 80-byte wire format.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.previous_hash.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..72].copy_from_slice(&self.time.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Decode from exactly 80 bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() != HEADER_SIZE {
            return Err(ChaintracksError::InvalidHeader(format!(
                "header must be {} bytes, got {}",
                HEADER_SIZE,
                data.len()
            )));
        }
        Ok(BaseBlockHeader {
            version: read_u32_le(data, 0),
            previous_hash: Hash::from_slice(&data[4..4 + HASH_SIZE])?,
            merkle_root: Hash::from_slice(&data[36..36 + HASH_SIZE])?,
            time: read_u32_le(data, 68),
            bits: read_u32_le(data, 72),
            nonce: read_u32_le(data, 76),
        })
    }

    /// Double SHA-256 of the encoded header.
    pub fn hash(&self) -> Hash {
        double_hash(&self.to_bytes())
    }

    /// Work contributed by this header alone.
    pub fn work(&self) -> ChainWork {
        ChainWork::from_bits(self.bits)
    }

    /// True for a header with no predecessor (the all-zero previous hash).
    pub fn is_genesis_like(&self) -> bool {
        self.previous_hash.is_zero()
    }
}

fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

/// A header placed at a height in the chain, with its derived hash.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    /// Block version.
    pub version: u32,
    /// Hash of the preceding block.
    pub previous_hash: Hash,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash,
    /// Block timestamp.
    pub time: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
    /// Height in the chain.
    pub height: u32,
    /// Double SHA-256 of the encoded header.
    pub hash: Hash,
}

impl BlockHeader {
    /// Place a base header at `height`, deriving its hash.
    pub fn new(base: BaseBlockHeader, height: u32) -> Self {
        let hash = base.hash();
        BlockHeader {
            version: base.version,
            previous_hash: base.previous_hash,
            merkle_root: base.merkle_root,
            time: base.time,
            bits: base.bits,
            nonce: base.nonce,
            height,
            hash,
        }
    }

    /// Decode 80 bytes as the header at `height`.
    pub fn from_bytes(data: &[u8], height: u32) -> Result<Self> {
        Ok(Self::new(BaseBlockHeader::from_bytes(data)?, height))
    }

    /// The consensus fields alone.
    pub fn base(&self) -> BaseBlockHeader {
        BaseBlockHeader {
            version: self.version,
            previous_hash: self.previous_hash,
            merkle_root: self.merkle_root,
            time: self.time,
            bits: self.bits,
            nonce: self.nonce,
        }
    }

    /// Encode the consensus fields into the 80-byte wire format.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        self.base().to_bytes()
    }

    /// Check that the carried `hash` matches the encoded fields.
    ///
    /// Headers deserialized from untrusted JSON must pass this before use.
    pub fn has_valid_hash(&self) -> bool {
        self.base().hash() == self.hash
    }
}

/// A header held in live storage, with reorg bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveBlockHeader {
    /// The header itself.
    #[serde(flatten)]
    pub header: BlockHeader,
    /// Local surrogate key.
    pub header_id: HeaderId,
    /// Surrogate key of the predecessor, `None` for genesis or when the
    /// predecessor lives in bulk storage.
    pub previous_header_id: Option<HeaderId>,
    /// Cumulative work from genesis through this header.
    pub chain_work: ChainWork,
    /// On the chain currently believed heaviest.
    pub is_active: bool,
    /// Most recent header of its branch in live storage.
    pub is_chain_tip: bool,
}

/// Decode a buffer of concatenated 80-byte headers starting at `first_height`.
pub fn decode_headers(data: &[u8], first_height: u32) -> Result<Vec<BlockHeader>> {
    if data.len() % HEADER_SIZE != 0 {
        return Err(ChaintracksError::InvalidHeader(format!(
            "buffer length {} is not a multiple of {}",
            data.len(),
            HEADER_SIZE
        )));
    }
    data.chunks_exact(HEADER_SIZE)
        .enumerate()
        .map(|(i, chunk)| BlockHeader::from_bytes(chunk, first_height + i as u32))
        .collect()
}

/// Concatenate the 80-byte encodings of `headers`.
pub fn encode_headers(headers: &[BlockHeader]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(headers.len() * HEADER_SIZE);
    for header in headers {
        buf.extend_from_slice(&header.to_bytes());
    }
    buf
}

/// Mainnet genesis header.
pub fn mainnet_genesis() -> BlockHeader {
    BlockHeader::new(
        BaseBlockHeader {
            version: 1,
            previous_hash: Hash::ZERO,
            merkle_root: GENESIS_MERKLE_ROOT,
            time: 1231006505,
            bits: 0x1d00ffff,
            nonce: 2083236893,
        },
        0,
    )
}

/// Testnet genesis header.
pub fn testnet_genesis() -> BlockHeader {
    BlockHeader::new(
        BaseBlockHeader {
            version: 1,
            previous_hash: Hash::ZERO,
            merkle_root: GENESIS_MERKLE_ROOT,
            time: 1296688602,
            bits: 0x1d00ffff,
            nonce: 414098458,
        },
        0,
    )
}

/// Shared by mainnet and testnet genesis blocks (internal byte order).
const GENESIS_MERKLE_ROOT: Hash = Hash::new([
    0x3b, 0xa3, 0xed, 0xfd, 0x7a, 0x7b, 0x12, 0xb2,
    0x7a, 0xc7, 0x2c, 0x3e, 0x67, 0x76, 0x8f, 0x61,
    0x7f, 0xc8, 0x1b, 0xc3, 0x88, 0x8a, 0x51, 0x32,
    0x3a, 0x9f, 0xb8, 0xaa, 0x4b, 0x1e, 0x5e, 0x4a,
]);
