//! Radix index from 32-byte keys (block hash or merkle root) to heights.
//!
//! Each level takes one byte of the key, shifted right by a per-level
//! amount, to pick one of up to 256 sub-bins. The levels are folded into a
//! single terminal bin number, so a lookup is a handful of multiplies plus
//! a linear scan of one bin. The schedule is picked so terminal bins hold
//! about [`TARGET_BIN_SIZE`] entries.
//!
//! Serialized layout (all integers little-endian):
//!
//! ```text
//! magic "HIDX" | version u32 | kind u32 | min height u32 | max height u32 |
//! level count u32 | (byte index u8, shift u8) per level | bin count u32 |
//! (bin count + 1) u32 entry offsets | entries (32-byte key + u32 height)
//! ```
//!
//! The index is derived data. It is always rebuildable from bulk headers.

use crate::error::{ChaintracksError, Result};
use crate::hash::{double_hash, Hash, HASH_SIZE};
use crate::header::HEADER_SIZE;
use crate::height_range::HeightRange;

/// Serialization format version.
pub const HASH_INDEX_VERSION: u32 = 1;

/// Desired average number of entries per terminal bin.
pub const TARGET_BIN_SIZE: usize = 8;

const MAGIC: &[u8; 4] = b"HIDX";
const ENTRY_SIZE: usize = HASH_SIZE + 4;
const MAX_INDEX_BITS: u32 = 24;

/// Which 32-byte field of a header is used as the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HashIndexKind {
    /// Index by block hash.
    BlockHash,
    /// Index by merkle root.
    MerkleRoot,
}

impl HashIndexKind {
    fn code(self) -> u32 {
        match self {
            HashIndexKind::BlockHash => 1,
            HashIndexKind::MerkleRoot => 2,
        }
    }

    fn from_code(code: u32) -> Result<Self> {
        match code {
            1 => Ok(HashIndexKind::BlockHash),
            2 => Ok(HashIndexKind::MerkleRoot),
            other => Err(ChaintracksError::HashIndex(format!("unknown index kind {}", other))),
        }
    }

    /// Extract this kind's key from an encoded 80-byte header.
    pub fn key_of(self, header: &[u8]) -> [u8; HASH_SIZE] {
        match self {
            HashIndexKind::BlockHash => *double_hash(header).as_bytes(),
            HashIndexKind::MerkleRoot => {
                let mut key = [0u8; HASH_SIZE];
                key.copy_from_slice(&header[36..36 + HASH_SIZE]);
                key
            }
        }
    }
}

/// One radix level: which key byte to read and how far to shift it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexLevel {
    /// Byte of the key (internal order) examined at this level.
    pub byte_index: u8,
    /// Right shift applied to that byte; the level has `256 >> shift` bins.
    pub shift: u8,
}

impl IndexLevel {
    fn bins(&self) -> usize {
        256usize >> self.shift
    }
}

/// A built radix index over a contiguous range of bulk headers.
#[derive(Clone, Debug)]
pub struct HashIndex {
    kind: HashIndexKind,
    range: HeightRange,
    levels: Vec<IndexLevel>,
    offsets: Vec<u32>,
    entries: Vec<u8>,
}

/// Pick a level schedule so `entry_count` keys spread over bins of about
/// [`TARGET_BIN_SIZE`] entries.
pub fn schedule_for(entry_count: usize) -> Vec<IndexLevel> {
    let wanted_bins = (entry_count / TARGET_BIN_SIZE).max(1);
    let mut bits = (usize::BITS - (wanted_bins - 1).leading_zeros()).min(MAX_INDEX_BITS);
    let mut levels = Vec::new();
    let mut byte_index = 0u8;
    while bits > 0 {
        let take = bits.min(8);
        levels.push(IndexLevel { byte_index, shift: (8 - take) as u8 });
        bits -= take;
        byte_index += 1;
    }
    levels
}

fn bin_of(levels: &[IndexLevel], key: &[u8]) -> usize {
    levels
        .iter()
        .fold(0usize, |bin, l| bin * l.bins() + (key[l.byte_index as usize] >> l.shift) as usize)
}

impl HashIndex {
    /// Build an index over buffers of concatenated 80-byte headers.
    ///
    /// `buffers` must be contiguous in height, the first header of the first
    /// buffer being at `first_height`.
    pub fn build(kind: HashIndexKind, first_height: u32, buffers: &[&[u8]]) -> Result<Self> {
        let mut keyed: Vec<(usize, [u8; HASH_SIZE], u32)> = Vec::new();
        let total: usize = buffers.iter().map(|b| b.len() / HEADER_SIZE).sum();
        let levels = schedule_for(total);
        let mut height = first_height;
        for buffer in buffers {
            if buffer.len() % HEADER_SIZE != 0 {
                return Err(ChaintracksError::HashIndex(format!(
                    "buffer length {} is not a multiple of {}",
                    buffer.len(),
                    HEADER_SIZE
                )));
            }
            for chunk in buffer.chunks_exact(HEADER_SIZE) {
                let key = kind.key_of(chunk);
                keyed.push((bin_of(&levels, &key), key, height));
                height += 1;
            }
        }

        let bin_count: usize = levels.iter().map(IndexLevel::bins).product();
        let mut offsets = vec![0u32; bin_count + 1];
        for (bin, _, _) in &keyed {
            offsets[bin + 1] += 1;
        }
        for i in 0..bin_count {
            offsets[i + 1] += offsets[i];
        }

        let mut cursor: Vec<u32> = offsets[..bin_count].to_vec();
        let mut entries = vec![0u8; keyed.len() * ENTRY_SIZE];
        for (bin, key, height) in keyed {
            let at = cursor[bin] as usize * ENTRY_SIZE;
            entries[at..at + HASH_SIZE].copy_from_slice(&key);
            entries[at + HASH_SIZE..at + ENTRY_SIZE].copy_from_slice(&height.to_le_bytes());
            cursor[bin] += 1;
        }

        tracing::debug!(
            "built {:?} index over {} headers, {} levels, {} bins",
            kind,
            total,
            levels.len(),
            bin_count
        );

        Ok(HashIndex {
            kind,
            range: HeightRange::from_count(first_height, total as u32),
            levels,
            offsets,
            entries,
        })
    }

    /// Height recorded for `key`, or `None` if it is not indexed.
    pub fn find_height(&self, key: &Hash) -> Option<u32> {
        let bin = bin_of(&self.levels, key.as_bytes());
        let start = self.offsets[bin] as usize;
        let end = self.offsets[bin + 1] as usize;
        self.entries[start * ENTRY_SIZE..end * ENTRY_SIZE]
            .chunks_exact(ENTRY_SIZE)
            .find(|entry| &entry[..HASH_SIZE] == key.as_bytes())
            .map(|entry| {
                let h = &entry[HASH_SIZE..];
                u32::from_le_bytes([h[0], h[1], h[2], h[3]])
            })
    }

    /// Key kind this index was built for.
    pub fn kind(&self) -> HashIndexKind {
        self.kind
    }

    /// Heights covered by the index.
    pub fn range(&self) -> HeightRange {
        self.range
    }

    /// The radix schedule in use.
    pub fn levels(&self) -> &[IndexLevel] {
        &self.levels
    }

    /// Number of indexed keys.
    pub fn len(&self) -> usize {
        self.entries.len() / ENTRY_SIZE
    }

    /// True if nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize into the flat buffer layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let range = self.range;
        let mut buf = Vec::with_capacity(
            32 + self.levels.len() * 2 + self.offsets.len() * 4 + self.entries.len(),
        );
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&HASH_INDEX_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.kind.code().to_le_bytes());
        buf.extend_from_slice(&range.min_height.to_le_bytes());
        buf.extend_from_slice(&range.max_height.to_le_bytes());
        buf.extend_from_slice(&(self.levels.len() as u32).to_le_bytes());
        for level in &self.levels {
            buf.push(level.byte_index);
            buf.push(level.shift);
        }
        buf.extend_from_slice(&((self.offsets.len() - 1) as u32).to_le_bytes());
        for offset in &self.offsets {
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        buf.extend_from_slice(&self.entries);
        buf
    }

    /// Parse and sanity-check a serialized index.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = IndexReader::new(data);
        if r.read_bytes(4)? != MAGIC {
            return Err(ChaintracksError::HashIndex("bad magic".to_string()));
        }
        let version = r.read_u32()?;
        if version != HASH_INDEX_VERSION {
            return Err(ChaintracksError::HashIndex(format!("unsupported version {}", version)));
        }
        let kind = HashIndexKind::from_code(r.read_u32()?)?;
        let range = HeightRange::new(r.read_u32()?, r.read_u32()?);
        let level_count = r.read_u32()?;
        if level_count > 4 {
            return Err(ChaintracksError::HashIndex(format!("too many levels: {}", level_count)));
        }
        let mut levels = Vec::with_capacity(level_count as usize);
        for _ in 0..level_count {
            let byte_index = r.read_u8()?;
            let shift = r.read_u8()?;
            if byte_index as usize >= HASH_SIZE || shift > 7 {
                return Err(ChaintracksError::HashIndex(format!(
                    "invalid level byte {} shift {}",
                    byte_index, shift
                )));
            }
            levels.push(IndexLevel { byte_index, shift });
        }
        let bin_count = r.read_u32()? as usize;
        let expected_bins: usize = levels.iter().map(IndexLevel::bins).product();
        if bin_count != expected_bins {
            return Err(ChaintracksError::HashIndex(format!(
                "bin count {} does not match schedule ({})",
                bin_count, expected_bins
            )));
        }
        let mut offsets = Vec::with_capacity(bin_count + 1);
        for _ in 0..=bin_count {
            offsets.push(r.read_u32()?);
        }
        if offsets.windows(2).any(|w| w[1] < w[0]) || offsets[0] != 0 {
            return Err(ChaintracksError::HashIndex("offsets not monotonic".to_string()));
        }
        let entry_count = offsets[bin_count] as usize;
        if r.remaining() != entry_count * ENTRY_SIZE || entry_count != range.length() as usize {
            return Err(ChaintracksError::HashIndex(format!(
                "expected {} entries covering {}, found {} bytes",
                entry_count,
                range,
                r.remaining()
            )));
        }
        let entries = r.read_bytes(entry_count * ENTRY_SIZE)?.to_vec();
        Ok(HashIndex { kind, range, levels, offsets, entries })
    }
}

/// Bounds-checked little-endian reader over a serialized index.
struct IndexReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> IndexReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        IndexReader { data, pos: 0 }
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(ChaintracksError::HashIndex("unexpected end of data".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}
