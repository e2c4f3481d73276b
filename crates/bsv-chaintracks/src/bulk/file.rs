//! Bulk header file descriptors, the JSON manifest, and content validation.

use std::path::PathBuf;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{ChaintracksError, Result};
use crate::hash::{sha256, Hash};
use crate::header::{encode_headers, BaseBlockHeader, BlockHeader, HEADER_SIZE};
use crate::height_range::HeightRange;
use crate::work::ChainWork;

/// Descriptor of one immutable bulk file of concatenated headers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkHeaderFileInfo {
    /// File name, relative to the manifest's root folder.
    pub file_name: String,
    /// Height of the first header in the file.
    pub first_height: u32,
    /// Number of headers in the file.
    pub count: u32,
    /// Hash of the header preceding the first one (zero for genesis).
    pub prev_hash: Hash,
    /// Hash of the last header in the file.
    pub last_hash: Hash,
    /// Cumulative work up to and including the preceding header.
    pub prev_chain_work: ChainWork,
    /// Cumulative work through the last header in the file.
    pub last_chain_work: ChainWork,
    /// Base64 SHA-256 of the raw file content.
    pub file_hash: String,
}

impl BulkHeaderFileInfo {
    /// Describe `headers`, which must follow a header with cumulative work
    /// `prev_chain_work`, and return the descriptor with the raw content.
    pub fn from_headers(
        file_name: String,
        headers: &[BlockHeader],
        prev_chain_work: &ChainWork,
    ) -> Result<(Self, Vec<u8>)> {
        let (first, last) = match (headers.first(), headers.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(ChaintracksError::BulkAppend(format!(
                    "{}: no headers to describe",
                    file_name
                )))
            }
        };
        let mut work = prev_chain_work.clone();
        for header in headers {
            work = &work + &ChainWork::from_bits(header.bits);
        }
        let data = encode_headers(headers);
        let info = BulkHeaderFileInfo {
            file_name,
            first_height: first.height,
            count: headers.len() as u32,
            prev_hash: first.previous_hash,
            last_hash: last.hash,
            prev_chain_work: prev_chain_work.clone(),
            last_chain_work: work,
            file_hash: file_content_hash(&data),
        };
        Ok((info, data))
    }

    /// Heights covered by this file.
    pub fn range(&self) -> HeightRange {
        HeightRange::from_count(self.first_height, self.count)
    }

    /// Height of the last header in this file.
    pub fn last_height(&self) -> u32 {
        self.first_height + self.count.saturating_sub(1)
    }

    /// Check that this file directly follows `prev` in the chain of files.
    pub fn extends(&self, prev: Option<&BulkHeaderFileInfo>) -> Result<()> {
        match prev {
            None => {
                if self.first_height != 0 || !self.prev_hash.is_zero() || !self.prev_chain_work.is_zero() {
                    return Err(ChaintracksError::BulkAppend(format!(
                        "{}: first bulk file must start at genesis, starts at {}",
                        self.file_name, self.first_height
                    )));
                }
            }
            Some(prev) => {
                if self.first_height != prev.last_height() + 1 {
                    return Err(ChaintracksError::BulkAppend(format!(
                        "{}: first height {} does not follow {} ending at {}",
                        self.file_name,
                        self.first_height,
                        prev.file_name,
                        prev.last_height()
                    )));
                }
                if self.prev_hash != prev.last_hash {
                    return Err(ChaintracksError::BulkAppend(format!(
                        "{}: prev hash {} does not match {} last hash {}",
                        self.file_name, self.prev_hash, prev.file_name, prev.last_hash
                    )));
                }
                if self.prev_chain_work != prev.last_chain_work {
                    return Err(ChaintracksError::BulkAppend(format!(
                        "{}: prev chain work does not match {}",
                        self.file_name, prev.file_name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// The JSON manifest listing a published set of bulk files.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkHeaderFilesManifest {
    /// Folder (or base URL) holding the files.
    pub root_folder: String,
    /// Name of this manifest within the root folder.
    pub json_filename: String,
    /// Files in height order.
    pub files: Vec<BulkHeaderFileInfo>,
}

impl BulkHeaderFilesManifest {
    /// Heights covered by every file in the manifest.
    pub fn range(&self) -> HeightRange {
        match (self.files.first(), self.files.last()) {
            (Some(first), Some(last)) => HeightRange::new(first.first_height, last.last_height()),
            _ => HeightRange::empty(),
        }
    }
}

/// Where a bulk file's bytes come from.
#[derive(Clone, Debug)]
pub enum BulkFileSource {
    /// Fetched over HTTP from this URL.
    Remote(String),
    /// Read from this local path.
    Local(PathBuf),
    /// Held in memory.
    Inline(Arc<Vec<u8>>),
}

impl BulkFileSource {
    /// True for sources derived locally from migrated live headers.
    pub fn is_derived(&self) -> bool {
        !matches!(self, BulkFileSource::Remote(_))
    }
}

/// Base64 SHA-256 of bulk file content.
pub fn file_content_hash(data: &[u8]) -> String {
    BASE64.encode(sha256(data))
}

/// Verify `data` against its descriptor: length, content hash, the hash
/// chain through every embedded header, and the recorded chain work.
pub fn validate_file_data(info: &BulkHeaderFileInfo, data: &[u8]) -> Result<()> {
    let invalid = |reason: String| ChaintracksError::BulkFileInvalid {
        file_name: info.file_name.clone(),
        reason,
    };

    if data.len() != info.count as usize * HEADER_SIZE {
        return Err(invalid(format!(
            "expected {} bytes for {} headers, got {}",
            info.count as usize * HEADER_SIZE,
            info.count,
            data.len()
        )));
    }

    let actual = file_content_hash(data);
    if actual != info.file_hash {
        return Err(ChaintracksError::BulkFileHashMismatch {
            file_name: info.file_name.clone(),
            expected: info.file_hash.clone(),
            actual,
        });
    }

    let mut prev_hash = info.prev_hash;
    let mut work = info.prev_chain_work.clone();
    for (i, chunk) in data.chunks_exact(HEADER_SIZE).enumerate() {
        let header = BaseBlockHeader::from_bytes(chunk)?;
        if header.previous_hash != prev_hash {
            return Err(invalid(format!(
                "header at height {} does not link to {}",
                info.first_height + i as u32,
                prev_hash
            )));
        }
        prev_hash = header.hash();
        work = &work + &header.work();
    }

    if prev_hash != info.last_hash {
        return Err(invalid(format!(
            "last hash {} does not match recorded {}",
            prev_hash, info.last_hash
        )));
    }
    if work != info.last_chain_work {
        return Err(invalid(format!(
            "chain work {} does not match recorded {}",
            work, info.last_chain_work
        )));
    }
    Ok(())
}

/// Choose among candidate branches that all follow the header `prev_hash`.
///
/// Work is summed strictly within each candidate. The heaviest wins; on
/// equal work the earlier candidate is kept. Candidates that are empty or
/// do not form a hash chain from `prev_hash` are ignored.
///
/// # Returns
/// The index of the winning candidate, if any is usable.
pub fn select_heaviest_branch(candidates: &[Vec<BlockHeader>], prev_hash: &Hash) -> Option<usize> {
    let mut best: Option<(usize, ChainWork)> = None;
    for (i, branch) in candidates.iter().enumerate() {
        if !is_linked_branch(branch, prev_hash) {
            tracing::debug!("ignoring unlinked candidate branch {}", i);
            continue;
        }
        let work = branch
            .iter()
            .fold(ChainWork::zero(), |acc, h| &acc + &ChainWork::from_bits(h.bits));
        let better = match &best {
            Some((_, best_work)) => work > *best_work,
            None => true,
        };
        if better {
            best = Some((i, work));
        }
    }
    best.map(|(i, _)| i)
}

fn is_linked_branch(branch: &[BlockHeader], prev_hash: &Hash) -> bool {
    let Some(first) = branch.first() else {
        return false;
    };
    if first.previous_hash != *prev_hash || !first.has_valid_hash() {
        return false;
    }
    branch
        .windows(2)
        .all(|w| w[1].previous_hash == w[0].hash && w[1].height == w[0].height + 1 && w[1].has_valid_hash())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{chain, extend, EASY_BITS};

    fn describe(headers: &[BlockHeader]) -> (BulkHeaderFileInfo, Vec<u8>) {
        BulkHeaderFileInfo::from_headers("test.headers".to_string(), headers, &ChainWork::zero())
            .unwrap()
    }

    #[test]
    fn test_from_headers_describes_content() {
        let headers = chain(10);
        let (info, data) = describe(&headers);
        assert_eq!(info.first_height, 0);
        assert_eq!(info.count, 10);
        assert_eq!(info.last_height(), 9);
        assert_eq!(info.last_hash, headers[9].hash);
        assert!(info.prev_hash.is_zero());
        assert_eq!(info.last_chain_work, ChainWork::from_hex("14").unwrap());
        assert_eq!(data.len(), 800);
        validate_file_data(&info, &data).unwrap();
        info.extends(None).unwrap();
    }

    #[test]
    fn test_tampered_content_reports_hash_mismatch() {
        let (info, mut data) = describe(&chain(5));
        data[100] ^= 0xff;
        match validate_file_data(&info, &data) {
            Err(ChaintracksError::BulkFileHashMismatch { file_name, expected, actual }) => {
                assert_eq!(file_name, "test.headers");
                assert_eq!(expected, info.file_hash);
                assert_ne!(actual, expected);
            }
            other => panic!("expected hash mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_broken_chain_detected_even_with_matching_hash() {
        let mut headers = chain(5);
        headers.swap(2, 3);
        let data = encode_headers(&headers);
        let (mut info, _) = describe(&chain(5));
        info.file_hash = file_content_hash(&data);
        assert!(matches!(
            validate_file_data(&info, &data),
            Err(ChaintracksError::BulkFileInvalid { .. })
        ));
    }

    #[test]
    fn test_wrong_recorded_work_detected() {
        let (mut info, data) = describe(&chain(5));
        info.last_chain_work = ChainWork::from_hex("ff").unwrap();
        assert!(validate_file_data(&info, &data).is_err());
    }

    #[test]
    fn test_extends_chain_of_files() {
        let headers = chain(20);
        let (a, _) = describe(&headers[..10]);
        let (b, _) = BulkHeaderFileInfo::from_headers(
            "b".to_string(),
            &headers[10..],
            &a.last_chain_work,
        )
        .unwrap();
        b.extends(Some(&a)).unwrap();
        assert!(b.extends(None).is_err());
        assert!(a.extends(Some(&b)).is_err());
    }

    #[test]
    fn test_select_heaviest_branch() {
        let base = chain(3);
        let tip = &base[2];
        let short_heavy = extend(Some(tip), 1, 0x1f00ffff, 1);
        let long_light = extend(Some(tip), 3, EASY_BITS, 2);
        let unlinked = extend(Some(&base[1]), 5, 0x1e00ffff, 3);
        let candidates = vec![long_light.clone(), short_heavy, unlinked];
        assert_eq!(select_heaviest_branch(&candidates, &tip.hash), Some(1));

        // equal work: first seen wins
        let twin = extend(Some(tip), 3, EASY_BITS, 4);
        assert_eq!(select_heaviest_branch(&[long_light, twin], &tip.hash), Some(0));
        assert_eq!(select_heaviest_branch(&[], &tip.hash), None);
    }

    #[test]
    fn test_manifest_json_shape() {
        let (info, _) = describe(&chain(2));
        let manifest = BulkHeaderFilesManifest {
            root_folder: "https://cdn.example.com/headers".to_string(),
            json_filename: "mainNetBlockHeaders.json".to_string(),
            files: vec![info],
        };
        let json = serde_json::to_value(&manifest).unwrap();
        assert!(json.get("rootFolder").is_some());
        assert!(json["files"][0].get("prevChainWork").is_some());
        assert_eq!(json["files"][0]["firstHeight"], 0);
        let back: BulkHeaderFilesManifest = serde_json::from_value(json).unwrap();
        assert_eq!(back, manifest);
        assert_eq!(back.range(), HeightRange::new(0, 1));
    }
}
