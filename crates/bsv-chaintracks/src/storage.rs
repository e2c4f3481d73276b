//! Two-tier header storage: a live window over an append-only bulk archive.
//!
//! The engine owns both tiers and keeps their ranges gap-free: either
//! both are empty, or bulk starts at genesis and live (when non-empty)
//! starts one past the bulk tip. Headers move from live to bulk in
//! chunks once they fall far enough below the active tip.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::bulk::{
    BulkArchive, BulkFileFetcher, BulkFileSource, BulkHeaderFileInfo, BulkHeaderFilesManifest, BulkTip,
};
use crate::error::{ChaintracksError, Result};
use crate::hash::Hash;
use crate::hash_index::{HashIndex, HashIndexKind};
use crate::header::{encode_headers, BlockHeader, LiveBlockHeader};
use crate::height_range::HeightRange;
use crate::live::{InsertHeaderResult, LiveHeaderStore};
use crate::options::StorageOptions;

/// Storage shared between the orchestrator and ingestors.
///
/// Writers (insertion, migration, bulk append) take the write lock;
/// queries share the read lock.
pub type SharedStorage = Arc<RwLock<StorageEngine>>;

#[derive(Debug, Default)]
struct IndexCache {
    block_hash: Option<Arc<HashIndex>>,
    merkle_root: Option<Arc<HashIndex>>,
}

/// The tiered header store.
#[derive(Debug)]
pub struct StorageEngine {
    options: StorageOptions,
    live: LiveHeaderStore,
    bulk: BulkArchive,
    indexes: Mutex<IndexCache>,
}

impl StorageEngine {
    /// Create an empty engine.
    pub fn new(options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let bulk = BulkArchive::new(&options);
        Ok(StorageEngine {
            options,
            live: LiveHeaderStore::new(),
            bulk,
            indexes: Mutex::new(IndexCache::default()),
        })
    }

    /// Wrap `self` for sharing.
    pub fn into_shared(self) -> SharedStorage {
        Arc::new(RwLock::new(self))
    }

    /// Reload bulk files previously derived into the bulk folder.
    pub async fn restore(&mut self) -> Result<()> {
        if !self.live.is_empty() {
            return Err(ChaintracksError::StorageInvariant(
                "cannot restore bulk files beneath existing live headers".into(),
            ));
        }
        self.bulk.restore_local().await?;
        Ok(())
    }

    /// Use `fetcher` for remote bulk file content.
    pub fn set_bulk_fetcher(&mut self, fetcher: Arc<dyn BulkFileFetcher>) {
        self.bulk.set_fetcher(fetcher);
    }

    /// The engine's options.
    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    /// Read access to the live tier.
    pub fn live(&self) -> &LiveHeaderStore {
        &self.live
    }

    /// Read access to the bulk tier.
    pub fn bulk(&self) -> &BulkArchive {
        &self.bulk
    }

    /// The most recent archived header.
    pub fn bulk_tip(&self) -> Option<&BulkTip> {
        self.bulk.tip()
    }

    /// Heights covered by bulk storage.
    pub fn bulk_range(&self) -> HeightRange {
        self.bulk.height_range()
    }

    /// Heights spanned by live storage.
    pub fn live_range(&self) -> HeightRange {
        self.live.height_range()
    }

    /// Heights of the active chain across both tiers.
    pub fn available_range(&self) -> HeightRange {
        match self.find_chain_tip_header() {
            Some(tip) => HeightRange::new(0, tip.height),
            None => HeightRange::empty(),
        }
    }

    /// Insert one header into live storage, migrating old headers to bulk
    /// when it becomes the active tip.
    ///
    /// # Returns
    /// [`ChaintracksError::MigrationFailed`] when the header was stored but
    /// the migration after it failed; the error carries the insert result.
    pub async fn insert_header(&mut self, header: &BlockHeader) -> Result<InsertHeaderResult> {
        if let Some(tip) = self.bulk.tip() {
            if header.height <= tip.header.height {
                let mut result = InsertHeaderResult::default();
                match self.bulk.find_header_for_height(header.height).await? {
                    Some(archived) if archived.hash == header.hash => result.dupe = true,
                    _ => {
                        tracing::warn!(
                            "header {} at archived height {} conflicts with bulk storage",
                            header.hash,
                            header.height
                        );
                        result.no_active_ancestor = true;
                    }
                }
                return Ok(result);
            }
        }

        let result = self.live.insert_header(header, self.bulk.tip());
        if result.added && result.is_active_tip {
            if let Err(e) = self.prune().await {
                tracing::error!("migration after header {} at height {} failed: {}", header.hash, header.height, e);
                return Err(ChaintracksError::MigrationFailed {
                    hash: header.hash,
                    result: Box::new(result),
                    source: Box::new(e),
                });
            }
        }
        Ok(result)
    }

    /// Append headers known to extend the active tip without competition.
    pub async fn batch_insert_headers(&mut self, headers: &[BlockHeader]) -> Result<()> {
        self.live.batch_insert_headers(headers, self.bulk.tip())?;
        self.prune().await
    }

    /// Append a published bulk file.
    ///
    /// Allowed only while live storage is empty, or when the file ends
    /// directly beneath the live window.
    pub async fn append_bulk_file(&mut self, info: BulkHeaderFileInfo, source: BulkFileSource) -> Result<()> {
        let live = self.live.height_range();
        if !live.is_empty() {
            let bottom = self.live.find_active_at_height(live.min_height);
            let fits = info.last_height() + 1 == live.min_height
                && bottom.is_some_and(|b| b.header.previous_hash == info.last_hash);
            if !fits {
                return Err(ChaintracksError::StorageInvariant(format!(
                    "bulk file {} covering {} does not end beneath live range {}",
                    info.file_name,
                    info.range(),
                    live
                )));
            }
        }
        self.bulk.append_file(info, source).await?;
        self.check_invariant()
    }

    /// Archive the heaviest of several competing branches offered for the
    /// heights directly above bulk storage.
    ///
    /// For bulk ingestors reconciling sources that disagree near the bulk
    /// boundary. Allowed only while live storage is empty.
    ///
    /// # Returns
    /// The index of the archived candidate, or `None` if none extends the bulk tip.
    pub async fn append_bulk_branches(&mut self, candidates: &[Vec<BlockHeader>]) -> Result<Option<usize>> {
        if !self.live.is_empty() {
            return Err(ChaintracksError::StorageInvariant(format!(
                "cannot archive competing branches beneath live range {}",
                self.live.height_range()
            )));
        }
        let chosen = self.bulk.append_best_branch(candidates).await?;
        if let Some(index) = chosen {
            tracing::info!(
                "archived branch {} of {} candidates, bulk now {}",
                index,
                candidates.len(),
                self.bulk.height_range()
            );
        }
        self.check_invariant()?;
        Ok(chosen)
    }

    /// Move headers from live to bulk while the live window exceeds the
    /// configured threshold by at least one migration chunk.
    pub async fn prune(&mut self) -> Result<()> {
        loop {
            let Some(tip) = self.live.active_tip() else {
                return Ok(());
            };
            let live = self.live.height_range();
            let span = (tip.header.height - live.min_height + 1) as i64;
            let excess = span - self.options.live_height_threshold as i64;
            if excess < self.options.bulk_migration_chunk_size as i64 {
                return Ok(());
            }

            let chunk = self.live.oldest_active(self.options.bulk_migration_chunk_size as usize);
            let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
                return Ok(());
            };
            let expected = self.bulk.tip().map_or(0, |t| t.header.height + 1);
            if first.height != expected || first.height != live.min_height {
                return Err(ChaintracksError::StorageInvariant(format!(
                    "oldest active live header at {} cannot migrate onto bulk ending before {}",
                    first.height, expected
                )));
            }
            let last_height = last.height;
            self.bulk.append_headers(&chunk).await?;
            let removed = self.live.remove_through_height(last_height);
            tracing::debug!(
                "migrated {} headers through height {} to bulk, dropped {} inactive",
                chunk.len(),
                last_height,
                removed - chunk.len()
            );
            self.check_invariant()?;
        }
    }

    /// Verify bulk and live ranges are gap-free.
    pub fn check_invariant(&self) -> Result<()> {
        let bulk = self.bulk.height_range();
        let live = self.live.height_range();
        if bulk.is_empty() {
            if !live.is_empty() && live.min_height != 0 {
                return Err(ChaintracksError::StorageInvariant(format!(
                    "bulk is empty but live starts at {}",
                    live.min_height
                )));
            }
            return Ok(());
        }
        if bulk.min_height != 0 {
            return Err(ChaintracksError::StorageInvariant(format!("bulk starts at {}", bulk.min_height)));
        }
        if !live.is_empty() && live.min_height != bulk.max_height + 1 {
            return Err(ChaintracksError::StorageInvariant(format!(
                "live range {} does not follow bulk range {}",
                live, bulk
            )));
        }
        Ok(())
    }

    /// The active header at `height` from either tier.
    pub async fn find_header_for_height(&self, height: u32) -> Result<Option<BlockHeader>> {
        if self.bulk.height_range().contains(height) {
            return self.bulk.find_header_for_height(height).await;
        }
        Ok(self.live.find_active_at_height(height).map(|h| h.header.clone()))
    }

    /// The active chain tip: the live tip, or the bulk tip when live is empty.
    pub fn find_chain_tip_header(&self) -> Option<BlockHeader> {
        match self.live.active_tip() {
            Some(tip) => Some(tip.header.clone()),
            None => self.bulk.tip().map(|t| t.header.clone()),
        }
    }

    /// Hash of the active chain tip.
    pub fn find_chain_tip_hash(&self) -> Option<Hash> {
        self.find_chain_tip_header().map(|h| h.hash)
    }

    /// The live header with `hash`, active or not.
    pub fn find_live_header_for_block_hash(&self, hash: &Hash) -> Option<LiveBlockHeader> {
        self.live.find_by_hash(hash).cloned()
    }

    /// The header with `hash` from live storage or the bulk index.
    pub async fn find_header_for_block_hash(&self, hash: &Hash) -> Result<Option<BlockHeader>> {
        if let Some(live) = self.live.find_by_hash(hash) {
            return Ok(Some(live.header.clone()));
        }
        self.find_bulk_by_key(HashIndexKind::BlockHash, hash).await
    }

    /// The active header whose merkle root is `root`.
    pub async fn find_header_for_merkle_root(&self, root: &Hash) -> Result<Option<BlockHeader>> {
        if let Some(live) = self.live.find_active_by_merkle_root(root) {
            return Ok(Some(live.header.clone()));
        }
        self.find_bulk_by_key(HashIndexKind::MerkleRoot, root).await
    }

    /// True when the active header at `height` has merkle root `root`.
    pub async fn is_valid_root_for_height(&self, root: &Hash, height: u32) -> Result<bool> {
        Ok(self
            .find_header_for_height(height)
            .await?
            .is_some_and(|h| h.merkle_root == *root))
    }

    /// Raw concatenated active headers for up to `count` heights from `height`.
    pub async fn get_headers(&self, height: u32, count: u32) -> Result<Vec<u8>> {
        let wanted = HeightRange::from_count(height, count).intersect(&self.available_range());
        if wanted.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = self.bulk.get_headers_bytes(wanted.min_height, wanted.length()).await?;
        let live_part = wanted.intersect(&self.live.height_range());
        out.extend_from_slice(&encode_headers(&self.live.active_headers(&live_part)));
        Ok(out)
    }

    /// Active live headers in height order.
    pub fn live_active_headers(&self) -> Vec<BlockHeader> {
        self.live.active_headers(&self.live.height_range())
    }

    /// Full integrity check of both tiers and their boundary.
    pub async fn validate(&self) -> Result<()> {
        self.bulk.validate().await?;
        self.live.validate(self.bulk.tip())?;
        self.check_invariant()?;
        if self.options.check_genesis {
            let expected = self.options.chain.genesis_header();
            match self.find_header_for_height(0).await? {
                Some(genesis) if genesis.hash != expected.hash => {
                    return Err(ChaintracksError::StorageInvariant(format!(
                        "height 0 is {} but {} genesis is {}",
                        genesis.hash, self.options.chain, expected.hash
                    )));
                }
                _ => {}
            }
        }
        for kind in [HashIndexKind::BlockHash, HashIndexKind::MerkleRoot] {
            self.bulk_index(kind).await?;
        }
        Ok(())
    }

    /// Describe the bulk tier as a publishable manifest.
    pub fn bulk_manifest(&self, root_folder: &str, json_filename: &str) -> BulkHeaderFilesManifest {
        self.bulk.manifest(root_folder, json_filename)
    }

    /// Write the bulk tier and its manifest to `folder`.
    pub async fn export_bulk(&self, folder: &Path, json_filename: &str) -> Result<BulkHeaderFilesManifest> {
        self.bulk.export(folder, json_filename).await
    }

    async fn find_bulk_by_key(&self, kind: HashIndexKind, key: &Hash) -> Result<Option<BlockHeader>> {
        let Some(index) = self.bulk_index(kind).await? else {
            return Ok(None);
        };
        let Some(height) = index.find_height(key) else {
            return Ok(None);
        };
        let header = self.bulk.find_header_for_height(height).await?;
        Ok(header.filter(|h| match kind {
            HashIndexKind::BlockHash => h.hash == *key,
            HashIndexKind::MerkleRoot => h.merkle_root == *key,
        }))
    }

    /// The index of `kind` over bulk storage, rebuilt when stale.
    async fn bulk_index(&self, kind: HashIndexKind) -> Result<Option<Arc<HashIndex>>> {
        let Some(tip) = self.bulk.tip() else {
            return Ok(None);
        };
        let key = match kind {
            HashIndexKind::BlockHash => tip.header.hash,
            HashIndexKind::MerkleRoot => tip.header.merkle_root,
        };
        let range = self.bulk.height_range();

        let mut cache = self.indexes.lock().await;
        let slot = match kind {
            HashIndexKind::BlockHash => &mut cache.block_hash,
            HashIndexKind::MerkleRoot => &mut cache.merkle_root,
        };
        if let Some(index) = slot.as_ref() {
            if index.range() == range && index.find_height(&key) == Some(tip.header.height) {
                return Ok(Some(index.clone()));
            }
            tracing::debug!("{:?} index over {} is stale for bulk range {}", kind, index.range(), range);
        }

        let data = self.bulk.all_data().await?;
        let buffers: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
        let index = Arc::new(HashIndex::build(kind, range.min_height, &buffers)?);
        tracing::debug!("built {:?} index over {} ({} entries)", kind, range, index.len());
        *slot = Some(index.clone());
        Ok(Some(index))
    }
}
