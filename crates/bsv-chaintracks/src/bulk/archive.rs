//! The append-only archive of finalized headers.
//!
//! Files are kept in height order starting at genesis. Each file's bytes
//! are either held inline, read from a local folder, or fetched from a
//! remote URL; non-inline content is cached with least-recently-used
//! eviction once more than `max_retained_bulk_files` are resident.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::Mutex;

use crate::bulk::fetcher::BulkFileFetcher;
use crate::bulk::file::{
    select_heaviest_branch, validate_file_data, BulkFileSource, BulkHeaderFileInfo,
    BulkHeaderFilesManifest,
};
use crate::error::{ChaintracksError, Result};
use crate::hash::Hash;
use crate::header::{decode_headers, BlockHeader, HEADER_SIZE};
use crate::height_range::HeightRange;
use crate::options::{Chain, StorageOptions};
use crate::work::ChainWork;

/// Name of the manifest written alongside locally derived bulk files.
pub const LOCAL_MANIFEST_NAME: &str = "bulk_manifest.json";

/// A bulk file descriptor and where its content lives.
#[derive(Clone, Debug)]
pub struct BulkFile {
    /// The file's descriptor.
    pub info: BulkHeaderFileInfo,
    /// Provenance of the file's bytes.
    pub source: BulkFileSource,
}

/// The most recent bulk header together with its cumulative work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BulkTip {
    /// The last archived header.
    pub header: BlockHeader,
    /// Cumulative work through that header.
    pub chain_work: ChainWork,
}

/// Manager of the immutable bulk files.
pub struct BulkArchive {
    chain: Chain,
    files: Vec<BulkFile>,
    tip: Option<BulkTip>,
    cache: Mutex<LruCache<String, Arc<Vec<u8>>>>,
    fetcher: Option<Arc<dyn BulkFileFetcher>>,
    folder: Option<PathBuf>,
    max_file_headers: u32,
}

impl fmt::Debug for BulkArchive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkArchive")
            .field("chain", &self.chain)
            .field("files", &self.files.len())
            .field("range", &self.height_range())
            .field("folder", &self.folder)
            .finish()
    }
}

impl BulkArchive {
    /// Create an empty archive.
    pub fn new(options: &StorageOptions) -> Self {
        let retained = NonZeroUsize::new(options.max_retained_bulk_files).unwrap_or(NonZeroUsize::MIN);
        BulkArchive {
            chain: options.chain,
            files: Vec::new(),
            tip: None,
            cache: Mutex::new(LruCache::new(retained)),
            fetcher: None,
            folder: options.bulk_folder.clone(),
            max_file_headers: options.bulk_file_max_headers,
        }
    }

    /// Use `fetcher` to retrieve remote file content.
    pub fn set_fetcher(&mut self, fetcher: Arc<dyn BulkFileFetcher>) {
        self.fetcher = Some(fetcher);
    }

    /// Heights covered by all files.
    pub fn height_range(&self) -> HeightRange {
        match (self.files.first(), self.files.last()) {
            (Some(first), Some(last)) => HeightRange::new(first.info.first_height, last.info.last_height()),
            _ => HeightRange::empty(),
        }
    }

    /// Files in height order.
    pub fn files(&self) -> &[BulkFile] {
        &self.files
    }

    /// The most recent archived header.
    pub fn tip(&self) -> Option<&BulkTip> {
        self.tip.as_ref()
    }

    /// Append a file that directly extends the archive.
    ///
    /// The content is loaded from `source` and fully validated before the
    /// file is accepted.
    pub async fn append_file(&mut self, info: BulkHeaderFileInfo, source: BulkFileSource) -> Result<()> {
        info.extends(self.files.last().map(|f| &f.info))?;
        let data = self.load(&info, &source).await?;
        validate_file_data(&info, &data)?;
        tracing::info!(
            "appending bulk file {} covering {}",
            info.file_name,
            info.range()
        );
        self.push_file(info, source, data).await
    }

    /// Archive `headers`, which must directly extend the current tip.
    ///
    /// The last locally derived file is extended up to the configured file
    /// size by replacing its descriptor; further headers start new files.
    pub async fn append_headers(&mut self, headers: &[BlockHeader]) -> Result<()> {
        let Some(first) = headers.first() else {
            return Ok(());
        };
        let (expected_height, expected_prev) = match &self.tip {
            Some(tip) => (tip.header.height + 1, tip.header.hash),
            None => (0, Hash::ZERO),
        };
        if first.height != expected_height || first.previous_hash != expected_prev {
            return Err(ChaintracksError::BulkAppend(format!(
                "headers starting at {} ({}) do not extend bulk tip at {} ({})",
                first.height,
                first.previous_hash,
                expected_height as i64 - 1,
                expected_prev
            )));
        }

        let mut pending: Vec<BlockHeader> = headers.to_vec();

        let extendable = self
            .files
            .last()
            .filter(|f| f.source.is_derived() && f.info.count < self.max_file_headers)
            .map(|f| f.info.clone());
        if let Some(last) = extendable {
            let room = (self.max_file_headers - last.count) as usize;
            let take = room.min(pending.len());
            let old_data = self.file_data(self.files.len() - 1).await?;
            let mut combined = decode_headers(&old_data, last.first_height)?;
            combined.extend(pending.drain(..take));
            let name = self.file_name_for(last.first_height, last.first_height + combined.len() as u32 - 1);
            let (info, data) = BulkHeaderFileInfo::from_headers(name, &combined, &last.prev_chain_work)?;
            validate_file_data(&info, &data)?;

            let source = self.store(&info, data.clone()).await?;
            if let Some(old) = self.files.pop() {
                self.cache.lock().await.pop(&old.info.file_name);
                tracing::debug!(
                    "extended bulk file {} ({} headers) to {} ({} headers)",
                    old.info.file_name,
                    old.info.count,
                    info.file_name,
                    info.count
                );
                if let BulkFileSource::Local(path) = &old.source {
                    if old.info.file_name != info.file_name {
                        if let Err(e) = tokio::fs::remove_file(path).await {
                            tracing::warn!("could not remove superseded bulk file {:?}: {}", path, e);
                        }
                    }
                }
            }
            self.push_file(info, source, Arc::new(data)).await?;
        }

        while !pending.is_empty() {
            let take = (self.max_file_headers as usize).min(pending.len());
            let chunk: Vec<BlockHeader> = pending.drain(..take).collect();
            let prev_work = self.tip.as_ref().map(|t| t.chain_work.clone()).unwrap_or_default();
            let name = self.file_name_for(chunk[0].height, chunk[chunk.len() - 1].height);
            let (info, data) = BulkHeaderFileInfo::from_headers(name, &chunk, &prev_work)?;
            info.extends(self.files.last().map(|f| &f.info))?;
            validate_file_data(&info, &data)?;
            let source = self.store(&info, data.clone()).await?;
            tracing::info!("created bulk file {} covering {}", info.file_name, info.range());
            self.push_file(info, source, Arc::new(data)).await?;
        }

        self.persist_manifest().await
    }

    /// Archive the heaviest of several competing branches following the tip.
    ///
    /// Reached through [`StorageEngine::append_bulk_branches`](crate::storage::StorageEngine::append_bulk_branches)
    /// by bulk ingestors whose sources disagree near the boundary.
    ///
    /// # Returns
    /// The index of the branch written, or `None` if no candidate extends the tip.
    pub async fn append_best_branch(&mut self, candidates: &[Vec<BlockHeader>]) -> Result<Option<usize>> {
        let prev_hash = self.tip.as_ref().map(|t| t.header.hash).unwrap_or(Hash::ZERO);
        let Some(best) = select_heaviest_branch(candidates, &prev_hash) else {
            return Ok(None);
        };
        self.append_headers(&candidates[best]).await?;
        Ok(Some(best))
    }

    /// The archived header at `height`, if covered.
    pub async fn find_header_for_height(&self, height: u32) -> Result<Option<BlockHeader>> {
        let Some(index) = self.file_index_for_height(height) else {
            return Ok(None);
        };
        let data = self.file_data(index).await?;
        let offset = (height - self.files[index].info.first_height) as usize * HEADER_SIZE;
        Ok(Some(BlockHeader::from_bytes(&data[offset..offset + HEADER_SIZE], height)?))
    }

    /// Raw concatenated headers for up to `count` heights starting at `height`,
    /// clipped to the archive's range.
    pub async fn get_headers_bytes(&self, height: u32, count: u32) -> Result<Vec<u8>> {
        let wanted = self.height_range().intersect(&HeightRange::from_count(height, count));
        let mut out = Vec::with_capacity(wanted.length() as usize * HEADER_SIZE);
        if wanted.is_empty() {
            return Ok(out);
        }
        let mut h = wanted.min_height;
        while h <= wanted.max_height {
            let Some(index) = self.file_index_for_height(h) else {
                break;
            };
            let info = &self.files[index].info;
            let end = info.last_height().min(wanted.max_height);
            let data = self.file_data(index).await?;
            let start_off = (h - info.first_height) as usize * HEADER_SIZE;
            let end_off = (end - info.first_height + 1) as usize * HEADER_SIZE;
            out.extend_from_slice(&data[start_off..end_off]);
            h = end + 1;
        }
        Ok(out)
    }

    /// Content of every file in height order, for index building.
    pub async fn all_data(&self) -> Result<Vec<Arc<Vec<u8>>>> {
        let mut out = Vec::with_capacity(self.files.len());
        for i in 0..self.files.len() {
            out.push(self.file_data(i).await?);
        }
        Ok(out)
    }

    /// Re-verify every file and the chain of files from genesis.
    pub async fn validate(&self) -> Result<()> {
        let mut prev: Option<&BulkHeaderFileInfo> = None;
        for (i, file) in self.files.iter().enumerate() {
            file.info.extends(prev)?;
            let data = self.file_data(i).await?;
            validate_file_data(&file.info, &data)?;
            prev = Some(&file.info);
        }
        Ok(())
    }

    /// Describe the archive as a publishable manifest.
    pub fn manifest(&self, root_folder: &str, json_filename: &str) -> BulkHeaderFilesManifest {
        BulkHeaderFilesManifest {
            root_folder: root_folder.to_string(),
            json_filename: json_filename.to_string(),
            files: self.files.iter().map(|f| f.info.clone()).collect(),
        }
    }

    /// Write every file and a manifest into `folder`.
    pub async fn export(&self, folder: &Path, json_filename: &str) -> Result<BulkHeaderFilesManifest> {
        tokio::fs::create_dir_all(folder).await?;
        for (i, file) in self.files.iter().enumerate() {
            let data = self.file_data(i).await?;
            tokio::fs::write(folder.join(&file.info.file_name), data.as_slice()).await?;
        }
        let manifest = self.manifest(&folder.to_string_lossy(), json_filename);
        tokio::fs::write(folder.join(json_filename), serde_json::to_vec_pretty(&manifest)?).await?;
        tracing::info!("exported {} bulk files to {:?}", self.files.len(), folder);
        Ok(manifest)
    }

    /// Reload locally derived files recorded in the bulk folder's manifest.
    ///
    /// # Returns
    /// The number of files restored.
    pub async fn restore_local(&mut self) -> Result<usize> {
        let Some(folder) = self.folder.clone() else {
            return Ok(0);
        };
        let manifest_path = folder.join(LOCAL_MANIFEST_NAME);
        if !tokio::fs::try_exists(&manifest_path).await? {
            return Ok(0);
        }
        let manifest: BulkHeaderFilesManifest =
            serde_json::from_slice(&tokio::fs::read(&manifest_path).await?)?;
        let mut restored = 0;
        for info in manifest.files {
            if self.height_range().contains(info.first_height) {
                continue;
            }
            let path = folder.join(&info.file_name);
            self.append_file(info, BulkFileSource::Local(path)).await?;
            restored += 1;
        }
        tracing::info!("restored {} bulk files from {:?}", restored, folder);
        Ok(restored)
    }

    fn file_index_for_height(&self, height: u32) -> Option<usize> {
        let index = self.files.partition_point(|f| f.info.last_height() < height);
        self.files
            .get(index)
            .filter(|f| f.info.range().contains(height))
            .map(|_| index)
    }

    fn file_name_for(&self, first: u32, last: u32) -> String {
        format!("{}_{:07}_{:07}.headers", self.chain, first, last)
    }

    async fn file_data(&self, index: usize) -> Result<Arc<Vec<u8>>> {
        let file = &self.files[index];
        if let BulkFileSource::Inline(data) = &file.source {
            return Ok(data.clone());
        }
        if let Some(data) = self.cache.lock().await.get(&file.info.file_name) {
            tracing::trace!("bulk file {} cache hit", file.info.file_name);
            return Ok(data.clone());
        }
        let data = self.load(&file.info, &file.source).await?;
        validate_file_data(&file.info, &data)?;
        self.retain(&file.info.file_name, data.clone()).await;
        Ok(data)
    }

    async fn retain(&self, file_name: &str, data: Arc<Vec<u8>>) {
        let mut cache = self.cache.lock().await;
        if let Some((evicted, _)) = cache.push(file_name.to_string(), data) {
            if evicted != file_name {
                tracing::debug!("evicted bulk file {} from cache", evicted);
            }
        }
    }

    async fn load(&self, info: &BulkHeaderFileInfo, source: &BulkFileSource) -> Result<Arc<Vec<u8>>> {
        match source {
            BulkFileSource::Inline(data) => Ok(data.clone()),
            BulkFileSource::Local(path) => Ok(Arc::new(tokio::fs::read(path).await?)),
            BulkFileSource::Remote(url) => match &self.fetcher {
                Some(fetcher) => Ok(Arc::new(fetcher.fetch(url).await?)),
                None => Err(ChaintracksError::BulkFileUnavailable(info.file_name.clone())),
            },
        }
    }

    async fn store(&self, info: &BulkHeaderFileInfo, data: Vec<u8>) -> Result<BulkFileSource> {
        match &self.folder {
            Some(folder) => {
                tokio::fs::create_dir_all(folder).await?;
                let path = folder.join(&info.file_name);
                tokio::fs::write(&path, &data).await?;
                Ok(BulkFileSource::Local(path))
            }
            None => Ok(BulkFileSource::Inline(Arc::new(data))),
        }
    }

    async fn push_file(&mut self, info: BulkHeaderFileInfo, source: BulkFileSource, data: Arc<Vec<u8>>) -> Result<()> {
        if data.len() < HEADER_SIZE {
            return Err(ChaintracksError::BulkFileInvalid {
                file_name: info.file_name,
                reason: "file holds no headers".into(),
            });
        }
        let last_offset = data.len() - HEADER_SIZE;
        let header = BlockHeader::from_bytes(&data[last_offset..], info.last_height())?;
        if !matches!(source, BulkFileSource::Inline(_)) {
            self.retain(&info.file_name, data).await;
        }
        self.tip = Some(BulkTip { header, chain_work: info.last_chain_work.clone() });
        self.files.push(BulkFile { info, source });
        Ok(())
    }

    async fn persist_manifest(&self) -> Result<()> {
        let Some(folder) = &self.folder else {
            return Ok(());
        };
        let manifest = self.manifest(&folder.to_string_lossy(), LOCAL_MANIFEST_NAME);
        tokio::fs::write(folder.join(LOCAL_MANIFEST_NAME), serde_json::to_vec_pretty(&manifest)?).await?;
        Ok(())
    }
}
