//! Bulk ingestor reading a published manifest of bulk header files.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::bulk::{
    join_url, validate_file_data, BulkFileFetcher, BulkFileSource, BulkHeaderFilesManifest, HttpFileFetcher,
};
use crate::error::{ChaintracksError, Result};
use crate::hash::Hash;
use crate::header::{decode_headers, BlockHeader};
use crate::ingest::BulkIngestor;
use crate::storage::SharedStorage;

/// Ingests bulk files listed in a JSON manifest served over HTTP.
///
/// Files that directly extend bulk storage while live storage is empty
/// are appended whole, with their content fetched on demand. Otherwise
/// the headers a file holds above the bulk tip are returned for live
/// insertion.
pub struct CdnBulkIngestor {
    manifest_url: String,
    fetcher: Arc<dyn BulkFileFetcher>,
    storage: OnceLock<SharedStorage>,
    manifest: Mutex<Option<BulkHeaderFilesManifest>>,
}

impl std::fmt::Debug for CdnBulkIngestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdnBulkIngestor")
            .field("manifest_url", &self.manifest_url)
            .finish()
    }
}

impl CdnBulkIngestor {
    /// Create an ingestor for the manifest at `manifest_url`.
    pub fn new(manifest_url: impl Into<String>) -> Self {
        Self::with_fetcher(manifest_url, Arc::new(HttpFileFetcher::new()))
    }

    /// Create an ingestor using a custom fetcher.
    pub fn with_fetcher(manifest_url: impl Into<String>, fetcher: Arc<dyn BulkFileFetcher>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            fetcher,
            storage: OnceLock::new(),
            manifest: Mutex::new(None),
        }
    }

    /// Fetch the manifest, replacing any cached copy.
    pub async fn refresh_manifest(&self) -> Result<BulkHeaderFilesManifest> {
        let manifest = self.fetcher.fetch_manifest(&self.manifest_url).await?;
        tracing::debug!(
            "manifest {} lists {} files covering {}",
            self.manifest_url,
            manifest.files.len(),
            manifest.range()
        );
        *self.manifest.lock().await = Some(manifest.clone());
        Ok(manifest)
    }

    async fn current_manifest(&self) -> Result<BulkHeaderFilesManifest> {
        if let Some(manifest) = self.manifest.lock().await.clone() {
            return Ok(manifest);
        }
        self.refresh_manifest().await
    }

    fn storage(&self) -> Result<&SharedStorage> {
        self.storage
            .get()
            .ok_or_else(|| ChaintracksError::Ingestor(format!("{}: storage not attached", self.name())))
    }
}

#[async_trait]
impl BulkIngestor for CdnBulkIngestor {
    fn name(&self) -> &str {
        "cdn"
    }

    async fn set_storage(&self, storage: SharedStorage) -> Result<()> {
        storage.write().await.set_bulk_fetcher(self.fetcher.clone());
        // Re-attaching the same ingestor keeps the first storage.
        let _ = self.storage.set(storage);
        Ok(())
    }

    async fn get_present_height(&self) -> Result<Option<u32>> {
        let manifest = self.refresh_manifest().await?;
        let range = manifest.range();
        Ok((!range.is_empty()).then_some(range.max_height))
    }

    async fn synchronize(&self, present_height: u32, prior_live: Vec<BlockHeader>) -> Result<Vec<BlockHeader>> {
        let storage = self.storage()?.clone();
        let manifest = self.current_manifest().await?;
        let known: HashSet<Hash> = prior_live.iter().map(|h| h.hash).collect();
        let mut out = Vec::new();

        for info in manifest.files {
            if info.first_height > present_height {
                break;
            }
            let (bulk_next, live_empty) = {
                let s = storage.read().await;
                (s.bulk_tip().map_or(0, |t| t.header.height + 1), s.live().is_empty())
            };
            if info.last_height() < bulk_next {
                continue;
            }
            let url = join_url(&manifest.root_folder, &info.file_name);

            if live_empty && info.first_height == bulk_next && out.is_empty() {
                storage
                    .write()
                    .await
                    .append_bulk_file(info, BulkFileSource::Remote(url))
                    .await?;
                continue;
            }

            let data = self.fetcher.fetch(&url).await?;
            validate_file_data(&info, &data)?;
            let headers = decode_headers(&data, info.first_height)?;
            out.extend(
                headers
                    .into_iter()
                    .filter(|h| h.height >= bulk_next && h.height <= present_height && !known.contains(&h.hash)),
            );
        }

        tracing::info!(
            "{} synchronized toward {}, {} headers for live storage",
            self.name(),
            present_height,
            out.len()
        );
        Ok(out)
    }
}
