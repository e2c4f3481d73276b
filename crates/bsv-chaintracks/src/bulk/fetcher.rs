//! Retrieval of remote bulk files and manifests.

use async_trait::async_trait;

use crate::bulk::file::BulkHeaderFilesManifest;
use crate::error::{ChaintracksError, Result};

/// Source of remotely published bulk files.
#[async_trait]
pub trait BulkFileFetcher: Send + Sync {
    /// Fetch raw bytes from `url`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Fetch and parse a JSON manifest from `url`.
    async fn fetch_manifest(&self, url: &str) -> Result<BulkHeaderFilesManifest> {
        let bytes = self.fetch(url).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// HTTP fetcher backed by `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct HttpFileFetcher {
    client: reqwest::Client,
}

impl HttpFileFetcher {
    /// Create a fetcher with a default HTTP client.
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    /// Create a fetcher sharing an existing HTTP client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BulkFileFetcher for HttpFileFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        tracing::debug!("fetching {}", url);
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ChaintracksError::HttpStatus {
                status_code: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

/// Join a manifest root folder and a file name into a URL.
pub fn join_url(root: &str, file_name: &str) -> String {
    format!("{}/{}", root.trim_end_matches('/'), file_name.trim_start_matches('/'))
}
