//! Configuration for storage tiering and the synchronization loop.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ChaintracksError, Result};
use crate::header::{mainnet_genesis, testnet_genesis, BlockHeader};

/// Which network's headers are tracked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    /// Mainnet.
    #[default]
    Main,
    /// Testnet.
    Test,
}

impl Chain {
    /// The network's genesis header.
    pub fn genesis_header(&self) -> BlockHeader {
        match self {
            Chain::Main => mainnet_genesis(),
            Chain::Test => testnet_genesis(),
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Chain::Main => f.write_str("main"),
            Chain::Test => f.write_str("test"),
        }
    }
}

/// Options for the live/bulk storage engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageOptions {
    /// Network whose headers are stored.
    pub chain: Chain,
    /// Headers this far below the active tip are always kept live.
    pub live_height_threshold: u32,
    /// Headers older than this below the tip may take the batch insert path.
    pub reorg_height_threshold: u32,
    /// Number of headers moved from live to bulk per migration step.
    pub bulk_migration_chunk_size: u32,
    /// Largest number of headers a locally derived bulk file may hold.
    pub bulk_file_max_headers: u32,
    /// Number of non-inline bulk files kept resident in memory.
    pub max_retained_bulk_files: usize,
    /// Require height 0 to match the network's genesis header on validate.
    pub check_genesis: bool,
    /// Folder for locally derived bulk files; inline in memory when unset.
    pub bulk_folder: Option<PathBuf>,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            chain: Chain::Main,
            live_height_threshold: 2000,
            reorg_height_threshold: 400,
            bulk_migration_chunk_size: 500,
            bulk_file_max_headers: 100_000,
            max_retained_bulk_files: 2,
            check_genesis: false,
            bulk_folder: None,
        }
    }
}

impl StorageOptions {
    /// Defaults for `chain`.
    pub fn for_chain(chain: Chain) -> Self {
        Self { chain, ..Default::default() }
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        if self.reorg_height_threshold > self.live_height_threshold {
            return Err(ChaintracksError::Config(format!(
                "reorgHeightThreshold {} exceeds liveHeightThreshold {}",
                self.reorg_height_threshold, self.live_height_threshold
            )));
        }
        if self.bulk_migration_chunk_size == 0 {
            return Err(ChaintracksError::Config("bulkMigrationChunkSize must be positive".into()));
        }
        if self.bulk_file_max_headers == 0 {
            return Err(ChaintracksError::Config("bulkFileMaxHeaders must be positive".into()));
        }
        Ok(())
    }
}

/// Options for the [`Chaintracks`](crate::Chaintracks) orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChaintracksOptions {
    /// Storage engine options.
    pub storage: StorageOptions,
    /// Most predecessor fetches made to place one live header.
    pub add_live_recursion_limit: u32,
    /// How long a present-height answer from bulk ingestors is reused.
    pub present_height_cache_ms: u64,
    /// Sleep when the pending queue is empty.
    pub idle_sleep_ms: u64,
    /// Force a bulk resynchronization at least this often.
    pub resync_interval_ms: u64,
    /// Refuse to start listening without at least one ingestor.
    pub require_ingestors: bool,
}

impl Default for ChaintracksOptions {
    fn default() -> Self {
        Self {
            storage: StorageOptions::default(),
            add_live_recursion_limit: 36,
            present_height_cache_ms: 60_000,
            idle_sleep_ms: 1_000,
            resync_interval_ms: 600_000,
            require_ingestors: false,
        }
    }
}

impl ChaintracksOptions {
    /// Defaults for `chain`.
    pub fn for_chain(chain: Chain) -> Self {
        Self { storage: StorageOptions::for_chain(chain), ..Default::default() }
    }

    /// Parse options from JSON; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Read options from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> Result<()> {
        self.storage.validate()?;
        if self.add_live_recursion_limit == 0 {
            return Err(ChaintracksError::Config("addLiveRecursionLimit must be positive".into()));
        }
        Ok(())
    }

    /// Present-height cache lifetime.
    pub fn present_height_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.present_height_cache_ms)
    }

    /// Idle sleep between queue drains.
    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Interval between forced resynchronizations.
    pub fn resync_interval(&self) -> Duration {
        Duration::from_millis(self.resync_interval_ms)
    }
}
