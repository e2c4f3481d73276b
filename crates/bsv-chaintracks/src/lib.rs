//! # bsv-chaintracks
//!
//! Block header tracking for SPV wallets. Headers arrive from untrusted
//! bulk and live sources, competing branches are resolved by cumulative
//! chain work, and the active chain is stored in two tiers: a small
//! mutable live window for reorg handling over an immutable, append-only
//! archive of bulk header files.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bsv_chaintracks::{CdnBulkIngestor, Chaintracks, ChaintracksOptions, Chain};
//!
//! # async fn run() -> bsv_chaintracks::Result<()> {
//! let tracker = Arc::new(
//!     Chaintracks::new(ChaintracksOptions::for_chain(Chain::Main))?
//!         .with_bulk_ingestor(Arc::new(CdnBulkIngestor::new(
//!             "https://cdn.example.com/headers/mainNetBlockHeaders.json",
//!         ))),
//! );
//! tracker.start_listening().await?;
//! let height = tracker.current_height().await?;
//! # let _ = height;
//! # Ok(())
//! # }
//! ```

pub mod bulk;
pub mod chain_tracker;
pub mod chaintracks;
pub mod error;
pub mod hash;
pub mod hash_index;
pub mod header;
pub mod height_range;
pub mod ingest;
pub mod listeners;
pub mod live;
pub mod options;
pub mod storage;
pub mod work;

#[cfg(test)]
mod test_utils;

pub use bulk::{BulkArchive, BulkFileFetcher, BulkFileSource, BulkHeaderFileInfo, BulkHeaderFilesManifest, HttpFileFetcher};
pub use chain_tracker::ChainTracker;
pub use chaintracks::{Chaintracks, ChaintracksInfo, ChaintracksStatus, SyncPass};
pub use error::{ChaintracksError, Result};
pub use hash::Hash;
pub use hash_index::{HashIndex, HashIndexKind};
pub use header::{BaseBlockHeader, BlockHeader, LiveBlockHeader, HEADER_SIZE};
pub use height_range::HeightRange;
pub use ingest::{BulkIngestor, CdnBulkIngestor, HeaderQueue, LiveIngestor};
pub use listeners::{ListenerRegistry, ReorgEvent};
pub use live::{InsertHeaderResult, LiveHeaderStore};
pub use options::{Chain, ChaintracksOptions, StorageOptions};
pub use storage::{SharedStorage, StorageEngine};
pub use work::ChainWork;
