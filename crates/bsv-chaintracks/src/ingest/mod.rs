//! Header source contracts.
//!
//! Bulk ingestors reconcile large historical ranges against storage;
//! live ingestors stream new headers into the pending queue and answer
//! predecessor lookups for backfill. The orchestrator holds an ordered
//! list of each and treats every variant the same way.

pub mod cdn;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::hash::Hash;
use crate::header::BlockHeader;
use crate::storage::SharedStorage;

pub use cdn::CdnBulkIngestor;

/// Producer side of the orchestrator's pending header queue.
#[derive(Debug, Clone)]
pub struct HeaderQueue {
    tx: mpsc::UnboundedSender<BlockHeader>,
}

impl HeaderQueue {
    /// Wrap the sending half of a channel.
    pub fn new(tx: mpsc::UnboundedSender<BlockHeader>) -> Self {
        Self { tx }
    }

    /// Create a queue and its receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BlockHeader>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Enqueue `header`.
    ///
    /// # Returns
    /// `false` if the orchestrator has gone away.
    pub fn push(&self, header: BlockHeader) -> bool {
        self.tx.send(header).is_ok()
    }

    /// True once the receiving side is dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A source of historical headers.
#[async_trait]
pub trait BulkIngestor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Attach the storage this ingestor reconciles against.
    async fn set_storage(&self, _storage: SharedStorage) -> Result<()> {
        Ok(())
    }

    /// The highest height this source knows about, if any.
    async fn get_present_height(&self) -> Result<Option<u32>>;

    /// Bring storage up toward `present_height`.
    ///
    /// Ranges that can be appended to bulk storage directly are; headers
    /// that cannot be placed there are returned for live insertion.
    /// `prior_live` holds the active live headers before the call.
    async fn synchronize(&self, present_height: u32, prior_live: Vec<BlockHeader>) -> Result<Vec<BlockHeader>>;
}

/// A source of new headers as they are mined.
#[async_trait]
pub trait LiveIngestor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Attach the storage this ingestor may consult.
    async fn set_storage(&self, _storage: SharedStorage) -> Result<()> {
        Ok(())
    }

    /// Push new headers into `queue` until `cancel` fires or
    /// [`stop_listening`](Self::stop_listening) is called.
    async fn start_listening(&self, queue: HeaderQueue, cancel: CancellationToken) -> Result<()>;

    /// Ask a running [`start_listening`](Self::start_listening) to return.
    async fn stop_listening(&self);

    /// Look up a header by hash, for predecessor backfill.
    async fn get_header_by_hash(&self, hash: &Hash) -> Result<Option<BlockHeader>>;
}
