//! The header tracking orchestrator.
//!
//! One main task repeatedly reconciles storage against the bulk
//! ingestors, then drains the pending header queue into live storage.
//! Each live ingestor runs as its own task feeding that queue. Tasks
//! share nothing but the queue and the storage lock.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bulk::BulkHeaderFilesManifest;
use crate::chain_tracker::ChainTracker;
use crate::error::{ChaintracksError, Result};
use crate::hash::Hash;
use crate::header::{BaseBlockHeader, BlockHeader};
use crate::height_range::HeightRange;
use crate::ingest::{BulkIngestor, HeaderQueue, LiveIngestor};
use crate::listeners::{HeaderListener, ListenerRegistry, ReorgEvent, ReorgListener};
use crate::live::InsertHeaderResult;
use crate::options::{Chain, ChaintracksOptions};
use crate::storage::{SharedStorage, StorageEngine};

/// Lifecycle state of a [`Chaintracks`] instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChaintracksStatus {
    /// Setup has not run, or the instance was destroyed.
    NotAvailable,
    /// Available, not yet caught up or not listening.
    Synchronizing,
    /// The main loop is running and has completed a pass.
    Listening,
    /// Tasks are being stopped.
    ShuttingDown,
}

/// Snapshot of an instance's coverage and configuration.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChaintracksInfo {
    /// Tracked network.
    pub chain: Chain,
    /// Lifecycle state.
    pub status: ChaintracksStatus,
    /// Heights held in bulk storage.
    pub bulk_range: HeightRange,
    /// Heights held in live storage.
    pub live_range: HeightRange,
    /// Number of bulk files.
    pub bulk_files: usize,
    /// Active tip height.
    pub tip_height: Option<u32>,
    /// Active tip hash.
    pub tip_hash: Option<Hash>,
    /// Names of the bulk ingestors, in order.
    pub bulk_ingestors: Vec<String>,
    /// Names of the live ingestors, in order.
    pub live_ingestors: Vec<String>,
    /// Registered header listeners.
    pub header_listeners: usize,
    /// Registered reorg listeners.
    pub reorg_listeners: usize,
}

/// What one pass of the main loop did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncPass {
    /// Bulk ingestors were asked to synchronize.
    pub resynchronized: bool,
    /// Headers taken from the pending queues.
    pub processed: usize,
    /// Headers that became the active tip.
    pub activated: usize,
    /// Headers dropped without being stored.
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct SyncState {
    present_height: Option<(Instant, Option<u32>)>,
    last_resync: Option<Instant>,
    force_resync: bool,
}

/// Block header tracker over tiered storage fed by pluggable ingestors.
pub struct Chaintracks {
    options: ChaintracksOptions,
    storage: SharedStorage,
    bulk_ingestors: Vec<Arc<dyn BulkIngestor>>,
    live_ingestors: Vec<Arc<dyn LiveIngestor>>,
    listeners: ListenerRegistry,
    status: RwLock<ChaintracksStatus>,
    available: Mutex<bool>,
    synchronized: AtomicBool,
    live_tx: mpsc::UnboundedSender<BlockHeader>,
    live_rx: Mutex<mpsc::UnboundedReceiver<BlockHeader>>,
    client_tx: mpsc::UnboundedSender<BlockHeader>,
    client_rx: Mutex<mpsc::UnboundedReceiver<BlockHeader>>,
    sync_state: Mutex<SyncState>,
    cancel: RwLock<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Chaintracks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chaintracks")
            .field("chain", &self.options.storage.chain)
            .field("status", &self.status())
            .field("bulk_ingestors", &self.bulk_ingestors.len())
            .field("live_ingestors", &self.live_ingestors.len())
            .finish()
    }
}

impl Chaintracks {
    /// Create a tracker with empty storage built from `options`.
    pub fn new(options: ChaintracksOptions) -> Result<Self> {
        options.validate()?;
        let storage = StorageEngine::new(options.storage.clone())?.into_shared();
        Ok(Self::with_storage(options, storage))
    }

    /// Create a tracker over existing storage.
    pub fn with_storage(options: ChaintracksOptions, storage: SharedStorage) -> Self {
        let (live_tx, live_rx) = mpsc::unbounded_channel();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        Chaintracks {
            options,
            storage,
            bulk_ingestors: Vec::new(),
            live_ingestors: Vec::new(),
            listeners: ListenerRegistry::new(),
            status: RwLock::new(ChaintracksStatus::NotAvailable),
            available: Mutex::new(false),
            synchronized: AtomicBool::new(false),
            live_tx,
            live_rx: Mutex::new(live_rx),
            client_tx,
            client_rx: Mutex::new(client_rx),
            sync_state: Mutex::new(SyncState::default()),
            cancel: RwLock::new(CancellationToken::new()),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Add a bulk ingestor; they are consulted in insertion order.
    pub fn with_bulk_ingestor(mut self, ingestor: Arc<dyn BulkIngestor>) -> Self {
        self.bulk_ingestors.push(ingestor);
        self
    }

    /// Add a live ingestor; predecessor lookups try them in insertion order.
    pub fn with_live_ingestor(mut self, ingestor: Arc<dyn LiveIngestor>) -> Self {
        self.live_ingestors.push(ingestor);
        self
    }

    /// The tracker's options.
    pub fn options(&self) -> &ChaintracksOptions {
        &self.options
    }

    /// The shared storage engine.
    pub fn storage(&self) -> SharedStorage {
        self.storage.clone()
    }

    /// A producer handle onto the live pending queue, for header sources
    /// that are not registered as live ingestors.
    pub fn header_queue(&self) -> HeaderQueue {
        HeaderQueue::new(self.live_tx.clone())
    }

    /// Tracked network.
    pub fn get_chain(&self) -> Chain {
        self.options.storage.chain
    }

    /// Current lifecycle state.
    pub fn status(&self) -> ChaintracksStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ChaintracksStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    /// True while the main loop is running.
    pub fn is_listening(&self) -> bool {
        self.status() == ChaintracksStatus::Listening
    }

    /// True once a pass has drained the pending queues with no resync outstanding.
    pub fn is_synchronized(&self) -> bool {
        self.synchronized.load(Ordering::SeqCst)
    }

    /// One-time setup: restore locally persisted bulk files and attach
    /// storage to every ingestor. Repeated calls do nothing.
    pub async fn make_available(&self) -> Result<()> {
        let mut available = self.available.lock().await;
        if *available {
            return Ok(());
        }
        {
            let mut storage = self.storage.write().await;
            if storage.live().is_empty() && storage.bulk_range().is_empty() {
                storage.restore().await?;
            }
        }
        for ingestor in &self.bulk_ingestors {
            ingestor.set_storage(self.storage.clone()).await?;
        }
        for ingestor in &self.live_ingestors {
            ingestor.set_storage(self.storage.clone()).await?;
        }
        *available = true;
        self.set_status(ChaintracksStatus::Synchronizing);
        tracing::info!(
            "chaintracks available for {} with {} bulk and {} live ingestors",
            self.get_chain(),
            self.bulk_ingestors.len(),
            self.live_ingestors.len()
        );
        Ok(())
    }

    /// Spawn one task per live ingestor plus the main loop.
    pub async fn start_listening(self: &Arc<Self>) -> Result<()> {
        self.make_available().await?;
        if self.options.require_ingestors && self.bulk_ingestors.is_empty() && self.live_ingestors.is_empty() {
            return Err(ChaintracksError::Config("no ingestors configured".into()));
        }
        let mut tasks = self.tasks.lock().await;
        if !tasks.is_empty() {
            return Ok(());
        }

        let token = CancellationToken::new();
        *self.cancel.write().unwrap_or_else(|e| e.into_inner()) = token.clone();

        for ingestor in &self.live_ingestors {
            let ingestor = Arc::clone(ingestor);
            let queue = HeaderQueue::new(self.live_tx.clone());
            let cancel = token.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = ingestor.start_listening(queue, cancel).await {
                    tracing::warn!("live ingestor {} stopped: {}", ingestor.name(), e);
                }
            }));
        }

        let this = Arc::clone(self);
        tasks.push(tokio::spawn(async move { this.run(token).await }));
        tracing::info!("chaintracks listening");
        Ok(())
    }

    /// Stop every task and wait for them to finish.
    ///
    /// A pass already in progress, including any migration, completes first.
    pub async fn stop_listening(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock().await);
        if handles.is_empty() {
            return;
        }
        self.set_status(ChaintracksStatus::ShuttingDown);
        self.cancel.read().unwrap_or_else(|e| e.into_inner()).cancel();
        for ingestor in &self.live_ingestors {
            ingestor.stop_listening().await;
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("chaintracks task failed: {}", e);
            }
        }
        self.set_status(ChaintracksStatus::Synchronizing);
        tracing::info!("chaintracks stopped listening");
    }

    /// Stop listening and release setup; [`make_available`](Self::make_available)
    /// may be called again afterwards.
    pub async fn destroy(&self) {
        self.stop_listening().await;
        *self.available.lock().await = false;
        self.synchronized.store(false, Ordering::SeqCst);
        self.set_status(ChaintracksStatus::NotAvailable);
    }

    async fn run(&self, cancel: CancellationToken) {
        while !cancel.is_cancelled() {
            match self.sync_once().await {
                Ok(pass) => {
                    if self.status() == ChaintracksStatus::Synchronizing {
                        self.set_status(ChaintracksStatus::Listening);
                    }
                    if pass.processed > 0 {
                        continue;
                    }
                }
                Err(e) => tracing::warn!("chaintracks pass failed: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.options.idle_sleep()) => {}
            }
        }
    }

    /// Run one pass of the main loop: resynchronize from bulk ingestors when
    /// needed, then drain both pending queues.
    pub async fn sync_once(&self) -> Result<SyncPass> {
        self.make_available().await?;
        let mut pass = SyncPass::default();

        let present = self.get_present_height().await?;
        if let Some(present) = present {
            if self.needs_resync(present).await {
                self.synchronize(present).await?;
                pass.resynchronized = true;
            }
        }

        {
            let mut rx = self.live_rx.lock().await;
            while let Ok(header) = rx.try_recv() {
                pass.processed += 1;
                self.add_live_header(header, true, &mut pass).await?;
            }
        }
        {
            let mut rx = self.client_rx.lock().await;
            while let Ok(header) = rx.try_recv() {
                pass.processed += 1;
                self.add_live_header(header, false, &mut pass).await?;
            }
        }

        let forced = self.sync_state.lock().await.force_resync;
        self.synchronized.store(!forced, Ordering::SeqCst);
        Ok(pass)
    }

    async fn needs_resync(&self, present: u32) -> bool {
        let state = self.sync_state.lock().await;
        if state.force_resync {
            return true;
        }
        let interval_elapsed = state
            .last_resync
            .map_or(true, |t| t.elapsed() >= self.options.resync_interval());
        if interval_elapsed {
            return true;
        }
        drop(state);
        let tip = self.storage.read().await.find_chain_tip_header();
        match tip {
            Some(tip) => present.saturating_sub(tip.height) > self.options.add_live_recursion_limit / 2,
            None => true,
        }
    }

    /// Ask each bulk ingestor in turn to reconcile storage toward `present`.
    async fn synchronize(&self, present: u32) -> Result<()> {
        for ingestor in &self.bulk_ingestors {
            let prior_live = self.storage.read().await.live_active_headers();
            match ingestor.synchronize(present, prior_live).await {
                Ok(headers) => self.fold_bulk_headers(present, headers).await?,
                Err(ChaintracksError::StorageInvariant(reason)) => {
                    return Err(ChaintracksError::StorageInvariant(reason));
                }
                Err(e) => tracing::warn!("bulk ingestor {} failed to synchronize: {}", ingestor.name(), e),
            }
        }
        let mut state = self.sync_state.lock().await;
        state.last_resync = Some(Instant::now());
        state.force_resync = false;
        Ok(())
    }

    /// Batch insert the prefix of `headers` that extends the tip and is
    /// older than the reorg threshold; queue the rest for live insertion.
    async fn fold_bulk_headers(&self, present: u32, mut headers: Vec<BlockHeader>) -> Result<()> {
        if headers.is_empty() {
            return Ok(());
        }
        headers.sort_by_key(|h| h.height);
        let cutoff = present.saturating_sub(self.options.storage.reorg_height_threshold);

        let mut storage = self.storage.write().await;
        let (mut prev_hash, mut next_height) = match storage.find_chain_tip_header() {
            Some(tip) => (tip.hash, tip.height + 1),
            None => (Hash::ZERO, 0),
        };
        let mut split = 0;
        for h in &headers {
            if h.height >= cutoff || h.previous_hash != prev_hash || h.height != next_height {
                break;
            }
            prev_hash = h.hash;
            next_height += 1;
            split += 1;
        }
        let rest = headers.split_off(split);
        if !headers.is_empty() {
            match storage.batch_insert_headers(&headers).await {
                Ok(()) => {
                    tracing::debug!("batch inserted {} bulk ingestor headers", headers.len());
                    if let Some(tip) = headers.last() {
                        self.listeners.notify_header(tip);
                    }
                }
                Err(ChaintracksError::StorageInvariant(reason)) => {
                    return Err(ChaintracksError::StorageInvariant(reason));
                }
                Err(e) => {
                    tracing::warn!("batch insert rejected, queueing headers: {}", e);
                    for h in headers {
                        let _ = self.live_tx.send(h);
                    }
                }
            }
        }
        drop(storage);
        for h in rest {
            let _ = self.live_tx.send(h);
        }
        Ok(())
    }

    /// Insert `header`, first backfilling unknown predecessors from live
    /// ingestors when `backfill` is set.
    async fn add_live_header(&self, header: BlockHeader, backfill: bool, pass: &mut SyncPass) -> Result<()> {
        let limit = self.options.add_live_recursion_limit;
        let mut pending = vec![header];
        let mut hops = 0u32;

        while let Some(h) = pending.last().cloned() {
            let inserted = self.storage.write().await.insert_header(&h).await;
            let result = match inserted {
                Ok(result) => result,
                Err(ChaintracksError::MigrationFailed { hash, result, source }) => {
                    if result.is_active_tip {
                        pass.activated += 1;
                    }
                    self.notify(&h, &result);
                    return Err(ChaintracksError::MigrationFailed { hash, result, source });
                }
                Err(e) => return Err(e),
            };
            if result.no_prev {
                if !backfill {
                    tracing::debug!("dropping submitted header {} with unknown predecessor", h.hash);
                    pass.dropped += 1;
                    return Ok(());
                }
                if hops >= limit {
                    tracing::warn!(
                        "dropping header {} after {} predecessor fetches",
                        pending[0].hash,
                        hops
                    );
                    pass.dropped += 1;
                    return Ok(());
                }
                hops += 1;
                match self.fetch_predecessor(&h.previous_hash).await {
                    Some(prev) => {
                        pending.push(prev);
                        continue;
                    }
                    None => {
                        tracing::warn!("no live ingestor has predecessor {} of {}", h.previous_hash, h.hash);
                        pass.dropped += 1;
                        return Ok(());
                    }
                }
            }

            pending.pop();
            if result.needs_resync() {
                tracing::warn!(
                    "dropping header {} at height {}; scheduling resync",
                    h.hash,
                    h.height
                );
                self.sync_state.lock().await.force_resync = true;
                pass.dropped += 1;
                return Ok(());
            }
            if result.is_active_tip {
                pass.activated += 1;
            }
            self.notify(&h, &result);
        }
        Ok(())
    }

    async fn fetch_predecessor(&self, hash: &Hash) -> Option<BlockHeader> {
        for ingestor in &self.live_ingestors {
            match ingestor.get_header_by_hash(hash).await {
                Ok(Some(header)) if header.hash == *hash && header.has_valid_hash() => return Some(header),
                Ok(Some(header)) => {
                    tracing::warn!("live ingestor {} returned {} for {}", ingestor.name(), header.hash, hash);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!("live ingestor {} lookup of {} failed: {}", ingestor.name(), hash, e),
            }
        }
        None
    }

    fn notify(&self, header: &BlockHeader, result: &InsertHeaderResult) {
        if !result.added || !result.is_active_tip {
            return;
        }
        self.listeners.notify_header(header);
        if result.reorg_depth > 0 {
            if let Some(old_tip) = &result.prior_tip {
                self.listeners.notify_reorg(&ReorgEvent {
                    depth: result.reorg_depth,
                    old_tip: old_tip.clone(),
                    new_tip: header.clone(),
                    deactivated_headers: result.deactivated_headers.clone(),
                });
            }
        }
    }

    /// Highest height known to any bulk ingestor, cached briefly.
    pub async fn get_present_height(&self) -> Result<Option<u32>> {
        let ttl = self.options.present_height_cache_ttl();
        if let Some((at, height)) = self.sync_state.lock().await.present_height {
            if at.elapsed() < ttl {
                return Ok(height);
            }
        }
        let mut best: Option<u32> = None;
        for ingestor in &self.bulk_ingestors {
            match ingestor.get_present_height().await {
                Ok(Some(h)) => best = Some(best.map_or(h, |b| b.max(h))),
                Ok(None) => {}
                Err(e) => tracing::warn!("bulk ingestor {} present height failed: {}", ingestor.name(), e),
            }
        }
        self.sync_state.lock().await.present_height = Some((Instant::now(), best));
        Ok(best)
    }

    /// Queue a client-submitted header.
    ///
    /// Its height is taken from its stored predecessor; a header whose
    /// predecessor is unknown is dropped.
    pub async fn add_header(&self, header: BaseBlockHeader) -> Result<()> {
        let prev = self
            .storage
            .read()
            .await
            .find_header_for_block_hash(&header.previous_hash)
            .await?;
        let Some(prev) = prev else {
            tracing::debug!("ignoring submitted header with unknown predecessor {}", header.previous_hash);
            return Ok(());
        };
        let header = BlockHeader::new(header, prev.height + 1);
        self.client_tx
            .send(header)
            .map_err(|_| ChaintracksError::NotAvailable("header queue closed".into()))
    }

    /// Tip height of the active chain.
    pub async fn current_height(&self) -> Result<u32> {
        self.find_chain_tip_header()
            .await
            .map(|h| h.height)
            .ok_or_else(|| ChaintracksError::NotAvailable("no headers stored".into()))
    }

    /// The active header at `height`.
    pub async fn find_header_for_height(&self, height: u32) -> Result<Option<BlockHeader>> {
        self.storage.read().await.find_header_for_height(height).await
    }

    /// The active chain tip.
    pub async fn find_chain_tip_header(&self) -> Option<BlockHeader> {
        self.storage.read().await.find_chain_tip_header()
    }

    /// Hash of the active chain tip.
    pub async fn find_chain_tip_hash(&self) -> Option<Hash> {
        self.storage.read().await.find_chain_tip_hash()
    }

    /// The stored header with block hash `hash`.
    pub async fn find_header_for_block_hash(&self, hash: &Hash) -> Result<Option<BlockHeader>> {
        self.storage.read().await.find_header_for_block_hash(hash).await
    }

    /// The active header with merkle root `root`.
    pub async fn find_header_for_merkle_root(&self, root: &Hash) -> Result<Option<BlockHeader>> {
        self.storage.read().await.find_header_for_merkle_root(root).await
    }

    /// Raw concatenated headers for up to `count` heights from `height`.
    pub async fn get_headers(&self, height: u32, count: u32) -> Result<Vec<u8>> {
        self.storage.read().await.get_headers(height, count).await
    }

    /// [`get_headers`](Self::get_headers) as a hex string.
    pub async fn get_headers_hex(&self, height: u32, count: u32) -> Result<String> {
        Ok(hex::encode(self.get_headers(height, count).await?))
    }

    /// Register a new-tip listener.
    pub fn subscribe_headers(&self, listener: HeaderListener) -> i32 {
        self.listeners.subscribe_headers(listener)
    }

    /// Register a reorg listener.
    pub fn subscribe_reorgs(&self, listener: ReorgListener) -> i32 {
        self.listeners.subscribe_reorgs(listener)
    }

    /// Remove a listener of either kind.
    pub fn unsubscribe(&self, id: i32) -> bool {
        self.listeners.unsubscribe(id)
    }

    /// Re-check the integrity of the whole chain.
    ///
    /// # Returns
    /// `Ok(false)` when stored data is inconsistent; other failures
    /// (I/O, fetching) are returned as errors.
    pub async fn validate(&self) -> Result<bool> {
        match self.storage.read().await.validate().await {
            Ok(()) => Ok(true),
            Err(
                e @ (ChaintracksError::StorageInvariant(_)
                | ChaintracksError::BulkAppend(_)
                | ChaintracksError::BulkFileHashMismatch { .. }
                | ChaintracksError::BulkFileInvalid { .. }
                | ChaintracksError::InvalidHeader(_)
                | ChaintracksError::HashIndex(_)),
            ) => {
                tracing::error!("chain validation failed: {}", e);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Summary of coverage and configuration.
    pub async fn get_info(&self) -> ChaintracksInfo {
        let storage = self.storage.read().await;
        let tip = storage.find_chain_tip_header();
        ChaintracksInfo {
            chain: self.get_chain(),
            status: self.status(),
            bulk_range: storage.bulk_range(),
            live_range: storage.live_range(),
            bulk_files: storage.bulk().files().len(),
            tip_height: tip.as_ref().map(|t| t.height),
            tip_hash: tip.map(|t| t.hash),
            bulk_ingestors: self.bulk_ingestors.iter().map(|i| i.name().to_string()).collect(),
            live_ingestors: self.live_ingestors.iter().map(|i| i.name().to_string()).collect(),
            header_listeners: self.listeners.header_count(),
            reorg_listeners: self.listeners.reorg_count(),
        }
    }

    /// Write bulk storage and a manifest to `folder`.
    pub async fn export_bulk(&self, folder: &Path, json_filename: &str) -> Result<BulkHeaderFilesManifest> {
        self.storage.read().await.export_bulk(folder, json_filename).await
    }
}

#[async_trait]
impl ChainTracker for Chaintracks {
    async fn is_valid_root_for_height(&self, root: &Hash, height: u32) -> Result<bool> {
        self.storage.read().await.is_valid_root_for_height(root, height).await
    }

    async fn current_height(&self) -> Result<u32> {
        Chaintracks::current_height(self).await
    }
}
