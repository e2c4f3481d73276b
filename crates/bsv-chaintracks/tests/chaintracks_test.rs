use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use bsv_chaintracks::hash::double_hash;
use bsv_chaintracks::{
    BaseBlockHeader, BlockHeader, BulkIngestor, ChainTracker, Chaintracks, ChaintracksOptions,
    ChaintracksStatus, Hash, HeaderQueue, HeightRange, LiveIngestor, ReorgEvent, Result, SharedStorage,
};

const EASY_BITS: u32 = 0x207fffff;

fn next_header(prev: Option<&BlockHeader>, bits: u32, salt: u32) -> BlockHeader {
    let (previous_hash, height) = match prev {
        Some(p) => (p.hash, p.height + 1),
        None => (Hash::ZERO, 0),
    };
    let mut seed = height.to_le_bytes().to_vec();
    seed.extend_from_slice(&salt.to_le_bytes());
    BlockHeader::new(
        BaseBlockHeader {
            version: 1,
            previous_hash,
            merkle_root: double_hash(&seed),
            time: 1_600_000_000 + height * 600,
            bits,
            nonce: salt,
        },
        height,
    )
}

fn chain(count: usize) -> Vec<BlockHeader> {
    let mut out: Vec<BlockHeader> = Vec::with_capacity(count);
    for _ in 0..count {
        let header = next_header(out.last(), EASY_BITS, 0);
        out.push(header);
    }
    out
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fast_options() -> ChaintracksOptions {
    ChaintracksOptions { idle_sleep_ms: 5, ..Default::default() }
}

struct MockLiveIngestor {
    known: HashMap<Hash, BlockHeader>,
    stream: Vec<BlockHeader>,
    lookups: AtomicUsize,
    stopped: AtomicBool,
}

impl MockLiveIngestor {
    fn new(known: &[BlockHeader], stream: Vec<BlockHeader>) -> Self {
        Self {
            known: known.iter().map(|h| (h.hash, h.clone())).collect(),
            stream,
            lookups: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl LiveIngestor for MockLiveIngestor {
    fn name(&self) -> &str {
        "mock-live"
    }

    async fn start_listening(&self, queue: HeaderQueue, cancel: CancellationToken) -> Result<()> {
        for header in &self.stream {
            queue.push(header.clone());
        }
        cancel.cancelled().await;
        Ok(())
    }

    async fn stop_listening(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn get_header_by_hash(&self, hash: &Hash) -> Result<Option<BlockHeader>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.known.get(hash).cloned())
    }
}

struct MockBulkIngestor {
    present: u32,
    headers: Vec<BlockHeader>,
    syncs: AtomicUsize,
}

#[async_trait]
impl BulkIngestor for MockBulkIngestor {
    fn name(&self) -> &str {
        "mock-bulk"
    }

    async fn get_present_height(&self) -> Result<Option<u32>> {
        Ok(Some(self.present))
    }

    async fn synchronize(&self, present_height: u32, prior_live: Vec<BlockHeader>) -> Result<Vec<BlockHeader>> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .headers
            .iter()
            .filter(|h| h.height <= present_height && !prior_live.contains(h))
            .cloned()
            .collect())
    }
}

async fn wait_for_tip(tracker: &Chaintracks, hash: Hash) {
    for _ in 0..400 {
        if tracker.find_chain_tip_hash().await == Some(hash) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tip never reached {}", hash);
}

#[tokio::test]
async fn test_reorg_through_queue_notifies_listeners() {
    init_tracing();
    let tracker = Chaintracks::new(fast_options()).unwrap();
    let genesis = next_header(None, EASY_BITS, 0);
    let a1 = next_header(Some(&genesis), 0x1f00ffff, 0);
    let b1 = next_header(Some(&genesis), EASY_BITS, 1);
    let b2 = next_header(Some(&b1), 0x1e00ffff, 1);

    let reorgs: Arc<Mutex<Vec<ReorgEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let tips = Arc::new(AtomicUsize::new(0));
    let r = reorgs.clone();
    tracker.subscribe_reorgs(Box::new(move |e| r.lock().unwrap().push(e.clone())));
    let t = tips.clone();
    tracker.subscribe_headers(Box::new(move |_| {
        t.fetch_add(1, Ordering::SeqCst);
    }));

    let queue = tracker.header_queue();
    for h in [&genesis, &a1, &b1, &b2] {
        assert!(queue.push(h.clone()));
    }
    let pass = tracker.sync_once().await.unwrap();
    assert_eq!(pass.processed, 4);
    assert_eq!(pass.activated, 3);

    assert_eq!(tips.load(Ordering::SeqCst), 3);
    let reorgs = reorgs.lock().unwrap();
    assert_eq!(reorgs.len(), 1);
    assert_eq!(reorgs[0].depth, 1);
    assert_eq!(reorgs[0].old_tip, a1);
    assert_eq!(reorgs[0].new_tip, b2);
    assert_eq!(reorgs[0].deactivated_headers, vec![a1.clone()]);

    assert_eq!(tracker.find_header_for_height(1).await.unwrap(), Some(b1));
    assert_eq!(tracker.current_height().await.unwrap(), 2);
}

#[tokio::test]
async fn test_duplicate_headers_leave_chain_unchanged() {
    let tracker = Chaintracks::new(fast_options()).unwrap();
    let headers = chain(5);
    let queue = tracker.header_queue();
    for h in &headers {
        queue.push(h.clone());
    }
    tracker.sync_once().await.unwrap();
    for h in &headers {
        queue.push(h.clone());
    }
    let pass = tracker.sync_once().await.unwrap();
    assert_eq!(pass.processed, 5);
    assert_eq!(pass.activated, 0);
    assert_eq!(pass.dropped, 0);
    assert_eq!(tracker.find_chain_tip_hash().await, Some(headers[4].hash));
    assert_eq!(tracker.storage().read().await.live().len(), 5);
}

#[tokio::test]
async fn test_backfills_missing_predecessors() {
    let headers = chain(10);
    let live = Arc::new(MockLiveIngestor::new(&headers, vec![]));
    let tracker = Chaintracks::new(fast_options()).unwrap().with_live_ingestor(live.clone());

    tracker.header_queue().push(headers[9].clone());
    let pass = tracker.sync_once().await.unwrap();
    assert_eq!(pass.dropped, 0);
    assert_eq!(live.lookups.load(Ordering::SeqCst), 9);
    assert_eq!(tracker.find_chain_tip_hash().await, Some(headers[9].hash));
    for h in &headers {
        assert_eq!(tracker.find_header_for_height(h.height).await.unwrap().as_ref(), Some(h));
    }
}

#[tokio::test]
async fn test_backfill_limit_drops_header() {
    let headers = chain(10);
    let live = Arc::new(MockLiveIngestor::new(&headers, vec![]));
    let options = ChaintracksOptions { add_live_recursion_limit: 3, ..fast_options() };
    let tracker = Chaintracks::new(options).unwrap().with_live_ingestor(live.clone());

    tracker.header_queue().push(headers[9].clone());
    let pass = tracker.sync_once().await.unwrap();
    assert_eq!(pass.dropped, 1);
    assert_eq!(live.lookups.load(Ordering::SeqCst), 3);
    assert!(tracker.find_chain_tip_header().await.is_none());
}

#[tokio::test]
async fn test_client_headers_are_never_backfilled() {
    let headers = chain(6);
    let live = Arc::new(MockLiveIngestor::new(&headers, vec![]));
    let tracker = Chaintracks::new(fast_options()).unwrap().with_live_ingestor(live.clone());
    let queue = tracker.header_queue();
    for h in &headers[..3] {
        queue.push(h.clone());
    }
    tracker.sync_once().await.unwrap();

    // Predecessor unknown: dropped without a lookup.
    tracker.add_header(headers[4].base()).await.unwrap();
    // Predecessor known: accepted at the derived height.
    tracker.add_header(headers[3].base()).await.unwrap();
    tracker.sync_once().await.unwrap();

    assert_eq!(live.lookups.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.current_height().await.unwrap(), 3);
    assert_eq!(tracker.find_chain_tip_hash().await, Some(headers[3].hash));
}

#[tokio::test]
async fn test_structural_rejection_forces_resync() {
    init_tracing();
    let headers = chain(8);
    let bulk = Arc::new(MockBulkIngestor { present: 7, headers: headers.clone(), syncs: AtomicUsize::new(0) });
    let tracker = Chaintracks::new(fast_options()).unwrap().with_bulk_ingestor(bulk.clone());

    let pass = tracker.sync_once().await.unwrap();
    assert!(pass.resynchronized);
    assert_eq!(tracker.current_height().await.unwrap(), 7);
    assert!(tracker.is_synchronized());

    // Caught up and within the resync interval: no bulk call.
    let pass = tracker.sync_once().await.unwrap();
    assert!(!pass.resynchronized);
    assert_eq!(bulk.syncs.load(Ordering::SeqCst), 1);

    let mut wrong_height = next_header(Some(&headers[7]), EASY_BITS, 3);
    wrong_height.height = 12;
    tracker.header_queue().push(wrong_height);
    let pass = tracker.sync_once().await.unwrap();
    assert_eq!(pass.dropped, 1);
    assert!(!tracker.is_synchronized());

    let pass = tracker.sync_once().await.unwrap();
    assert!(pass.resynchronized);
    assert_eq!(bulk.syncs.load(Ordering::SeqCst), 2);
    assert!(tracker.is_synchronized());
}

#[tokio::test]
async fn test_header_with_mismatched_hash_is_dropped() {
    let headers = chain(4);
    let bulk = Arc::new(MockBulkIngestor { present: 3, headers: headers.clone(), syncs: AtomicUsize::new(0) });
    let tracker = Chaintracks::new(fast_options()).unwrap().with_bulk_ingestor(bulk.clone());
    tracker.sync_once().await.unwrap();

    let tips = Arc::new(AtomicUsize::new(0));
    let t = tips.clone();
    tracker.subscribe_headers(Box::new(move |_| {
        t.fetch_add(1, Ordering::SeqCst);
    }));

    let mut forged = next_header(Some(&headers[3]), EASY_BITS, 5);
    forged.hash = Hash::new([0x42; 32]);
    let child = next_header(Some(&forged), EASY_BITS, 5);
    tracker.header_queue().push(forged.clone());
    tracker.header_queue().push(child);
    let pass = tracker.sync_once().await.unwrap();
    assert_eq!(pass.processed, 2);
    assert_eq!(pass.activated, 0);
    assert_eq!(pass.dropped, 2);
    assert_eq!(tips.load(Ordering::SeqCst), 0);
    assert_eq!(tracker.find_chain_tip_hash().await, Some(headers[3].hash));
    assert!(tracker.find_header_for_block_hash(&forged.hash).await.unwrap().is_none());
    assert!(!tracker.is_synchronized());
    assert!(tracker.validate().await.unwrap());
}

/// Bulk ingestor that archives the heaviest of the branches its sources offer.
struct ForkedSourcesIngestor {
    candidates: Vec<Vec<BlockHeader>>,
    storage: OnceLock<SharedStorage>,
}

#[async_trait]
impl BulkIngestor for ForkedSourcesIngestor {
    fn name(&self) -> &str {
        "forked-sources"
    }

    async fn set_storage(&self, storage: SharedStorage) -> Result<()> {
        let _ = self.storage.set(storage);
        Ok(())
    }

    async fn get_present_height(&self) -> Result<Option<u32>> {
        Ok(self.candidates.iter().filter_map(|c| c.last()).map(|h| h.height).max())
    }

    async fn synchronize(&self, _present_height: u32, _prior_live: Vec<BlockHeader>) -> Result<Vec<BlockHeader>> {
        if let Some(storage) = self.storage.get() {
            storage.write().await.append_bulk_branches(&self.candidates).await?;
        }
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_bulk_ingestor_archives_heaviest_branch() {
    let base = chain(3);
    let mut light = base.clone();
    for _ in 0..4 {
        let h = next_header(light.last(), EASY_BITS, 1);
        light.push(h);
    }
    let mut heavy = base.clone();
    for _ in 0..2 {
        let h = next_header(heavy.last(), 0x1f00ffff, 2);
        heavy.push(h);
    }
    let ingestor = Arc::new(ForkedSourcesIngestor {
        candidates: vec![light.clone(), heavy.clone()],
        storage: OnceLock::new(),
    });
    let tracker = Chaintracks::new(fast_options()).unwrap().with_bulk_ingestor(ingestor);

    let pass = tracker.sync_once().await.unwrap();
    assert!(pass.resynchronized);
    assert_eq!(tracker.current_height().await.unwrap(), 4);
    assert_eq!(tracker.find_chain_tip_hash().await, Some(heavy[4].hash));
    assert_eq!(tracker.storage().read().await.bulk_range(), HeightRange::new(0, 4));
    assert!(tracker.find_header_for_block_hash(&light[6].hash).await.unwrap().is_none());
    assert!(tracker.validate().await.unwrap());
}

#[tokio::test]
async fn test_migration_through_orchestrator() {
    init_tracing();
    let mut options = fast_options();
    options.storage.live_height_threshold = 10;
    options.storage.reorg_height_threshold = 5;
    options.storage.bulk_migration_chunk_size = 1;
    let tracker = Chaintracks::new(options).unwrap();
    let headers = chain(25);
    let queue = tracker.header_queue();
    for h in &headers {
        queue.push(h.clone());
    }
    tracker.sync_once().await.unwrap();

    let info = tracker.get_info().await;
    assert_eq!(info.bulk_range, HeightRange::new(0, 14));
    assert_eq!(info.live_range, HeightRange::new(15, 24));
    assert_eq!(info.bulk_files, 1);
    assert_eq!(info.tip_height, Some(24));
    assert!(tracker.validate().await.unwrap());

    let bytes = tracker.get_headers(10, 10).await.unwrap();
    assert_eq!(bytes.len(), 800);
    assert_eq!(&bytes[..80], &headers[10].to_bytes()[..]);
    assert_eq!(&bytes[720..], &headers[19].to_bytes()[..]);
    assert_eq!(tracker.get_headers_hex(0, 1).await.unwrap(), hex::encode(headers[0].to_bytes()));

    let dir = tempfile::tempdir().unwrap();
    let manifest = tracker.export_bulk(dir.path(), "headers.json").await.unwrap();
    assert_eq!(manifest.range(), HeightRange::new(0, 14));
}

#[tokio::test]
async fn test_chain_tracker_trait() {
    let tracker = Chaintracks::new(fast_options()).unwrap();
    let headers = chain(4);
    let queue = tracker.header_queue();
    for h in &headers {
        queue.push(h.clone());
    }
    tracker.sync_once().await.unwrap();

    let ct: &dyn ChainTracker = &tracker;
    assert!(ct.is_valid_root_for_height(&headers[2].merkle_root, 2).await.unwrap());
    assert!(!ct.is_valid_root_for_height(&headers[2].merkle_root, 3).await.unwrap());
    assert!(!ct.is_valid_root_for_height(&headers[2].merkle_root, 50).await.unwrap());
    assert_eq!(ct.current_height().await.unwrap(), 3);
    assert_eq!(
        tracker.find_header_for_merkle_root(&headers[1].merkle_root).await.unwrap(),
        Some(headers[1].clone())
    );
}

#[tokio::test]
async fn test_listening_lifecycle() {
    init_tracing();
    let headers = chain(6);
    let live = Arc::new(MockLiveIngestor::new(&headers, vec![headers[5].clone()]));
    let tracker = Arc::new(Chaintracks::new(fast_options()).unwrap().with_live_ingestor(live.clone()));
    assert_eq!(tracker.status(), ChaintracksStatus::NotAvailable);

    tracker.start_listening().await.unwrap();
    // A second call while running is a no-op.
    tracker.start_listening().await.unwrap();
    wait_for_tip(&tracker, headers[5].hash).await;
    for _ in 0..400 {
        if tracker.is_listening() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(tracker.is_listening());

    tracker.stop_listening().await;
    assert!(live.stopped.load(Ordering::SeqCst));
    assert_eq!(tracker.status(), ChaintracksStatus::Synchronizing);

    tracker.destroy().await;
    assert_eq!(tracker.status(), ChaintracksStatus::NotAvailable);
    assert_eq!(tracker.current_height().await.unwrap(), 5);
}

#[tokio::test]
async fn test_require_ingestors() {
    let options = ChaintracksOptions { require_ingestors: true, ..fast_options() };
    let tracker = Arc::new(Chaintracks::new(options).unwrap());
    assert!(tracker.start_listening().await.is_err());
}

#[tokio::test]
async fn test_options_from_json_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chaintracks.json");
    std::fs::write(&path, r#"{"storage": {"chain": "test"}, "addLiveRecursionLimit": 12}"#).unwrap();
    let options = ChaintracksOptions::from_json_file(&path).unwrap();
    let tracker = Chaintracks::new(options).unwrap();
    assert_eq!(tracker.get_chain(), bsv_chaintracks::Chain::Test);
    assert_eq!(tracker.options().add_live_recursion_limit, 12);
    let info = tracker.get_info().await;
    assert_eq!(serde_json::to_value(&info).unwrap()["chain"], "test");
}
