use proptest::prelude::*;

use bsv_chaintracks::hash::double_hash;
use bsv_chaintracks::header::encode_headers;
use bsv_chaintracks::{
    BaseBlockHeader, BlockHeader, ChainWork, Hash, HashIndex, HashIndexKind, HeightRange, LiveHeaderStore,
    StorageEngine, StorageOptions,
};

const EASY_BITS: u32 = 0x207fffff;
const HARDER_BITS: u32 = 0x1f00ffff;

fn header_on(prev: Option<&BlockHeader>, bits: u32, salt: u32) -> BlockHeader {
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

fn arb_base_header() -> impl Strategy<Value = BaseBlockHeader> {
    let arb_hash = prop::array::uniform32(any::<u8>()).prop_map(Hash::new);
    (any::<u32>(), arb_hash.clone(), arb_hash, any::<u32>(), any::<u32>(), any::<u32>()).prop_map(
        |(version, previous_hash, merkle_root, time, bits, nonce)| BaseBlockHeader {
            version,
            previous_hash,
            merkle_root,
            time,
            bits,
            nonce,
        },
    )
}

/// A random header tree: each entry picks an earlier header as parent and
/// one of two difficulties. Index order is always a valid insertion order.
fn arb_tree() -> impl Strategy<Value = Vec<(prop::sample::Index, bool)>> {
    prop::collection::vec((any::<prop::sample::Index>(), any::<bool>()), 1..40)
}

fn build_tree(shape: &[(prop::sample::Index, bool)]) -> Vec<BlockHeader> {
    let mut headers = vec![header_on(None, EASY_BITS, 0)];
    for (i, (parent, harder)) in shape.iter().enumerate() {
        let parent = &headers[parent.index(headers.len())];
        let bits = if *harder { HARDER_BITS } else { EASY_BITS };
        let header = header_on(Some(parent), bits, i as u32 + 1);
        headers.push(header);
    }
    headers
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn header_encoding_roundtrip(base in arb_base_header()) {
        let bytes = base.to_bytes();
        let decoded = BaseBlockHeader::from_bytes(&bytes).unwrap();
        prop_assert_eq!(&decoded, &base);
        prop_assert_eq!(decoded.hash(), base.hash());
        prop_assert_eq!(base.hash(), double_hash(&bytes));
    }

    #[test]
    fn active_chain_is_contiguous_and_heaviest(shape in arb_tree()) {
        let headers = build_tree(&shape);
        let mut store = LiveHeaderStore::new();
        let mut works: Vec<ChainWork> = Vec::new();
        for h in &headers {
            let r = store.insert_header(h, None);
            prop_assert!(r.added);
            let prev_work = headers
                .iter()
                .position(|p| p.hash == h.previous_hash)
                .map(|i| works[i].clone())
                .unwrap_or_default();
            works.push(&prev_work + &ChainWork::from_bits(h.bits));
        }

        // First-seen header of greatest cumulative work is the tip.
        let mut best = 0;
        for (i, w) in works.iter().enumerate() {
            if *w > works[best] {
                best = i;
            }
        }
        let tip = store.active_tip().unwrap();
        prop_assert_eq!(&tip.header, &headers[best]);

        let mut expected_prev = Hash::ZERO;
        for height in 0..=tip.header.height {
            let active = store.find_active_at_height(height).unwrap();
            prop_assert_eq!(active.header.previous_hash, expected_prev);
            expected_prev = active.header.hash;
        }
        prop_assert!(store.find_active_at_height(tip.header.height + 1).is_none());
        prop_assert!(store.validate(None).is_ok());
    }

    #[test]
    fn branch_selection_is_order_independent(
        prefix_len in 1usize..5,
        weak_len in 1usize..8,
        strong_pick in any::<prop::sample::Index>(),
    ) {
        // The strong branch is all easy headers except a harder last one,
        // so it only overtakes the weak branch when its tip arrives.
        let strong_len = strong_pick.index(weak_len) + 1;
        let mut prefix: Vec<BlockHeader> = Vec::new();
        for _ in 0..prefix_len {
            let h = header_on(prefix.last(), EASY_BITS, 0);
            prefix.push(h);
        }
        let ancestor = prefix[prefix_len - 1].clone();
        let mut weak: Vec<BlockHeader> = Vec::new();
        for i in 0..weak_len {
            let h = header_on(Some(weak.last().unwrap_or(&ancestor)), EASY_BITS, 2000 + i as u32);
            weak.push(h);
        }
        let mut strong: Vec<BlockHeader> = Vec::new();
        for i in 0..strong_len {
            let bits = if i + 1 == strong_len { HARDER_BITS } else { EASY_BITS };
            let h = header_on(Some(strong.last().unwrap_or(&ancestor)), bits, 1000 + i as u32);
            strong.push(h);
        }

        let mut weak_first = LiveHeaderStore::new();
        let mut strong_first = LiveHeaderStore::new();
        for h in &prefix {
            prop_assert!(weak_first.insert_header(h, None).added);
            prop_assert!(strong_first.insert_header(h, None).added);
        }

        let mut last = None;
        for h in weak.iter().chain(strong.iter()) {
            let r = weak_first.insert_header(h, None);
            prop_assert!(r.added);
            last = Some(r);
        }
        let last = last.unwrap();
        prop_assert!(last.is_active_tip);
        let strong_tip = &strong[strong_len - 1];
        prop_assert_eq!(last.reorg_depth, strong_tip.height - ancestor.height);
        prop_assert_eq!(last.deactivated_headers.len(), weak_len);

        for h in strong.iter().chain(weak.iter()) {
            let r = strong_first.insert_header(h, None);
            prop_assert!(r.added);
            prop_assert_eq!(r.reorg_depth, 0);
        }

        prop_assert_eq!(&weak_first.active_tip().unwrap().header, strong_tip);
        prop_assert_eq!(&strong_first.active_tip().unwrap().header, strong_tip);
        for height in 0..=(ancestor.height + weak_len as u32) {
            let a = weak_first.find_active_at_height(height).map(|h| h.header.hash);
            let b = strong_first.find_active_at_height(height).map(|h| h.header.hash);
            prop_assert_eq!(a, b);
        }
        prop_assert!(weak_first.validate(None).is_ok());
        prop_assert!(strong_first.validate(None).is_ok());
    }

    #[test]
    fn duplicate_inserts_do_not_change_state(shape in arb_tree(), pick in any::<prop::sample::Index>()) {
        let headers = build_tree(&shape);
        let mut store = LiveHeaderStore::new();
        for h in &headers {
            store.insert_header(h, None);
        }
        let tip_before = store.active_tip().unwrap().header.clone();
        let again = store.insert_header(&headers[pick.index(headers.len())], None);
        prop_assert!(again.dupe);
        prop_assert!(!again.added);
        prop_assert_eq!(&store.active_tip().unwrap().header, &tip_before);
        prop_assert_eq!(store.len(), headers.len());
    }

    #[test]
    fn migration_keeps_ranges_contiguous(
        count in 1usize..80,
        threshold in 1u32..12,
        chunk in 1u32..6,
        forks in prop::collection::vec(any::<prop::sample::Index>(), 0..6),
    ) {
        let options = StorageOptions {
            live_height_threshold: threshold,
            reorg_height_threshold: threshold,
            bulk_migration_chunk_size: chunk,
            bulk_file_max_headers: 16,
            ..Default::default()
        };
        let rt = runtime();
        rt.block_on(async {
            let mut storage = StorageEngine::new(options).unwrap();
            let mut main: Vec<BlockHeader> = Vec::new();
            for i in 0..count {
                let h = header_on(main.last(), EASY_BITS, 0);
                storage.insert_header(&h).await.unwrap();
                main.push(h);
                if let (Some(fork_at), true) = (forks.get(i), main.len() > 1) {
                    // A same-work sibling below the tip never becomes active.
                    let parent = &main[fork_at.index(main.len() - 1)];
                    let sibling = header_on(Some(parent), EASY_BITS, 1000 + i as u32);
                    let r = storage.insert_header(&sibling).await.unwrap();
                    assert!(!r.is_active_tip);
                }
                storage.check_invariant().unwrap();
                let bulk = storage.bulk_range();
                let live = storage.live_range();
                if !bulk.is_empty() {
                    assert_eq!(bulk.min_height, 0);
                    if !live.is_empty() {
                        assert_eq!(bulk.max_height + 1, live.min_height);
                    }
                }
            }
            assert_eq!(storage.find_chain_tip_hash(), main.last().map(|h| h.hash));
            for h in &main {
                assert_eq!(storage.find_header_for_height(h.height).await.unwrap().as_ref(), Some(h));
            }
            storage.validate().await.unwrap();
        });
    }

    #[test]
    fn hash_index_finds_every_header(
        count in 1usize..400,
        split in any::<prop::sample::Index>(),
        probe in prop::array::uniform32(any::<u8>()),
    ) {
        let mut headers: Vec<BlockHeader> = Vec::with_capacity(count);
        for _ in 0..count {
            let h = header_on(headers.last(), EASY_BITS, 7);
            headers.push(h);
        }
        let data = encode_headers(&headers);
        let cut = split.index(count + 1) * 80;
        let buffers: Vec<&[u8]> = vec![&data[..cut], &data[cut..]];

        let by_hash = HashIndex::build(HashIndexKind::BlockHash, 0, &buffers).unwrap();
        let by_root = HashIndex::build(HashIndexKind::MerkleRoot, 0, &buffers).unwrap();
        prop_assert_eq!(by_hash.range(), HeightRange::new(0, count as u32 - 1));
        for h in &headers {
            prop_assert_eq!(by_hash.find_height(&h.hash), Some(h.height));
            prop_assert_eq!(by_root.find_height(&h.merkle_root), Some(h.height));
        }

        let probe = Hash::new(probe);
        if !headers.iter().any(|h| h.hash == probe) {
            prop_assert_eq!(by_hash.find_height(&probe), None);
        }

        let restored = HashIndex::from_bytes(&by_hash.to_bytes()).unwrap();
        prop_assert_eq!(restored.find_height(&headers[count / 2].hash), Some((count / 2) as u32));
    }

    #[test]
    fn height_range_intersect_is_commutative(a in 0u32..100, b in 0u32..100, c in 0u32..100, d in 0u32..100) {
        let x = HeightRange::new(a, b);
        let y = HeightRange::new(c, d);
        prop_assert_eq!(x.intersect(&y), y.intersect(&x));
        let both = x.intersect(&y);
        for h in 0..100 {
            prop_assert_eq!(both.contains(h), x.contains(h) && y.contains(h));
        }
    }
}
