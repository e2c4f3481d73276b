//! The mutable window of recent headers and reorg resolution.
//!
//! Headers are held in an arena keyed by a dense surrogate id; each
//! header records the id of its live predecessor so ancestor walks are
//! plain map lookups. A header whose predecessor has been migrated to
//! bulk storage carries no predecessor id and is linked to the bulk tip
//! by hash instead.

use std::collections::{BTreeMap, HashMap};

use crate::bulk::BulkTip;
use crate::error::{ChaintracksError, Result};
use crate::hash::Hash;
use crate::header::{BlockHeader, HeaderId, LiveBlockHeader};
use crate::height_range::HeightRange;
use crate::work::ChainWork;

/// Outcome of inserting one header into live storage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InsertHeaderResult {
    /// The header was stored.
    pub added: bool,
    /// The header was already known; nothing changed.
    pub dupe: bool,
    /// The header is now the active chain tip.
    pub is_active_tip: bool,
    /// Number of formerly active headers above the common ancestor.
    pub reorg_depth: u32,
    /// The active tip before this insert, when it changed.
    pub prior_tip: Option<BlockHeader>,
    /// Headers that left the active chain, highest first.
    pub deactivated_headers: Vec<BlockHeader>,
    /// The predecessor is unknown.
    pub no_prev: bool,
    /// The predecessor's height is not one below the header's, the hash
    /// does not match the header fields, or the bits carry no work.
    pub bad_prev: bool,
    /// The ancestor walk left live storage before converging.
    pub no_active_ancestor: bool,
    /// A live predecessor exists but no active tip does.
    pub no_tip: bool,
}

impl InsertHeaderResult {
    /// True when the header was dropped for a structural reason that
    /// warrants a bulk resynchronization.
    pub fn needs_resync(&self) -> bool {
        self.bad_prev || self.no_active_ancestor || self.no_tip
    }

    /// True when a reorg replaced formerly active headers.
    pub fn is_reorg(&self) -> bool {
        self.is_active_tip && self.reorg_depth > 0
    }
}

/// A position in an ancestor walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Node {
    Live(HeaderId),
    Bulk,
}

/// In-memory live header storage.
#[derive(Debug, Default)]
pub struct LiveHeaderStore {
    headers: HashMap<HeaderId, LiveBlockHeader>,
    by_hash: HashMap<Hash, HeaderId>,
    by_height: BTreeMap<u32, Vec<HeaderId>>,
    active_tip: Option<HeaderId>,
    next_id: HeaderId,
}

impl LiveHeaderStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored headers, active or not.
    pub fn len(&self) -> usize {
        self.headers.len()
    }

    /// True when no headers are stored.
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    /// Heights spanned by every stored header.
    pub fn height_range(&self) -> HeightRange {
        match (self.by_height.keys().next(), self.by_height.keys().next_back()) {
            (Some(&min), Some(&max)) => HeightRange::new(min, max),
            _ => HeightRange::empty(),
        }
    }

    /// The active chain tip.
    pub fn active_tip(&self) -> Option<&LiveBlockHeader> {
        self.active_tip.and_then(|id| self.headers.get(&id))
    }

    /// The stored header with `hash`.
    pub fn find_by_hash(&self, hash: &Hash) -> Option<&LiveBlockHeader> {
        self.by_hash.get(hash).and_then(|id| self.headers.get(id))
    }

    /// The active header at `height`.
    pub fn find_active_at_height(&self, height: u32) -> Option<&LiveBlockHeader> {
        self.by_height
            .get(&height)?
            .iter()
            .filter_map(|id| self.headers.get(id))
            .find(|h| h.is_active)
    }

    /// The active header whose merkle root is `root`.
    pub fn find_active_by_merkle_root(&self, root: &Hash) -> Option<&LiveBlockHeader> {
        self.headers
            .values()
            .find(|h| h.is_active && h.header.merkle_root == *root)
    }

    /// Every stored header at `height`, active or not.
    pub fn headers_at_height(&self, height: u32) -> Vec<&LiveBlockHeader> {
        self.by_height
            .get(&height)
            .map(|ids| ids.iter().filter_map(|id| self.headers.get(id)).collect())
            .unwrap_or_default()
    }

    /// Active headers with heights in `range`, in height order.
    pub fn active_headers(&self, range: &HeightRange) -> Vec<BlockHeader> {
        if range.is_empty() {
            return Vec::new();
        }
        self.by_height
            .range(range.min_height..=range.max_height)
            .filter_map(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| self.headers.get(id))
                    .find(|h| h.is_active)
                    .map(|h| h.header.clone())
            })
            .collect()
    }

    /// Insert `header`, resolving any reorg against the current active chain.
    ///
    /// `bulk_tip` is the most recent archived header, used as the
    /// predecessor of headers at the bottom of the live window and as the
    /// active tip when live storage is empty.
    pub fn insert_header(&mut self, header: &BlockHeader, bulk_tip: Option<&BulkTip>) -> InsertHeaderResult {
        let mut result = InsertHeaderResult::default();

        if !header.has_valid_hash() || ChainWork::from_bits(header.bits).is_zero() {
            tracing::debug!(
                "rejecting header {} at height {}: hash does not match fields or bits carry no work",
                header.hash,
                header.height
            );
            result.bad_prev = true;
            return result;
        }

        if self.by_hash.contains_key(&header.hash) {
            result.dupe = true;
            return result;
        }

        // Resolve the predecessor: live first, then the bulk boundary.
        let (pred, pred_height, pred_work) = if let Some(&id) = self.by_hash.get(&header.previous_hash) {
            let p = &self.headers[&id];
            (Some(Node::Live(id)), p.header.height, p.chain_work.clone())
        } else if let Some(tip) = bulk_tip.filter(|t| t.header.hash == header.previous_hash) {
            (Some(Node::Bulk), tip.header.height, tip.chain_work.clone())
        } else if bulk_tip.is_none() && self.is_empty() && header.height == 0 && header.previous_hash.is_zero() {
            (None, 0, ChainWork::zero())
        } else {
            result.no_prev = true;
            return result;
        };

        if pred.is_some() && pred_height + 1 != header.height {
            result.bad_prev = true;
            return result;
        }

        let chain_work = &pred_work + &ChainWork::from_bits(header.bits);

        // The current tip: live first, then the bulk boundary.
        let old_tip: Option<(Node, u32, ChainWork)> = match self.active_tip() {
            Some(tip) => Some((Node::Live(tip.header_id), tip.header.height, tip.chain_work.clone())),
            None => bulk_tip.map(|t| (Node::Bulk, t.header.height, t.chain_work.clone())),
        };
        if old_tip.is_none() && matches!(pred, Some(Node::Live(_))) {
            result.no_tip = true;
            return result;
        }

        let supersedes = match &old_tip {
            Some((_, _, tip_work)) => chain_work > *tip_work,
            None => true,
        };

        let mut deactivate: Vec<HeaderId> = Vec::new();
        let mut activate: Vec<HeaderId> = Vec::new();
        if supersedes {
            if let (Some((old_node, old_height, _)), Some(new_pred)) = (&old_tip, pred) {
                let Some((ancestor_height, old_branch, new_branch)) =
                    self.common_ancestor(*old_node, new_pred, bulk_tip)
                else {
                    result.no_active_ancestor = true;
                    return result;
                };
                result.reorg_depth = (*old_height).min(header.height) - ancestor_height;
                deactivate = old_branch;
                activate = new_branch;
            }
            result.prior_tip = match &old_tip {
                Some((Node::Live(id), _, _)) => Some(self.headers[id].header.clone()),
                Some((Node::Bulk, _, _)) => bulk_tip.map(|t| t.header.clone()),
                None => None,
            };
        }

        for id in &deactivate {
            if let Some(h) = self.headers.get_mut(id) {
                h.is_active = false;
                result.deactivated_headers.push(h.header.clone());
            }
        }
        for id in &activate {
            if let Some(h) = self.headers.get_mut(id) {
                h.is_active = true;
            }
        }
        let previous_header_id = match pred {
            Some(Node::Live(id)) => {
                if let Some(p) = self.headers.get_mut(&id) {
                    p.is_chain_tip = false;
                }
                Some(id)
            }
            _ => None,
        };

        let header_id = self.next_id;
        self.next_id += 1;
        self.store(LiveBlockHeader {
            header: header.clone(),
            header_id,
            previous_header_id,
            chain_work,
            is_active: supersedes,
            is_chain_tip: true,
        });
        if supersedes {
            self.active_tip = Some(header_id);
            if result.reorg_depth > 0 {
                tracing::info!(
                    "reorg of depth {} to {} at height {}",
                    result.reorg_depth,
                    header.hash,
                    header.height
                );
            }
        }

        result.added = true;
        result.is_active_tip = supersedes;
        result
    }

    /// Append `headers`, which must directly extend the active tip (or the
    /// bulk tip when live storage has no active tip) without competition.
    pub fn batch_insert_headers(&mut self, headers: &[BlockHeader], bulk_tip: Option<&BulkTip>) -> Result<()> {
        let Some(first) = headers.first() else {
            return Ok(());
        };
        let (mut prev_id, mut prev_hash, mut prev_height, mut work) = match self.active_tip() {
            Some(tip) => (Some(tip.header_id), tip.header.hash, Some(tip.header.height), tip.chain_work.clone()),
            None => match bulk_tip {
                Some(t) => (None, t.header.hash, Some(t.header.height), t.chain_work.clone()),
                None => (None, Hash::ZERO, None, ChainWork::zero()),
            },
        };
        if self.active_tip.is_none() && !self.is_empty() {
            return Err(ChaintracksError::StorageInvariant(
                "live storage holds headers but no active tip".into(),
            ));
        }

        for header in headers {
            let expected_height = prev_height.map_or(0, |h| h + 1);
            if header.previous_hash != prev_hash || header.height != expected_height {
                return Err(ChaintracksError::InvalidHeader(format!(
                    "batch header {} at height {} does not extend {} at height {}",
                    header.hash,
                    header.height,
                    prev_hash,
                    expected_height as i64 - 1
                )));
            }
            if self.by_hash.contains_key(&header.hash)
                || !header.has_valid_hash()
                || ChainWork::from_bits(header.bits).is_zero()
            {
                return Err(ChaintracksError::InvalidHeader(format!(
                    "batch header {} is already stored or malformed",
                    header.hash
                )));
            }
            prev_hash = header.hash;
            prev_height = Some(header.height);
        }

        tracing::debug!("batch inserting {} headers from height {}", headers.len(), first.height);
        if let Some(id) = prev_id {
            if let Some(tip) = self.headers.get_mut(&id) {
                tip.is_chain_tip = false;
            }
        }
        for (i, header) in headers.iter().enumerate() {
            work = &work + &ChainWork::from_bits(header.bits);
            let header_id = self.next_id;
            self.next_id += 1;
            self.store(LiveBlockHeader {
                header: header.clone(),
                header_id,
                previous_header_id: prev_id,
                chain_work: work.clone(),
                is_active: true,
                is_chain_tip: i + 1 == headers.len(),
            });
            prev_id = Some(header_id);
        }
        self.active_tip = prev_id;
        Ok(())
    }

    /// The oldest `count` active headers, in height order.
    pub fn oldest_active(&self, count: usize) -> Vec<BlockHeader> {
        self.by_height
            .values()
            .filter_map(|ids| {
                ids.iter()
                    .filter_map(|id| self.headers.get(id))
                    .find(|h| h.is_active)
                    .map(|h| h.header.clone())
            })
            .take(count)
            .collect()
    }

    /// Remove every header at or below `max_height`.
    ///
    /// Active headers there have been archived; inactive ones are discarded.
    /// Surviving headers that referred to a removed predecessor lose their
    /// predecessor id.
    ///
    /// # Returns
    /// The number of headers removed.
    pub fn remove_through_height(&mut self, max_height: u32) -> usize {
        let heights: Vec<u32> = self.by_height.range(..=max_height).map(|(h, _)| *h).collect();
        let mut removed = 0;
        for height in heights {
            for id in self.by_height.remove(&height).unwrap_or_default() {
                if let Some(h) = self.headers.remove(&id) {
                    self.by_hash.remove(&h.header.hash);
                    if self.active_tip == Some(id) {
                        self.active_tip = None;
                    }
                    removed += 1;
                }
            }
        }
        let orphaned: Vec<HeaderId> = self
            .headers
            .values()
            .filter(|h| h.previous_header_id.is_some_and(|p| !self.headers.contains_key(&p)))
            .map(|h| h.header_id)
            .collect();
        for id in orphaned {
            if let Some(h) = self.headers.get_mut(&id) {
                h.previous_header_id = None;
            }
        }
        removed
    }

    /// Check the structural invariants of the active chain.
    pub fn validate(&self, bulk_tip: Option<&BulkTip>) -> Result<()> {
        let tips = self.headers.values().filter(|h| h.is_active && h.is_chain_tip).count();
        if tips > 1 {
            return Err(ChaintracksError::StorageInvariant(format!(
                "{} active chain tips in live storage",
                tips
            )));
        }
        let Some(tip) = self.active_tip() else {
            if self.is_empty() {
                return Ok(());
            }
            return Err(ChaintracksError::StorageInvariant("live storage has no active tip".into()));
        };
        if !tip.is_active || !tip.is_chain_tip {
            return Err(ChaintracksError::StorageInvariant("active tip is not flagged active".into()));
        }

        let mut current = tip;
        loop {
            if !current.header.has_valid_hash() {
                return Err(ChaintracksError::StorageInvariant(format!(
                    "live header at height {} has a stale hash",
                    current.header.height
                )));
            }
            match current.previous_header_id {
                Some(prev_id) => {
                    let Some(prev) = self.headers.get(&prev_id) else {
                        return Err(ChaintracksError::StorageInvariant(format!(
                            "live header {} refers to missing predecessor",
                            current.header.hash
                        )));
                    };
                    if !prev.is_active
                        || prev.header.hash != current.header.previous_hash
                        || prev.header.height + 1 != current.header.height
                    {
                        return Err(ChaintracksError::StorageInvariant(format!(
                            "active chain broken below height {}",
                            current.header.height
                        )));
                    }
                    current = prev;
                }
                None => break,
            }
        }

        let linked_to_bulk = bulk_tip.is_some_and(|t| {
            t.header.hash == current.header.previous_hash && t.header.height + 1 == current.header.height
        });
        let is_genesis = bulk_tip.is_none() && current.header.height == 0 && current.header.previous_hash.is_zero();
        if !linked_to_bulk && !is_genesis {
            return Err(ChaintracksError::StorageInvariant(format!(
                "active chain bottom at height {} links to neither bulk nor genesis",
                current.header.height
            )));
        }
        Ok(())
    }

    fn store(&mut self, header: LiveBlockHeader) {
        let id = header.header_id;
        self.by_hash.insert(header.header.hash, id);
        self.by_height.entry(header.header.height).or_default().push(id);
        self.headers.insert(id, header);
    }

    fn node_height(&self, node: Node, bulk_tip: Option<&BulkTip>) -> Option<u32> {
        match node {
            Node::Live(id) => self.headers.get(&id).map(|h| h.header.height),
            Node::Bulk => bulk_tip.map(|t| t.header.height),
        }
    }

    fn step_back(&self, node: Node, bulk_tip: Option<&BulkTip>) -> Option<Node> {
        match node {
            Node::Live(id) => {
                let h = self.headers.get(&id)?;
                match h.previous_header_id {
                    Some(prev) => Some(Node::Live(prev)),
                    None if bulk_tip.is_some_and(|t| t.header.hash == h.header.previous_hash) => Some(Node::Bulk),
                    None => None,
                }
            }
            Node::Bulk => None,
        }
    }

    /// Walk back from `old` and `new` until they meet.
    ///
    /// # Returns
    /// The ancestor's height, the live ids above it on the old branch, and
    /// the live ids above it on the new branch; `None` if the walk runs out
    /// of stored predecessors first.
    fn common_ancestor(
        &self,
        old: Node,
        new: Node,
        bulk_tip: Option<&BulkTip>,
    ) -> Option<(u32, Vec<HeaderId>, Vec<HeaderId>)> {
        let mut a = old;
        let mut b = new;
        let mut old_branch = Vec::new();
        let mut new_branch = Vec::new();
        while a != b {
            let ha = self.node_height(a, bulk_tip)?;
            let hb = self.node_height(b, bulk_tip)?;
            if ha >= hb {
                if let Node::Live(id) = a {
                    old_branch.push(id);
                }
                a = self.step_back(a, bulk_tip)?;
            }
            if hb >= ha {
                if let Node::Live(id) = b {
                    new_branch.push(id);
                }
                b = self.step_back(b, bulk_tip)?;
            }
        }
        let height = self.node_height(a, bulk_tip)?;
        Some((height, old_branch, new_branch))
    }
}
