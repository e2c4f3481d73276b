//! Subscriber registry for new-tip and reorg notifications.
//!
//! Fan-out is synchronous and best effort: each listener runs in turn on
//! the notifying task, and a listener that panics is logged and skipped.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::RwLock;

use crate::header::BlockHeader;

/// Callback invoked with each new active chain tip.
pub type HeaderListener = Box<dyn Fn(&BlockHeader) + Send + Sync>;
/// Callback invoked when a reorg replaces active headers.
pub type ReorgListener = Box<dyn Fn(&ReorgEvent) + Send + Sync>;

/// Details of one chain reorganization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReorgEvent {
    /// Number of formerly active headers above the common ancestor.
    pub depth: u32,
    /// The active tip before the reorg.
    pub old_tip: BlockHeader,
    /// The new active tip.
    pub new_tip: BlockHeader,
    /// Headers that left the active chain, highest first.
    pub deactivated_headers: Vec<BlockHeader>,
}

/// Registry of header and reorg listeners sharing one id space.
#[derive(Default)]
pub struct ListenerRegistry {
    header_listeners: RwLock<HashMap<i32, HeaderListener>>,
    reorg_listeners: RwLock<HashMap<i32, ReorgListener>>,
    counter: AtomicI32,
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("header_listeners", &self.header_count())
            .field("reorg_listeners", &self.reorg_count())
            .finish()
    }
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> i32 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a new-tip listener. Returns its id.
    pub fn subscribe_headers(&self, listener: HeaderListener) -> i32 {
        let id = self.next_id();
        self.header_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        id
    }

    /// Register a reorg listener. Returns its id.
    pub fn subscribe_reorgs(&self, listener: ReorgListener) -> i32 {
        let id = self.next_id();
        self.reorg_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, listener);
        id
    }

    /// Remove the listener with `id`, of either kind.
    ///
    /// # Returns
    /// `true` if a listener was removed.
    pub fn unsubscribe(&self, id: i32) -> bool {
        let removed_header = self
            .header_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        let removed_reorg = self
            .reorg_listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        removed_header || removed_reorg
    }

    /// Number of header listeners.
    pub fn header_count(&self) -> usize {
        self.header_listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of reorg listeners.
    pub fn reorg_count(&self) -> usize {
        self.reorg_listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Deliver a new tip to every header listener.
    pub fn notify_header(&self, header: &BlockHeader) {
        let listeners = self.header_listeners.read().unwrap_or_else(|e| e.into_inner());
        for (id, listener) in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(header))).is_err() {
                tracing::warn!("header listener {} panicked on {}", id, header.hash);
            }
        }
    }

    /// Deliver a reorg to every reorg listener.
    pub fn notify_reorg(&self, event: &ReorgEvent) {
        let listeners = self.reorg_listeners.read().unwrap_or_else(|e| e.into_inner());
        for (id, listener) in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::warn!("reorg listener {} panicked at depth {}", id, event.depth);
            }
        }
    }
}
