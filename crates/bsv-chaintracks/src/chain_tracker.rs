//! The proof-checking interface wallets consume.

use async_trait::async_trait;

use crate::error::Result;
use crate::hash::Hash;

/// Answers merkle proof checks from tracked headers.
///
/// A root is valid only against the header that is active at the given
/// height, whether it currently sits in live or bulk storage; headers on
/// inactive branches never validate a proof.
#[async_trait]
pub trait ChainTracker: Send + Sync {
    /// True if `root` is the merkle root of the active header at `height`.
    ///
    /// Heights above the active tip, or not yet stored, answer `Ok(false)`.
    async fn is_valid_root_for_height(&self, root: &Hash, height: u32) -> Result<bool>;

    /// Height of the active chain tip.
    ///
    /// # Returns
    /// An error while no header has been stored.
    async fn current_height(&self) -> Result<u32>;
}
