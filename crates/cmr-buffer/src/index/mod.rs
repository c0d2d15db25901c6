//! The index tree the buffer feeds.
//!
//! The buffer hands every analyzed payload to an [`IndexTree`] once. The tree
//! decides how it stores it; the buffer only asks it for its own footprint
//! (folded into buffer occupancy) and tells it when enough payloads have been
//! evicted that stale entries are worth pruning.

mod memory;

pub use memory::{IndexQuery, Indexable, MemoryIndex};

use std::sync::Arc;

use cmr_common::Result;
use rayon::ThreadPool;

/// Secondary index over buffered payloads.
pub trait IndexTree<T>: Send + Sync + 'static {
    /// Adds a payload. Called once per slot, in insertion order per indexer.
    fn put(&self, payload: &Arc<T>) -> Result<()>;

    /// Estimated memory held by the index structure itself, in bytes.
    fn component_size(&self) -> u64;

    /// Drops entries whose payloads are gone.
    fn clean(&self);

    /// Removes every entry.
    fn clear_all(&self);

    /// Runs [`clean`](Self::clean) on `executor` without waiting for it.
    fn cleanup(self: Arc<Self>, executor: &ThreadPool) {
        executor.spawn(move || self.clean());
    }
}
