//! Indexer role.

use std::sync::Arc;

use tracing::debug;

use super::{CancellationToken, Worker};
use crate::buffer::IngestBuffer;

/// Publishes analyzed slots into the index tree.
///
/// Waits up to the policy's indexing wait time whenever the next slot is not
/// analyzed yet.
pub struct BufferIndexer<T: Send + Sync + 'static> {
    id: usize,
    buffer: Arc<IngestBuffer<T>>,
}

impl<T: Send + Sync + 'static> BufferIndexer<T> {
    /// Creates indexer number `id`.
    pub fn new(id: usize, buffer: Arc<IngestBuffer<T>>) -> Self {
        Self { id, buffer }
    }
}

impl<T: Send + Sync + 'static> Worker for BufferIndexer<T> {
    fn name(&self) -> String {
        format!("cmr-indexer-{}", self.id)
    }

    fn run(&mut self, token: &CancellationToken) {
        let wait = self.buffer.policy().indexing_wait_time();
        let mut indexed = 0u64;
        while !token.is_cancelled() {
            if self.buffer.index_next(wait) {
                indexed += 1;
            }
        }
        debug!(id = self.id, indexed, "indexer stopped");
    }
}
