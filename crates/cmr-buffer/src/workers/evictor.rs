//! Eviction role.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{CancellationToken, Worker};
use crate::buffer::IngestBuffer;

/// Evicts whenever the buffer crosses its occupancy threshold.
///
/// Only one should run per buffer; passes are serialized by the buffer anyway.
pub struct BufferEvictor<T: Send + Sync + 'static> {
    buffer: Arc<IngestBuffer<T>>,
    poll_interval: Duration,
    passes: u64,
}

impl<T: Send + Sync + 'static> BufferEvictor<T> {
    /// Creates the evictor.
    pub fn new(buffer: Arc<IngestBuffer<T>>, poll_interval: Duration) -> Self {
        Self {
            buffer,
            poll_interval,
            passes: 0,
        }
    }

    /// Eviction passes run so far.
    pub fn passes(&self) -> u64 {
        self.passes
    }
}

impl<T: Send + Sync + 'static> Worker for BufferEvictor<T> {
    fn name(&self) -> String {
        "cmr-evictor".to_string()
    }

    fn run(&mut self, token: &CancellationToken) {
        while !token.is_cancelled() {
            if !self.buffer.wait_for_eviction(self.poll_interval) || token.is_cancelled() {
                continue;
            }
            let summary = self.buffer.evict();
            self.passes += 1;
            if summary.evicted_slots == 0 {
                // Head not analyzed yet, or the target rounded down to nothing.
                std::thread::sleep(self.poll_interval);
            }
        }
        debug!(passes = self.passes, "evictor stopped");
    }
}
