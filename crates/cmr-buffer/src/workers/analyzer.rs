//! Analyzer role.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{CancellationToken, Worker};
use crate::buffer::IngestBuffer;

/// Sizes slots as they arrive.
pub struct BufferAnalyzer<T: Send + Sync + 'static> {
    id: usize,
    buffer: Arc<IngestBuffer<T>>,
    poll_interval: Duration,
}

impl<T: Send + Sync + 'static> BufferAnalyzer<T> {
    /// Creates analyzer number `id`.
    pub fn new(id: usize, buffer: Arc<IngestBuffer<T>>, poll_interval: Duration) -> Self {
        Self {
            id,
            buffer,
            poll_interval,
        }
    }
}

impl<T: Send + Sync + 'static> Worker for BufferAnalyzer<T> {
    fn name(&self) -> String {
        format!("cmr-analyzer-{}", self.id)
    }

    fn run(&mut self, token: &CancellationToken) {
        let mut analyzed = 0u64;
        while !token.is_cancelled() {
            if self.buffer.analyze_next(self.poll_interval) {
                analyzed += 1;
            }
        }
        debug!(id = self.id, analyzed, "analyzer stopped");
    }
}
