//! The repository entry point.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cmr_buffer::{
    BufferConfig, BufferStats, CapacityPolicy, CapacityProbe, IndexQuery, IndexTree,
    IngestBuffer, MemoryIndex, SystemMemory, WorkerConfig, WorkerSupervisor,
};
use cmr_common::{HeapObjectSizes, MeasurementRecord, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Configuration of a [`Repository`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Buffer and capacity policy settings.
    pub buffer: BufferConfig,
    /// Worker thread settings.
    pub workers: WorkerConfig,
}

impl RepositoryConfig {
    /// Default settings with an explicit byte budget.
    pub fn with_budget(bytes: u64) -> Self {
        Self {
            buffer: BufferConfig::default().with_max_size(bytes),
            workers: WorkerConfig::default(),
        }
    }

    /// Replaces the worker settings.
    pub fn with_workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }
}

/// Buffer, index and workers wired together.
///
/// Records get a fresh id on [`put`](Self::put), are sized, indexed and
/// eventually evicted in the background, and can be looked up through
/// [`query`](Self::query) while they are buffered.
pub struct Repository {
    config: RepositoryConfig,
    buffer: Arc<IngestBuffer<MeasurementRecord>>,
    index: Arc<MemoryIndex<MeasurementRecord>>,
    workers: Mutex<Option<WorkerSupervisor<MeasurementRecord>>>,
    next_id: AtomicU64,
}

impl Repository {
    /// Creates a repository sized against the host's physical memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the host capacity is
    /// unknown and no budget is configured, or the workers cannot be started.
    pub fn with_config(config: RepositoryConfig) -> Result<Self> {
        Self::with_probe(config, &SystemMemory)
    }

    /// Creates a repository sized against `probe`.
    ///
    /// # Errors
    ///
    /// Same as [`with_config`](Self::with_config).
    pub fn with_probe(config: RepositoryConfig, probe: &dyn CapacityProbe) -> Result<Self> {
        let policy = CapacityPolicy::new(config.buffer.clone(), probe)?;
        let index = Arc::new(MemoryIndex::new());
        let buffer = Arc::new(IngestBuffer::new(
            policy,
            HeapObjectSizes::<MeasurementRecord>::default(),
            Arc::clone(&index) as Arc<dyn IndexTree<MeasurementRecord>>,
        )?);
        let workers = WorkerSupervisor::spawn(&buffer, &config.workers)?;

        info!(max_size = buffer.max_size(), "repository started");
        Ok(Self {
            config,
            buffer,
            index,
            workers: Mutex::new(Some(workers)),
            next_id: AtomicU64::new(1),
        })
    }

    /// Buffers a record under a new id and returns the id.
    pub fn put(&self, mut record: MeasurementRecord) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        record.id = id;
        self.buffer.put(record);
        id
    }

    /// Buffers every record; returns how many were added.
    pub fn put_all(&self, records: impl IntoIterator<Item = MeasurementRecord>) -> usize {
        records.into_iter().map(|record| self.put(record)).count()
    }

    /// Buffered, indexed records matching `query`, oldest first.
    pub fn query(&self, query: &IndexQuery) -> Vec<Arc<MeasurementRecord>> {
        self.index.query(query)
    }

    /// Gauge snapshot.
    pub fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }

    /// Drops every buffered record and resets the gauges.
    pub fn clear(&self) {
        self.buffer.clear_all();
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &Arc<IngestBuffer<MeasurementRecord>> {
        &self.buffer
    }

    /// The configuration the repository was built with.
    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Stops the workers. Buffered records stay queryable. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`](cmr_common::Error::Shutdown) if some workers
    /// did not stop within the configured timeout.
    pub fn shutdown(&self) -> Result<()> {
        let Some(mut workers) = self.workers.lock().take() else {
            return Ok(());
        };
        workers.shutdown(self.config.workers.shutdown_timeout)
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "repository workers did not stop cleanly");
        }
    }
}
