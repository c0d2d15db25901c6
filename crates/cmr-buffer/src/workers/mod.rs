//! Background roles that drive the buffer.
//!
//! | Role | Count | Loop |
//! |------|-------|------|
//! | [`BufferAnalyzer`] | `analyzers` | size the next slot |
//! | [`BufferIndexer`] | `indexers` | index the next analyzed slot |
//! | [`BufferEvictor`] | 0 or 1 | wait for pressure, evict |
//!
//! Every role runs until its [`CancellationToken`] fires. The
//! [`WorkerSupervisor`] owns the threads and joins them on shutdown.

mod analyzer;
mod evictor;
mod indexer;
mod supervisor;

pub use analyzer::BufferAnalyzer;
pub use evictor::BufferEvictor;
pub use indexer::BufferIndexer;
pub use supervisor::WorkerSupervisor;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cmr_common::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Shared stop flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// A token that has not fired.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the token. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether the token has fired.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A long-running role.
pub trait Worker: Send + 'static {
    /// Thread name.
    fn name(&self) -> String;

    /// Runs until `token` is cancelled.
    fn run(&mut self, token: &CancellationToken);
}

/// How many workers of each role to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Analyzer threads.
    pub analyzers: usize,
    /// Indexer threads.
    pub indexers: usize,
    /// Whether to start the eviction worker.
    pub evictor: bool,
    /// Longest a parked analyzer or the evictor sleeps before re-checking.
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
    /// How long shutdown waits for workers to exit.
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            analyzers: 1,
            indexers: 1,
            evictor: true,
            poll_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl WorkerConfig {
    /// Sets the analyzer and indexer counts.
    pub fn with_threads(mut self, analyzers: usize, indexers: usize) -> Self {
        self.analyzers = analyzers;
        self.indexers = indexers;
        self
    }

    /// Enables or disables the eviction worker.
    pub fn with_evictor(mut self, evictor: bool) -> Self {
        self.evictor = evictor;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Checks the counts and intervals.
    pub fn validate(&self) -> Result<()> {
        if self.analyzers == 0 {
            return Err(Error::config("analyzers", "must be greater than zero"));
        }
        if self.indexers == 0 {
            return Err(Error::config("indexers", "must be greater than zero"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::config("poll_interval", "must be greater than zero"));
        }
        Ok(())
    }
}
