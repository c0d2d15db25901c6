//! # cmr-buffer
//!
//! The self-sizing ingest buffer of the measurement repository.
//!
//! Producers [`put`](IngestBuffer::put) measurements; background workers size
//! them, hand them to an [`IndexTree`], and evict the oldest ones once the
//! buffer's estimated occupancy crosses a threshold. The byte budget and the
//! safety margin applied to each measured size come from a
//! [`CapacityPolicy`].
//!
//! ## Modules
//!
//! - [`config`] - Buffer configuration and validation
//! - [`capacity`] - Host capacity probes
//! - [`properties`] - Budget, expansion-rate and threshold calculations
//! - [`buffer`] - The buffer itself
//! - [`index`] - The index tree seam and an in-memory implementation
//! - [`workers`] - Analyzer, indexer and evictor roles and their supervisor
//! - [`stats`] - Gauge snapshots

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod buffer;
pub mod capacity;
pub mod config;
pub mod index;
pub mod properties;
pub mod stats;
pub mod workers;

mod slot;

pub use buffer::{EvictionSummary, IngestBuffer};
pub use capacity::{CapacityProbe, FixedCapacity, SystemMemory};
pub use config::BufferConfig;
pub use index::{IndexQuery, IndexTree, Indexable, MemoryIndex};
pub use properties::CapacityPolicy;
pub use stats::BufferStats;
pub use workers::{CancellationToken, WorkerConfig, WorkerSupervisor};
