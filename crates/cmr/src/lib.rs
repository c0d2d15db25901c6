//! # CMR
//!
//! Central measurement repository: the server-side buffer that monitoring
//! agents stream timer, SQL, exception and system measurements into.
//!
//! Start with [`Repository`]. It sizes a buffer for the host, starts the
//! analyzer, indexer and evictor threads, and answers queries from the
//! in-memory index.
//!
//! ## Quick Start
//!
//! ```rust
//! use cmr::{
//!     IndexQuery, MeasurementKind, MeasurementRecord, PlatformIdent, Repository,
//!     RepositoryConfig, SensorTypeIdent, TimerData, Timestamp,
//! };
//!
//! let repository = Repository::with_config(RepositoryConfig::with_budget(64 * 1024 * 1024))?;
//!
//! repository.put(MeasurementRecord::new(
//!     0,
//!     PlatformIdent::new(1),
//!     SensorTypeIdent::new(1),
//!     Timestamp::now(),
//!     MeasurementKind::Timer(TimerData::single(12.5)),
//! ));
//!
//! let stats = repository.stats();
//! assert_eq!(stats.inserted_count, 1);
//!
//! repository.shutdown()?;
//! # Ok::<(), cmr::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod repository;

pub use repository::{Repository, RepositoryConfig};

// Re-export the buffer API
pub use cmr_buffer::{
    BufferConfig, BufferStats, CapacityPolicy, CapacityProbe, EvictionSummary, FixedCapacity,
    IndexQuery, IndexTree, Indexable, IngestBuffer, MemoryIndex, SystemMemory, WorkerConfig,
    WorkerSupervisor,
};

// Re-export the record model and errors
pub use cmr_common::{
    Error, ExceptionData, ExceptionEvent, HeapObjectSizes, MeasurementKind, MeasurementRecord,
    MemoryLayout, ObjectSizes, PlatformIdent, Result, SensorTypeIdent, Sizeable,
    SqlStatementData, SystemData, TimerData, Timestamp,
};
