//! # cmr-common
//!
//! Foundation layer for CMR: measurement records, errors, and size estimation.
//!
//! This crate provides the building blocks shared by the buffer and the
//! facade. It has no internal dependencies and should be kept minimal.
//!
//! ## Modules
//!
//! - [`types`] - Measurement record model (timer, SQL, exception, system data)
//! - [`sizing`] - Heap footprint estimation for buffered records
//! - [`error`] - Crate-wide error type and result alias

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod sizing;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{Error, Result};
pub use sizing::{HeapObjectSizes, MemoryLayout, ObjectSizes, Sizeable};
pub use types::{
    ExceptionData, ExceptionEvent, MeasurementKind, MeasurementRecord, PlatformIdent,
    SensorTypeIdent, SqlStatementData, SystemData, TimerData, Timestamp,
};
