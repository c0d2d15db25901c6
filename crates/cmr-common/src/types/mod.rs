//! Core type definitions for CMR.
//!
//! This module contains the measurement model shipped by agents:
//! - Identifier types ([`PlatformIdent`], [`SensorTypeIdent`])
//! - Temporal types ([`Timestamp`])
//! - Records ([`MeasurementRecord`] and its [`MeasurementKind`] payloads)

mod id;
mod record;
mod timestamp;

pub use id::{PlatformIdent, SensorTypeIdent};
pub use record::{
    ExceptionData, ExceptionEvent, MeasurementKind, MeasurementRecord, SqlStatementData,
    SystemData, TimerData,
};
pub use timestamp::Timestamp;
