//! Measurement records shipped by agents.
//!
//! Every record carries the same header (who sent it, which sensor, which
//! method, when) and one kind-specific payload.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{PlatformIdent, SensorTypeIdent, Timestamp};
use crate::sizing::{MemoryLayout, Sizeable};

/// One measurement as received from an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    /// Server-assigned record id.
    pub id: u64,
    /// Platform (agent) the record came from.
    pub platform_ident: PlatformIdent,
    /// Sensor type that produced the record.
    pub sensor_type_ident: SensorTypeIdent,
    /// Instrumented method, if the sensor is method-bound.
    pub method_ident: Option<u64>,
    /// Time the measurement was taken.
    pub timestamp: Timestamp,
    /// Kind-specific payload.
    pub kind: MeasurementKind,
}

impl MeasurementRecord {
    /// Creates a record with no method binding.
    #[must_use]
    pub fn new(
        id: u64,
        platform_ident: PlatformIdent,
        sensor_type_ident: SensorTypeIdent,
        timestamp: Timestamp,
        kind: MeasurementKind,
    ) -> Self {
        Self {
            id,
            platform_ident,
            sensor_type_ident,
            method_ident: None,
            timestamp,
            kind,
        }
    }

    /// Binds the record to an instrumented method.
    pub fn with_method(mut self, method_ident: u64) -> Self {
        self.method_ident = Some(method_ident);
        self
    }
}

impl Sizeable for MeasurementRecord {
    fn heap_size(&self, layout: &MemoryLayout) -> u64 {
        self.kind.heap_size(layout)
    }
}

/// Kind-specific measurement payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MeasurementKind {
    /// Method timing.
    Timer(TimerData),
    /// A JDBC/SQL statement execution.
    Sql(SqlStatementData),
    /// A thrown, handled or passed exception.
    Exception(ExceptionData),
    /// Periodic system-level sample.
    System(SystemData),
}

impl MeasurementKind {
    /// Short name of the kind, as used in logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Timer(_) => "timer",
            Self::Sql(_) => "sql",
            Self::Exception(_) => "exception",
            Self::System(_) => "system",
        }
    }
}

impl Sizeable for MeasurementKind {
    fn heap_size(&self, layout: &MemoryLayout) -> u64 {
        match self {
            Self::Timer(_) | Self::System(_) => 0,
            Self::Sql(sql) => sql.heap_size(layout),
            Self::Exception(exception) => exception.heap_size(layout),
        }
    }
}

/// Aggregated timing of one method over an aggregation period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimerData {
    /// Number of invocations aggregated into this record.
    pub count: u64,
    /// Fastest invocation, in milliseconds.
    pub min: f64,
    /// Slowest invocation, in milliseconds.
    pub max: f64,
    /// Total duration, in milliseconds.
    pub duration: f64,
    /// Total CPU time, in milliseconds, if the agent measured it.
    pub cpu_duration: Option<f64>,
}

impl TimerData {
    /// A single invocation that took `duration` milliseconds.
    #[must_use]
    pub fn single(duration: f64) -> Self {
        Self {
            count: 1,
            min: duration,
            max: duration,
            duration,
            cpu_duration: None,
        }
    }

    /// Average duration per invocation.
    #[must_use]
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.duration / self.count as f64
        }
    }
}

/// A SQL statement execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlStatementData {
    /// Statement text as sent to the driver.
    pub sql: String,
    /// Bound parameter values, rendered as strings.
    pub parameters: SmallVec<[String; 4]>,
    /// Whether the statement was prepared.
    pub prepared: bool,
    /// Timing of the execution.
    pub timer: TimerData,
}

impl Sizeable for SqlStatementData {
    fn heap_size(&self, layout: &MemoryLayout) -> u64 {
        layout.string(&self.sql) + layout.string_smallvec(&self.parameters)
    }
}

/// What happened to an exception at the instrumented point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExceptionEvent {
    /// Created at the instrumented constructor.
    Created,
    /// Passed through the method without being caught.
    Passed,
    /// Caught and handled inside the method.
    Handled,
}

/// An exception observed by the exception sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionData {
    /// Fully qualified throwable type.
    pub throwable_type: String,
    /// Exception message, if any.
    pub message: Option<String>,
    /// Rendered stack trace, if captured.
    pub stack_trace: Option<String>,
    /// Where in its life cycle the exception was observed.
    pub event: ExceptionEvent,
}

impl Sizeable for ExceptionData {
    fn heap_size(&self, layout: &MemoryLayout) -> u64 {
        layout.string(&self.throwable_type)
            + layout.opt_string(&self.message)
            + layout.opt_string(&self.stack_trace)
    }
}

/// A periodic sample of the monitored process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemData {
    /// Heap in use, in bytes.
    pub heap_used: u64,
    /// Heap committed, in bytes.
    pub heap_committed: u64,
    /// Number of loaded classes.
    pub loaded_classes: u32,
    /// Live thread count.
    pub thread_count: u32,
    /// Process CPU usage in [0, 1].
    pub cpu_usage: f32,
}
