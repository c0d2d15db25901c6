//! Error types for CMR.
//!
//! The ingest path itself never fails: `put`, `evict` and `clear_all` are
//! infallible. Errors surface at construction (bad configuration, unknown host
//! capacity), from collaborators (sizing, indexing), and at shutdown.

use thiserror::Error;

/// Result alias used across CMR crates.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A configuration value is out of its allowed range.
    #[error("invalid configuration for `{key}`: {message}")]
    Config {
        /// Name of the offending configuration key.
        key: &'static str,
        /// What is wrong with it.
        message: String,
    },

    /// The capacity of the host could not be determined.
    #[error("capacity error: {0}")]
    Capacity(String),

    /// The index tree rejected a payload.
    #[error("index error: {0}")]
    Index(String),

    /// A size could not be computed for a payload.
    #[error("sizing error: {0}")]
    Sizing(String),

    /// A worker thread could not be started.
    #[error("worker error: {0}")]
    Worker(String),

    /// Workers did not stop within the shutdown timeout.
    #[error("shutdown timed out, {stragglers} worker(s) still running")]
    Shutdown {
        /// Number of workers that had not exited.
        stragglers: usize,
    },
}

impl Error {
    /// Creates a configuration error for `key`.
    pub fn config(key: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            key,
            message: message.into(),
        }
    }
}
