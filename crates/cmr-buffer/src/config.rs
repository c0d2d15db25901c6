//! Buffer configuration.
//!
//! All values are read once when the buffer is built. Only the max size and the
//! eviction occupancy can be changed afterwards, through the buffer itself.

use std::time::Duration;

use cmr_common::{Error, Result};
use serde::{Deserialize, Serialize};

const MIB: u64 = 1024 * 1024;

/// Configuration of the ingest buffer and its capacity policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Explicit byte budget. When set, the heap-fraction interpolation is skipped.
    pub max_size: Option<u64>,
    /// Occupancy above which the buffer asks for eviction.
    pub eviction_occupancy_percentage: f64,
    /// Fraction of the occupied bytes one eviction pass removes.
    pub eviction_fragment_size_percentage: f64,
    /// Bytes, relative to the budget, that must be indexed (resp. evicted)
    /// before the index footprint is re-measured (resp. the index is cleaned).
    pub bytes_maintenance_percentage: f64,
    /// Absolute maintenance threshold in bytes; overrides the percentage.
    pub maintenance_threshold: Option<u64>,
    /// Absolute cleanup threshold in bytes; overrides the percentage.
    pub cleanup_threshold: Option<u64>,
    /// Smallest safety margin added to a measured object size.
    pub min_object_expansion_rate: f64,
    /// Largest safety margin added to a measured object size.
    pub max_object_expansion_rate: f64,
    /// Buffer size up to which the largest margin applies.
    pub max_object_expansion_rate_active_till_buffer_size: u64,
    /// Buffer size from which the smallest margin applies.
    pub min_object_expansion_rate_active_from_buffer_size: u64,
    /// Heap occupancy up to which the smallest margin applies.
    pub min_object_expansion_rate_active_till_occupancy: f64,
    /// Heap occupancy from which the largest margin applies.
    pub max_object_expansion_rate_active_from_occupancy: f64,
    /// Fraction of the heap reserved on small heaps.
    pub min_old_space_occupancy: f64,
    /// Fraction of the heap reserved on large heaps.
    pub max_old_space_occupancy: f64,
    /// Heap size up to which the small-heap fraction applies.
    pub min_old_space_occupancy_active_till_old_gen_size: u64,
    /// Heap size from which the large-heap fraction applies.
    pub max_old_space_occupancy_active_from_old_gen_size: u64,
    /// How long an indexer waits for the next slot to be analyzed.
    #[serde(with = "duration_millis")]
    pub indexing_wait_time: Duration,
    /// Threads in the pool that runs index cleanups.
    pub indexing_tree_cleaning_threads: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            eviction_occupancy_percentage: 0.8,
            eviction_fragment_size_percentage: 0.2,
            bytes_maintenance_percentage: 0.05,
            maintenance_threshold: None,
            cleanup_threshold: None,
            min_object_expansion_rate: 0.1,
            max_object_expansion_rate: 0.35,
            max_object_expansion_rate_active_till_buffer_size: 128 * MIB,
            min_object_expansion_rate_active_from_buffer_size: 1536 * MIB,
            min_object_expansion_rate_active_till_occupancy: 0.3,
            max_object_expansion_rate_active_from_occupancy: 0.6,
            min_old_space_occupancy: 0.3,
            max_old_space_occupancy: 0.6,
            min_old_space_occupancy_active_till_old_gen_size: 256 * MIB,
            max_old_space_occupancy_active_from_old_gen_size: 2048 * MIB,
            indexing_wait_time: Duration::from_millis(500),
            indexing_tree_cleaning_threads: 1,
        }
    }
}

impl BufferConfig {
    /// Pins the byte budget.
    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size = Some(bytes);
        self
    }

    /// Sets the occupancy above which eviction is requested.
    pub fn with_eviction_occupancy_percentage(mut self, percentage: f64) -> Self {
        self.eviction_occupancy_percentage = percentage;
        self
    }

    /// Sets the fraction of occupied bytes one eviction pass removes.
    pub fn with_eviction_fragment_size_percentage(mut self, percentage: f64) -> Self {
        self.eviction_fragment_size_percentage = percentage;
        self
    }

    /// Sets an absolute maintenance threshold in bytes.
    pub fn with_maintenance_threshold(mut self, bytes: u64) -> Self {
        self.maintenance_threshold = Some(bytes);
        self
    }

    /// Sets an absolute cleanup threshold in bytes.
    pub fn with_cleanup_threshold(mut self, bytes: u64) -> Self {
        self.cleanup_threshold = Some(bytes);
        self
    }

    /// Sets the expansion rate bounds.
    pub fn with_object_expansion_rates(mut self, min: f64, max: f64) -> Self {
        self.min_object_expansion_rate = min;
        self.max_object_expansion_rate = max;
        self
    }

    /// Uses one expansion rate regardless of buffer size and occupancy.
    pub fn with_fixed_expansion_rate(self, rate: f64) -> Self {
        self.with_object_expansion_rates(rate, rate)
    }

    /// Sets how long indexers wait for unanalyzed slots.
    pub fn with_indexing_wait_time(mut self, wait: Duration) -> Self {
        self.indexing_wait_time = wait;
        self
    }

    /// Sets the size of the index cleanup pool.
    pub fn with_indexing_tree_cleaning_threads(mut self, threads: usize) -> Self {
        self.indexing_tree_cleaning_threads = threads;
        self
    }

    /// Checks every value against its allowed range.
    pub fn validate(&self) -> Result<()> {
        within(
            "eviction_occupancy_percentage",
            self.eviction_occupancy_percentage,
            0.0,
            1.0,
        )?;
        open_fraction(
            "eviction_fragment_size_percentage",
            self.eviction_fragment_size_percentage,
        )?;

        if let Some(0) = self.max_size {
            return Err(Error::config("max_size", "must be greater than zero"));
        }

        if self.maintenance_threshold.is_none() || self.cleanup_threshold.is_none() {
            open_fraction(
                "bytes_maintenance_percentage",
                self.bytes_maintenance_percentage,
            )?;
        }

        // expansion rate
        if self.min_object_expansion_rate < 0.0 {
            return Err(Error::config(
                "min_object_expansion_rate",
                format!("must not be negative, got {}", self.min_object_expansion_rate),
            ));
        }
        if self.min_object_expansion_rate > self.max_object_expansion_rate {
            return Err(Error::config(
                "min_object_expansion_rate",
                format!(
                    "must not exceed max_object_expansion_rate ({} > {})",
                    self.min_object_expansion_rate, self.max_object_expansion_rate
                ),
            ));
        }
        if self.min_object_expansion_rate_active_from_buffer_size
            < self.max_object_expansion_rate_active_till_buffer_size
        {
            return Err(Error::config(
                "min_object_expansion_rate_active_from_buffer_size",
                format!(
                    "must not be lower than max_object_expansion_rate_active_till_buffer_size ({} < {})",
                    self.min_object_expansion_rate_active_from_buffer_size,
                    self.max_object_expansion_rate_active_till_buffer_size
                ),
            ));
        }
        open_fraction(
            "min_object_expansion_rate_active_till_occupancy",
            self.min_object_expansion_rate_active_till_occupancy,
        )?;
        open_fraction(
            "max_object_expansion_rate_active_from_occupancy",
            self.max_object_expansion_rate_active_from_occupancy,
        )?;
        if self.min_object_expansion_rate_active_till_occupancy
            > self.max_object_expansion_rate_active_from_occupancy
        {
            return Err(Error::config(
                "min_object_expansion_rate_active_till_occupancy",
                format!(
                    "must not be higher than max_object_expansion_rate_active_from_occupancy ({} > {})",
                    self.min_object_expansion_rate_active_till_occupancy,
                    self.max_object_expansion_rate_active_from_occupancy
                ),
            ));
        }

        // old space
        open_fraction("min_old_space_occupancy", self.min_old_space_occupancy)?;
        open_fraction("max_old_space_occupancy", self.max_old_space_occupancy)?;
        if self.min_old_space_occupancy > self.max_old_space_occupancy {
            return Err(Error::config(
                "min_old_space_occupancy",
                format!(
                    "must not be higher than max_old_space_occupancy ({} > {})",
                    self.min_old_space_occupancy, self.max_old_space_occupancy
                ),
            ));
        }
        if self.min_old_space_occupancy_active_till_old_gen_size == 0 {
            return Err(Error::config(
                "min_old_space_occupancy_active_till_old_gen_size",
                "must be greater than zero",
            ));
        }
        if self.max_old_space_occupancy_active_from_old_gen_size
            < self.min_old_space_occupancy_active_till_old_gen_size
        {
            return Err(Error::config(
                "max_old_space_occupancy_active_from_old_gen_size",
                format!(
                    "must not be lower than min_old_space_occupancy_active_till_old_gen_size ({} < {})",
                    self.max_old_space_occupancy_active_from_old_gen_size,
                    self.min_old_space_occupancy_active_till_old_gen_size
                ),
            ));
        }

        // indexing
        if self.indexing_tree_cleaning_threads == 0 {
            return Err(Error::config(
                "indexing_tree_cleaning_threads",
                "must be greater than zero",
            ));
        }
        if self.indexing_wait_time.is_zero() {
            return Err(Error::config(
                "indexing_wait_time",
                "must be greater than zero",
            ));
        }

        Ok(())
    }
}

/// Requires `lo <= value <= hi`.
fn within(key: &'static str, value: f64, lo: f64, hi: f64) -> Result<()> {
    if value.is_nan() || value < lo || value > hi {
        return Err(Error::config(
            key,
            format!("must be within [{lo}, {hi}], got {value}"),
        ));
    }
    Ok(())
}

/// Requires `0 < value <= 1`.
fn open_fraction(key: &'static str, value: f64) -> Result<()> {
    if value.is_nan() || value <= 0.0 || value > 1.0 {
        return Err(Error::config(
            key,
            format!("must be within (0, 1], got {value}"),
        ));
    }
    Ok(())
}

/// Serializes a [`Duration`] as whole milliseconds.
pub(crate) mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
