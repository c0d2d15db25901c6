//! Capacity policy: the byte budget and the per-object safety margin.
//!
//! Everything here is a pure function of the configuration and of the heap
//! capacity reported once by a [`CapacityProbe`]. The buffer caches the
//! values it needs and asks again only when its max size is changed.
//!
//! # Budget
//!
//! ```text
//! fraction
//!   max ┤                 ┌──────────
//!       │               ╱
//!   min ┤──────────────╱
//!       └──────────────┬──┬────────── heap
//!                   till  from
//! ```
//!
//! Small heaps reserve `min_old_space_occupancy` of themselves, large heaps
//! `max_old_space_occupancy`, with a linear ramp between the two breakpoints.
//!
//! # Expansion rate
//!
//! The average of a size-based rate (large margin for small buffers) and an
//! occupancy-based rate (large margin when the buffer takes most of the heap).

use std::time::Duration;

use cmr_common::{Error, Result};
use tracing::info;

use crate::capacity::{CapacityProbe, FixedCapacity};
use crate::config::BufferConfig;

/// Derives budget, expansion rates and thresholds from a [`BufferConfig`].
#[derive(Debug, Clone)]
pub struct CapacityPolicy {
    config: BufferConfig,
    heap_capacity: u64,
}

impl CapacityPolicy {
    /// Validates `config` and reads the heap capacity from `probe`.
    ///
    /// If the probe cannot tell the capacity, an explicit `max_size` stands in
    /// for it; without one the policy cannot be built.
    pub fn new(config: BufferConfig, probe: &dyn CapacityProbe) -> Result<Self> {
        config.validate()?;

        let heap_capacity = match (probe.managed_heap_capacity(), config.max_size) {
            (0, Some(max_size)) => max_size,
            (0, None) => {
                return Err(Error::Capacity(
                    "the host heap capacity is unknown; configure an explicit max_size".into(),
                ));
            }
            (capacity, _) => capacity,
        };

        let policy = Self {
            config,
            heap_capacity,
        };

        let budget = policy.capacity_budget();
        info!(
            heap_capacity,
            budget,
            eviction_occupancy = policy.config.eviction_occupancy_percentage,
            eviction_fragment = policy.config.eviction_fragment_size_percentage,
            expansion_rate = policy.expansion_rate(budget),
            maintenance_threshold = policy.maintenance_threshold_for(budget),
            cleanup_threshold = policy.cleanup_threshold_for(budget),
            indexing_wait_ms = policy.config.indexing_wait_time.as_millis() as u64,
            cleaning_threads = policy.config.indexing_tree_cleaning_threads,
            "capacity policy initialized"
        );

        Ok(policy)
    }

    /// A policy whose heap and budget are both exactly `budget` bytes.
    pub fn fixed(config: BufferConfig, budget: u64) -> Result<Self> {
        Self::new(config.with_max_size(budget), &FixedCapacity(budget))
    }

    /// The configuration this policy was built from.
    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Heap capacity reported by the probe at construction.
    pub fn heap_capacity(&self) -> u64 {
        self.heap_capacity
    }

    /// The buffer's byte budget.
    pub fn capacity_budget(&self) -> u64 {
        if let Some(max_size) = self.config.max_size {
            return max_size;
        }
        let heap = self.heap_capacity as f64;
        let fraction = ramp(
            heap,
            self.config.min_old_space_occupancy_active_till_old_gen_size as f64,
            self.config.max_old_space_occupancy_active_from_old_gen_size as f64,
            self.config.min_old_space_occupancy,
            self.config.max_old_space_occupancy,
        );
        (heap * fraction) as u64
    }

    /// Safety margin for objects added to a buffer of `buffer_size` bytes.
    ///
    /// Always within `[min_object_expansion_rate, max_object_expansion_rate]`.
    pub fn expansion_rate(&self, buffer_size: u64) -> f64 {
        let rate = (self.expansion_rate_by_size(buffer_size)
            + self.expansion_rate_by_occupancy(buffer_size))
            / 2.0;
        rate.clamp(
            self.config.min_object_expansion_rate,
            self.config.max_object_expansion_rate,
        )
    }

    /// Size-based rate: the max rate for small buffers, the min rate for large ones.
    pub fn expansion_rate_by_size(&self, buffer_size: u64) -> f64 {
        ramp(
            buffer_size as f64,
            self.config.max_object_expansion_rate_active_till_buffer_size as f64,
            self.config.min_object_expansion_rate_active_from_buffer_size as f64,
            self.config.max_object_expansion_rate,
            self.config.min_object_expansion_rate,
        )
    }

    /// Occupancy-based rate: grows with the share of the heap the buffer takes.
    pub fn expansion_rate_by_occupancy(&self, buffer_size: u64) -> f64 {
        let occupancy = buffer_size as f64 / self.heap_capacity as f64;
        ramp(
            occupancy,
            self.config.min_object_expansion_rate_active_till_occupancy,
            self.config.max_object_expansion_rate_active_from_occupancy,
            self.config.min_object_expansion_rate,
            self.config.max_object_expansion_rate,
        )
    }

    /// Indexed bytes between two measurements of the index footprint.
    pub fn maintenance_threshold(&self) -> u64 {
        self.maintenance_threshold_for(self.capacity_budget())
    }

    /// Maintenance threshold for a buffer whose budget is `budget` bytes.
    pub fn maintenance_threshold_for(&self, budget: u64) -> u64 {
        self.config
            .maintenance_threshold
            .unwrap_or_else(|| self.bytes_share(budget))
    }

    /// Evicted bytes between two index cleanups.
    pub fn cleanup_threshold(&self) -> u64 {
        self.cleanup_threshold_for(self.capacity_budget())
    }

    /// Cleanup threshold for a buffer whose budget is `budget` bytes.
    pub fn cleanup_threshold_for(&self, budget: u64) -> u64 {
        self.config
            .cleanup_threshold
            .unwrap_or_else(|| self.bytes_share(budget))
    }

    /// Occupancy above which eviction is requested.
    pub fn eviction_occupancy_percentage(&self) -> f64 {
        self.config.eviction_occupancy_percentage
    }

    /// Fraction of occupied bytes one eviction pass removes.
    pub fn eviction_fragment_size_percentage(&self) -> f64 {
        self.config.eviction_fragment_size_percentage
    }

    /// How long indexers wait for unanalyzed slots.
    pub fn indexing_wait_time(&self) -> Duration {
        self.config.indexing_wait_time
    }

    /// Threads in the index cleanup pool.
    pub fn indexing_tree_cleaning_threads(&self) -> usize {
        self.config.indexing_tree_cleaning_threads
    }

    fn bytes_share(&self, budget: u64) -> u64 {
        (self.config.bytes_maintenance_percentage * budget as f64) as u64
    }
}

/// `y0` up to `x0`, `y1` from `x1`, linear in between.
fn ramp(x: f64, x0: f64, x1: f64, y0: f64, y1: f64) -> f64 {
    if x <= x0 {
        y0
    } else if x >= x1 {
        y1
    } else {
        let y = y0 + (y1 - y0) * ((x - x0) / (x1 - x0));
        y.clamp(y0.min(y1), y0.max(y1))
    }
}
