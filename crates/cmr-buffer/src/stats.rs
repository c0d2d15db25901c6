//! Point-in-time buffer statistics.

use std::fmt;

use serde::Serialize;

/// Snapshot of the buffer gauges.
///
/// Counters are read one by one without a common lock, so a snapshot taken
/// while workers run may be off by the slots processed in between.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BufferStats {
    /// Slots inserted since the last clear.
    pub inserted_count: u64,
    /// Slots analyzed since the last clear.
    pub analyzed_count: u64,
    /// Slots indexed since the last clear.
    pub indexed_count: u64,
    /// Slots removed by eviction since the last clear.
    pub evicted_count: u64,
    /// Slots currently held.
    pub len: usize,
    /// Estimated occupied bytes, including the index footprint.
    pub current_size: u64,
    /// Byte budget.
    pub max_size: u64,
    /// `current_size / max_size`.
    pub occupancy: f64,
    /// Occupancy above which eviction is requested.
    pub eviction_occupancy: f64,
    /// Expansion rate applied to newly analyzed slots.
    pub expansion_rate: f64,
    /// Bytes added by analysis since the last clear.
    pub data_added_bytes: u64,
    /// Bytes removed by eviction since the last clear.
    pub data_removed_bytes: u64,
    /// Last measured index footprint.
    pub index_tree_size: u64,
}

/// Format bytes as human-readable string.
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} bytes")
    }
}

impl fmt::Display for BufferStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Buffer: {} / {} ({:.2}%, evicts above {:.2}%)",
            format_bytes(self.current_size),
            format_bytes(self.max_size),
            self.occupancy * 100.0,
            self.eviction_occupancy * 100.0
        )?;
        writeln!(
            f,
            "Slots: {} held, {} inserted, {} analyzed, {} indexed, {} evicted",
            self.len, self.inserted_count, self.analyzed_count, self.indexed_count, self.evicted_count
        )?;
        write!(
            f,
            "Data: {} added, {} removed, index {}, expansion {:.2}%",
            format_bytes(self.data_added_bytes),
            format_bytes(self.data_removed_bytes),
            format_bytes(self.index_tree_size),
            self.expansion_rate * 100.0
        )
    }
}
