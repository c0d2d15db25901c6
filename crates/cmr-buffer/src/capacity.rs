//! Host capacity probes.
//!
//! The policy only needs one number from the host: how many bytes the
//! long-lived part of the process may grow to. Native processes have no
//! managed heap, so the probes here report either a fixed figure or the
//! physical memory of the machine.

/// Reports the managed heap capacity the buffer budget is derived from.
pub trait CapacityProbe: Send + Sync {
    /// Capacity in bytes, or 0 when it cannot be determined.
    fn managed_heap_capacity(&self) -> u64;
}

/// A probe that always reports the same capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedCapacity(pub u64);

impl CapacityProbe for FixedCapacity {
    fn managed_heap_capacity(&self) -> u64 {
        self.0
    }
}

/// Reports the physical memory of the host.
///
/// Reads `MemTotal` from `/proc/meminfo`; on other platforms, or if the file
/// is unreadable, reports 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemMemory;

impl SystemMemory {
    /// Parses the `MemTotal` line of a meminfo dump.
    fn parse_meminfo(meminfo: &str) -> Option<u64> {
        meminfo
            .lines()
            .find(|line| line.starts_with("MemTotal:"))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
            .map(|kb| kb * 1024)
    }
}

impl CapacityProbe for SystemMemory {
    fn managed_heap_capacity(&self) -> u64 {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(meminfo) => Self::parse_meminfo(&meminfo).unwrap_or(0),
            Err(_) => 0,
        }
    }
}
