//! In-memory reference index.
//!
//! Entries are grouped by `(platform, sensor type)` and hold only a weak
//! descriptor of the payload: once the buffer evicts a slot, the entry goes
//! dead and the next [`clean`](IndexTree::clean) drops it.

use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use cmr_common::{MeasurementRecord, PlatformIdent, Result, SensorTypeIdent, Timestamp};
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use super::IndexTree;

/// Payloads the memory index can file.
pub trait Indexable {
    /// Platform that produced the payload.
    fn platform_ident(&self) -> PlatformIdent;
    /// Sensor type that produced the payload.
    fn sensor_type_ident(&self) -> SensorTypeIdent;
    /// Measurement time.
    fn timestamp(&self) -> Timestamp;
}

impl Indexable for MeasurementRecord {
    fn platform_ident(&self) -> PlatformIdent {
        self.platform_ident
    }

    fn sensor_type_ident(&self) -> SensorTypeIdent {
        self.sensor_type_ident
    }

    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

/// Filter for [`MemoryIndex::query`]. Unset fields match everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexQuery {
    /// Only payloads from this platform.
    pub platform: Option<PlatformIdent>,
    /// Only payloads from this sensor type.
    pub sensor_type: Option<SensorTypeIdent>,
    /// Only payloads at or after this time.
    pub from: Option<Timestamp>,
    /// Only payloads at or before this time.
    pub to: Option<Timestamp>,
    /// At most this many results.
    pub limit: Option<usize>,
}

impl IndexQuery {
    /// A query matching every live payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to one platform.
    pub fn platform(mut self, platform: PlatformIdent) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Restricts to one sensor type.
    pub fn sensor_type(mut self, sensor_type: SensorTypeIdent) -> Self {
        self.sensor_type = Some(sensor_type);
        self
    }

    /// Restricts to the inclusive time range `[from, to]`.
    pub fn between(mut self, from: Timestamp, to: Timestamp) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    /// Caps the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches_group(&self, key: &GroupKey) -> bool {
        self.platform.is_none_or(|p| p == key.0) && self.sensor_type.is_none_or(|s| s == key.1)
    }

    fn matches_time(&self, timestamp: Timestamp) -> bool {
        self.from.is_none_or(|from| timestamp >= from) && self.to.is_none_or(|to| timestamp <= to)
    }
}

type GroupKey = (PlatformIdent, SensorTypeIdent);

struct Entry<T> {
    order: u64,
    timestamp: Timestamp,
    payload: Weak<T>,
}

/// Reference [`IndexTree`] backed by hash-grouped weak descriptors.
pub struct MemoryIndex<T> {
    groups: RwLock<HashMap<GroupKey, Vec<Entry<T>>>>,
    next_order: AtomicU64,
}

impl<T> MemoryIndex<T> {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
            next_order: AtomicU64::new(0),
        }
    }

    /// Number of entries, dead or alive.
    pub fn entry_count(&self) -> usize {
        self.groups.read().values().map(Vec::len).sum()
    }

    /// Number of `(platform, sensor type)` groups.
    pub fn group_count(&self) -> usize {
        self.groups.read().len()
    }

    /// Live payloads matching `query`, in the order they were indexed.
    pub fn query(&self, query: &IndexQuery) -> Vec<Arc<T>> {
        let groups = self.groups.read();
        let mut hits: Vec<(u64, Arc<T>)> = groups
            .iter()
            .filter(|(key, _)| query.matches_group(key))
            .flat_map(|(_, entries)| entries.iter())
            .filter(|entry| query.matches_time(entry.timestamp))
            .filter_map(|entry| entry.payload.upgrade().map(|p| (entry.order, p)))
            .collect();
        drop(groups);

        hits.sort_unstable_by_key(|(order, _)| *order);
        let limit = query.limit.unwrap_or(usize::MAX);
        hits.into_iter().take(limit).map(|(_, p)| p).collect()
    }
}

impl<T> Default for MemoryIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> IndexTree<T> for MemoryIndex<T>
where
    T: Indexable + Send + Sync + 'static,
{
    fn put(&self, payload: &Arc<T>) -> Result<()> {
        let key = (payload.platform_ident(), payload.sensor_type_ident());
        let entry = Entry {
            order: self.next_order.fetch_add(1, Ordering::Relaxed),
            timestamp: payload.timestamp(),
            payload: Arc::downgrade(payload),
        };
        self.groups.write().entry(key).or_default().push(entry);
        Ok(())
    }

    fn component_size(&self) -> u64 {
        let groups = self.groups.read();
        let group_overhead = size_of::<GroupKey>() + size_of::<Vec<Entry<T>>>();
        let entries: usize = groups
            .values()
            .map(|entries| entries.capacity() * size_of::<Entry<T>>())
            .sum();
        (groups.capacity() * group_overhead + entries) as u64
    }

    fn clean(&self) {
        let mut groups = self.groups.write();
        let before: usize = groups.values().map(Vec::len).sum();
        groups.retain(|_, entries| {
            entries.retain(|entry| entry.payload.strong_count() > 0);
            if entries.len() * 2 < entries.capacity() {
                entries.shrink_to_fit();
            }
            !entries.is_empty()
        });
        let after: usize = groups.values().map(Vec::len).sum();
        debug!(removed = before - after, remaining = after, "index cleaned");
    }

    fn clear_all(&self) {
        self.groups.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmr_common::{MeasurementKind, TimerData};

    fn record(id: u64, platform: u64, sensor: u64, at: u64) -> Arc<MeasurementRecord> {
        Arc::new(MeasurementRecord::new(
            id,
            PlatformIdent::new(platform),
            SensorTypeIdent::new(sensor),
            Timestamp::from_millis(at),
            MeasurementKind::Timer(TimerData::single(1.0)),
        ))
    }

    fn ids(hits: &[Arc<MeasurementRecord>]) -> Vec<u64> {
        hits.iter().map(|r| r.id).collect()
    }

    #[test]
    fn test_query_filters_and_keeps_order() {
        let index = MemoryIndex::<MeasurementRecord>::new();
        let records: Vec<_> = vec![
            record(1, 1, 10, 100),
            record(2, 2, 10, 200),
            record(3, 1, 20, 300),
            record(4, 1, 10, 400),
        ];
        for r in &records {
            index.put(r).unwrap();
        }

        assert_eq!(ids(&index.query(&IndexQuery::new())), vec![1, 2, 3, 4]);
        assert_eq!(
            ids(&index.query(&IndexQuery::new().platform(PlatformIdent::new(1)))),
            vec![1, 3, 4]
        );
        assert_eq!(
            ids(&index.query(
                &IndexQuery::new()
                    .platform(PlatformIdent::new(1))
                    .sensor_type(SensorTypeIdent::new(10))
            )),
            vec![1, 4]
        );
        assert_eq!(
            ids(&index.query(
                &IndexQuery::new().between(Timestamp::from_millis(150), Timestamp::from_millis(300))
            )),
            vec![2, 3]
        );
        assert_eq!(ids(&index.query(&IndexQuery::new().limit(2))), vec![1, 2]);
        assert_eq!(index.group_count(), 3);
    }

    #[test]
    fn test_dropped_payloads_vanish_and_clean_removes_them() {
        let index = MemoryIndex::<MeasurementRecord>::new();
        let kept = record(1, 1, 1, 1);
        let dropped = record(2, 1, 1, 2);
        let lonely = record(3, 9, 9, 3);
        index.put(&kept).unwrap();
        index.put(&dropped).unwrap();
        index.put(&lonely).unwrap();
        drop(dropped);
        drop(lonely);

        assert_eq!(ids(&index.query(&IndexQuery::new())), vec![1]);
        assert_eq!(index.entry_count(), 3);

        index.clean();
        assert_eq!(index.entry_count(), 1);
        assert_eq!(index.group_count(), 1);
    }

    #[test]
    fn test_component_size_grows_and_clear_all_empties() {
        let index = MemoryIndex::<MeasurementRecord>::new();
        assert_eq!(index.component_size(), 0);

        let records: Vec<_> = (0..100).map(|i| record(i, i % 4, 1, i)).collect();
        for r in &records {
            index.put(r).unwrap();
        }
        assert!(index.component_size() >= 100 * size_of::<Entry<MeasurementRecord>>() as u64);

        index.clear_all();
        assert_eq!(index.entry_count(), 0);
        assert!(index.query(&IndexQuery::new()).is_empty());
    }

    #[test]
    fn test_cleanup_runs_on_executor() {
        let index = Arc::new(MemoryIndex::<MeasurementRecord>::new());
        let gone = record(1, 1, 1, 1);
        index.put(&gone).unwrap();
        drop(gone);

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        Arc::clone(&index).cleanup(&pool);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while index.entry_count() != 0 && std::time::Instant::now() < deadline {
            std::thread::yield_now();
        }
        assert_eq!(index.entry_count(), 0);
    }
}
