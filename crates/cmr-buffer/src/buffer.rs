//! The ingest buffer.
//!
//! Slots live in an arena addressed by sequence number. Producers append at
//! the tail; analyzers and indexers each advance their own cursor from head to
//! tail, claiming one slot at a time with a compare-and-swap, so every slot is
//! processed exactly once per phase and in insertion order. Eviction pops
//! analyzed slots off the head.
//!
//! ```text
//!  head_seq                                               next_seq (tail)
//!     │                                                        │
//!     ▼                                                        ▼
//!   ┌────┬────┬────┬────┬────┬────┬────┬────┬────┬────┐
//!   │ A I│ A I│ A I│ A  │ A  │ A  │    │    │    │    │
//!   └────┴────┴────┴────┴────┴────┴────┴────┴────┴────┘
//!                     ▲              ▲
//!             indexing_cursor   analysis_cursor
//! ```
//!
//! # Locks
//!
//! - `chain`: short critical sections around the arena itself.
//! - `clear_lock`: every operation that touches slots holds it shared;
//!   [`IngestBuffer::clear_all`] holds it exclusively, so it never observes a
//!   half-processed slot.
//! - `evict_lock`: serializes eviction passes.
//!
//! Lock order is `evict_lock`, then `clear_lock`, then `chain`.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use cmr_common::{Error, ObjectSizes, Result};
use parking_lot::{Condvar, Mutex, RwLock};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::index::IndexTree;
use crate::properties::CapacityPolicy;
use crate::slot::Slot;
use crate::stats::BufferStats;

/// Outcome of one [`IngestBuffer::evict`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvictionSummary {
    /// Bytes the pass aimed to remove.
    pub target_bytes: u64,
    /// Bytes actually removed.
    pub evicted_bytes: u64,
    /// Slots removed.
    pub evicted_slots: u64,
    /// The pass stopped at a slot whose size is not known yet.
    pub stopped_early: bool,
}

struct Chain<T> {
    slots: VecDeque<Arc<Slot<T>>>,
    /// Sequence number of `slots[0]`.
    head_seq: u64,
    /// Sequence number the next `put` gets.
    next_seq: u64,
}

impl<T> Chain<T> {
    fn get(&self, seq: u64) -> Option<&Arc<Slot<T>>> {
        let offset = seq.checked_sub(self.head_seq)?;
        self.slots.get(usize::try_from(offset).ok()?)
    }
}

/// A mutex/condvar pair workers park on.
///
/// A wait ends on the first notification or at the timeout, whichever comes
/// first; callers re-check their condition and decide whether to wait again.
struct Signal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    fn wait_unless(&self, ready: impl Fn() -> bool, timeout: Duration) {
        if timeout.is_zero() {
            return;
        }
        let mut guard = self.lock.lock();
        if ready() {
            return;
        }
        match Instant::now().checked_add(timeout) {
            Some(deadline) => {
                let _ = self.cond.wait_until(&mut guard, deadline);
            }
            None => self.cond.wait(&mut guard),
        }
    }

    fn notify_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

/// Concurrent, size-bounded, self-sizing buffer of payloads.
pub struct IngestBuffer<T: Send + Sync + 'static> {
    policy: CapacityPolicy,
    sizer: Box<dyn ObjectSizes<T>>,
    index: Arc<dyn IndexTree<T>>,
    cleaner: ThreadPool,

    chain: Mutex<Chain<T>>,
    /// Mirrors `chain.next_seq`, published after the slot is in place.
    tail: AtomicU64,
    analysis_cursor: AtomicU64,
    indexing_cursor: AtomicU64,
    clear_lock: RwLock<()>,
    evict_lock: Mutex<()>,

    max_size: AtomicU64,
    /// f64 bits.
    eviction_occupancy: AtomicU64,
    /// f64 bits.
    expansion_rate: AtomicU64,
    maintenance_threshold: AtomicU64,
    cleanup_threshold: AtomicU64,

    current_size: AtomicU64,
    inserted_count: AtomicU64,
    analyzed_count: AtomicU64,
    indexed_count: AtomicU64,
    evicted_count: AtomicU64,
    data_added_bytes: AtomicU64,
    data_removed_bytes: AtomicU64,
    index_tree_size: AtomicU64,
    bytes_since_maintenance: AtomicU64,
    bytes_since_cleanup: AtomicU64,

    analysis_signal: Signal,
    indexing_signal: Signal,
    eviction_signal: Signal,
}

impl<T: Send + Sync + 'static> IngestBuffer<T> {
    /// Creates an empty buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cleanup pool cannot be started.
    pub fn new(
        policy: CapacityPolicy,
        sizer: impl ObjectSizes<T> + 'static,
        index: Arc<dyn IndexTree<T>>,
    ) -> Result<Self> {
        let cleaner = ThreadPoolBuilder::new()
            .num_threads(policy.indexing_tree_cleaning_threads())
            .thread_name(|i| format!("cmr-index-cleaner-{i}"))
            .panic_handler(|_| warn!("index cleanup panicked"))
            .build()
            .map_err(|e| Error::Worker(e.to_string()))?;

        let max_size = policy.capacity_budget().max(1);
        let buffer = Self {
            sizer: Box::new(sizer),
            index,
            cleaner,
            chain: Mutex::new(Chain {
                slots: VecDeque::new(),
                head_seq: 0,
                next_seq: 0,
            }),
            tail: AtomicU64::new(0),
            analysis_cursor: AtomicU64::new(0),
            indexing_cursor: AtomicU64::new(0),
            clear_lock: RwLock::new(()),
            evict_lock: Mutex::new(()),
            max_size: AtomicU64::new(max_size),
            eviction_occupancy: AtomicU64::new(policy.eviction_occupancy_percentage().to_bits()),
            expansion_rate: AtomicU64::new(policy.expansion_rate(max_size).to_bits()),
            maintenance_threshold: AtomicU64::new(policy.maintenance_threshold_for(max_size)),
            cleanup_threshold: AtomicU64::new(policy.cleanup_threshold_for(max_size)),
            current_size: AtomicU64::new(0),
            inserted_count: AtomicU64::new(0),
            analyzed_count: AtomicU64::new(0),
            indexed_count: AtomicU64::new(0),
            evicted_count: AtomicU64::new(0),
            data_added_bytes: AtomicU64::new(0),
            data_removed_bytes: AtomicU64::new(0),
            index_tree_size: AtomicU64::new(0),
            bytes_since_maintenance: AtomicU64::new(0),
            bytes_since_cleanup: AtomicU64::new(0),
            analysis_signal: Signal::new(),
            indexing_signal: Signal::new(),
            eviction_signal: Signal::new(),
            policy,
        };

        info!(
            max_size,
            expansion_rate = buffer.expansion_rate(),
            maintenance_threshold = buffer.maintenance_threshold.load(Ordering::Relaxed),
            cleanup_threshold = buffer.cleanup_threshold.load(Ordering::Relaxed),
            "ingest buffer created"
        );
        Ok(buffer)
    }

    /// The policy the buffer was built with.
    pub fn policy(&self) -> &CapacityPolicy {
        &self.policy
    }

    /// The index tree the buffer feeds.
    pub fn index(&self) -> &Arc<dyn IndexTree<T>> {
        &self.index
    }

    // === Producers ===

    /// Appends a payload. Never blocks on workers and never fails.
    pub fn put(&self, payload: T) {
        {
            let _clear = self.clear_lock.read();
            let mut chain = self.chain.lock();
            let seq = chain.next_seq;
            chain.slots.push_back(Arc::new(Slot::new(seq, payload)));
            chain.next_seq = seq + 1;
            self.tail.store(seq + 1, Ordering::Release);
            // A clear drops the slot and its count together.
            self.inserted_count.fetch_add(1, Ordering::Relaxed);
        }
        self.analysis_signal.notify_all();
    }

    // === Analysis ===

    /// Sizes the next unanalyzed slot.
    ///
    /// Waits up to `wait` for a slot to appear. Returns `false` if none could be
    /// claimed.
    pub fn analyze_next(&self, wait: Duration) -> bool {
        if self.try_analyze() {
            return true;
        }
        self.analysis_signal.wait_unless(
            || self.analysis_cursor.load(Ordering::Acquire) < self.tail.load(Ordering::Acquire),
            wait,
        );
        self.try_analyze()
    }

    fn try_analyze(&self) -> bool {
        let _clear = self.clear_lock.read();
        let Some(slot) = self.claim(&self.analysis_cursor, |_| true) else {
            return false;
        };

        let raw = match catch_unwind(AssertUnwindSafe(|| self.sizer.size_of(slot.payload()))) {
            Ok(Ok(size)) => size,
            Ok(Err(e)) => {
                warn!(seq = slot.seq(), error = %e, "sizing failed, slot accounted as empty");
                0
            }
            Err(_) => {
                warn!(seq = slot.seq(), "sizer panicked, slot accounted as empty");
                0
            }
        };
        let rate = f64::from_bits(self.expansion_rate.load(Ordering::Relaxed));
        let size = (raw as f64 * (1.0 + rate)) as u64;

        slot.mark_analyzed(size);
        self.current_size.fetch_add(size, Ordering::AcqRel);
        self.data_added_bytes.fetch_add(size, Ordering::Relaxed);
        self.analyzed_count.fetch_add(1, Ordering::AcqRel);

        self.indexing_signal.notify_all();
        if self.should_evict() {
            self.eviction_signal.notify_all();
        }
        true
    }

    // === Indexing ===

    /// Hands the next analyzed, unindexed slot to the index tree.
    ///
    /// Only analyzed slots are claimed; if the next one is not analyzed yet,
    /// waits up to `wait` for it. Returns `false` if nothing was indexed.
    pub fn index_next(&self, wait: Duration) -> bool {
        if self.try_index() {
            return true;
        }
        self.indexing_signal
            .wait_unless(|| self.next_to_index_is_ready(), wait);
        self.try_index()
    }

    fn next_to_index_is_ready(&self) -> bool {
        let seq = self.indexing_cursor.load(Ordering::Acquire);
        let chain = self.chain.lock();
        // A cursor behind the head can skip forward right away.
        seq < chain.head_seq || chain.get(seq).is_some_and(|slot| slot.is_analyzed())
    }

    fn try_index(&self) -> bool {
        let _clear = self.clear_lock.read();
        let Some(slot) = self.claim(&self.indexing_cursor, |slot| slot.is_analyzed()) else {
            return false;
        };

        match catch_unwind(AssertUnwindSafe(|| self.index.put(slot.payload()))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(seq = slot.seq(), error = %e, "index rejected payload"),
            Err(_) => warn!(seq = slot.seq(), "index panicked on payload"),
        }
        slot.mark_indexed();
        self.indexed_count.fetch_add(1, Ordering::AcqRel);

        let threshold = self.maintenance_threshold.load(Ordering::Relaxed);
        if accumulate(&self.bytes_since_maintenance, slot.size(), threshold) {
            self.maintain_index();
        }
        true
    }

    /// Folds the change of the index footprint into `current_size`.
    fn maintain_index(&self) {
        let size = self.index.component_size();
        let previous = self.index_tree_size.swap(size, Ordering::AcqRel);
        if size >= previous {
            self.current_size.fetch_add(size - previous, Ordering::AcqRel);
        } else {
            saturating_sub(&self.current_size, previous - size);
        }
        debug!(index_tree_size = size, previous, "index footprint measured");
    }

    /// Claims the slot at `cursor` if `ready` accepts it.
    ///
    /// Slots evicted before this phase reached them are skipped.
    fn claim(
        &self,
        cursor: &AtomicU64,
        ready: impl Fn(&Slot<T>) -> bool,
    ) -> Option<Arc<Slot<T>>> {
        loop {
            let seq = cursor.load(Ordering::Acquire);
            if seq >= self.tail.load(Ordering::Acquire) {
                return None;
            }

            let found = {
                let chain = self.chain.lock();
                chain.get(seq).cloned().ok_or(chain.head_seq)
            };
            let slot = match found {
                Ok(slot) => slot,
                Err(head) if seq < head => {
                    let _ = cursor.compare_exchange(seq, head, Ordering::AcqRel, Ordering::Acquire);
                    continue;
                }
                Err(_) => return None,
            };

            if !ready(&slot) {
                return None;
            }
            if cursor
                .compare_exchange(seq, seq + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(slot);
            }
        }
    }

    // === Eviction ===

    /// Whether occupancy is above the eviction threshold.
    pub fn should_evict(&self) -> bool {
        self.occupancy_percentage() > self.eviction_occupancy_percentage()
    }

    /// Blocks until eviction is needed, the timeout elapses or the buffer is
    /// woken. Returns [`should_evict`](Self::should_evict).
    pub fn wait_for_eviction(&self, timeout: Duration) -> bool {
        self.eviction_signal
            .wait_unless(|| self.should_evict(), timeout);
        self.should_evict()
    }

    /// Removes the oldest analyzed slots until a fixed fraction of the current
    /// size is freed.
    ///
    /// Stops early at the first slot that is not analyzed yet; callers retry
    /// on the next tick. Concurrent calls are serialized.
    pub fn evict(&self) -> EvictionSummary {
        let _serial = self.evict_lock.lock();
        let _clear = self.clear_lock.read();

        let current = self.current_size();
        let target = (current as f64 * self.policy.eviction_fragment_size_percentage()) as u64;
        let mut summary = EvictionSummary {
            target_bytes: target,
            ..EvictionSummary::default()
        };

        let mut evicted = Vec::new();
        {
            let mut chain = self.chain.lock();
            while summary.evicted_bytes < target {
                let Some(front) = chain.slots.front() else {
                    break;
                };
                if !front.is_analyzed() {
                    summary.stopped_early = true;
                    break;
                }
                if let Some(slot) = chain.slots.pop_front() {
                    chain.head_seq = slot.seq() + 1;
                    summary.evicted_bytes += slot.size();
                    summary.evicted_slots += 1;
                    evicted.push(slot);
                }
            }
        }

        saturating_sub(&self.current_size, summary.evicted_bytes);
        self.data_removed_bytes
            .fetch_add(summary.evicted_bytes, Ordering::Relaxed);
        self.evicted_count
            .fetch_add(summary.evicted_slots, Ordering::AcqRel);
        // Payloads are released here, outside the chain lock.
        drop(evicted);

        let threshold = self.cleanup_threshold.load(Ordering::Relaxed);
        if accumulate(&self.bytes_since_cleanup, summary.evicted_bytes, threshold) {
            debug!(threshold, "scheduling index cleanup");
            Arc::clone(&self.index).cleanup(&self.cleaner);
        }

        if summary.stopped_early {
            debug!(
                target = summary.target_bytes,
                evicted = summary.evicted_bytes,
                "eviction stopped at an unanalyzed slot"
            );
        } else {
            debug!(
                target = summary.target_bytes,
                evicted = summary.evicted_bytes,
                slots = summary.evicted_slots,
                "eviction pass finished"
            );
        }
        // Indexers parked on an evicted slot can move on.
        self.indexing_signal.notify_all();
        summary
    }

    /// Drops every slot and resets all counters and gauges, and empties the
    /// index tree. Not counted as eviction.
    pub fn clear_all(&self) {
        let cleared = {
            let _clear = self.clear_lock.write();
            let cleared = {
                let mut chain = self.chain.lock();
                chain.head_seq = chain.next_seq;
                self.analysis_cursor.store(chain.next_seq, Ordering::Release);
                self.indexing_cursor.store(chain.next_seq, Ordering::Release);
                std::mem::take(&mut chain.slots)
            };

            for counter in [
                &self.current_size,
                &self.inserted_count,
                &self.analyzed_count,
                &self.indexed_count,
                &self.evicted_count,
                &self.data_added_bytes,
                &self.data_removed_bytes,
                &self.index_tree_size,
                &self.bytes_since_maintenance,
                &self.bytes_since_cleanup,
            ] {
                counter.store(0, Ordering::Release);
            }
            self.index.clear_all();
            cleared
        };
        info!(slots = cleared.len(), "buffer cleared");
    }

    // === Runtime knobs ===

    /// Changes the byte budget. Recomputes the expansion rate and the
    /// maintenance and cleanup thresholds for the new size.
    pub fn set_max_size(&self, bytes: u64) {
        let bytes = bytes.max(1);
        self.max_size.store(bytes, Ordering::Release);
        self.expansion_rate
            .store(self.policy.expansion_rate(bytes).to_bits(), Ordering::Relaxed);
        self.maintenance_threshold
            .store(self.policy.maintenance_threshold_for(bytes), Ordering::Relaxed);
        self.cleanup_threshold
            .store(self.policy.cleanup_threshold_for(bytes), Ordering::Relaxed);
        info!(max_size = bytes, expansion_rate = self.expansion_rate(), "buffer max size changed");
        self.eviction_signal.notify_all();
    }

    /// Changes the occupancy above which eviction is requested. Clamped to `[0, 1]`.
    pub fn set_eviction_occupancy_percentage(&self, percentage: f64) {
        let percentage = if percentage.is_nan() {
            self.policy.eviction_occupancy_percentage()
        } else {
            percentage.clamp(0.0, 1.0)
        };
        self.eviction_occupancy
            .store(percentage.to_bits(), Ordering::Release);
        info!(eviction_occupancy = percentage, "eviction occupancy changed");
        self.eviction_signal.notify_all();
    }

    /// Wakes every parked worker. Used at shutdown.
    pub fn wake_workers(&self) {
        self.analysis_signal.notify_all();
        self.indexing_signal.notify_all();
        self.eviction_signal.notify_all();
    }

    // === Gauges ===

    /// Slots inserted since the last clear.
    pub fn inserted_count(&self) -> u64 {
        self.inserted_count.load(Ordering::Acquire)
    }

    /// Slots analyzed since the last clear.
    pub fn analyzed_count(&self) -> u64 {
        self.analyzed_count.load(Ordering::Acquire)
    }

    /// Slots indexed since the last clear.
    pub fn indexed_count(&self) -> u64 {
        self.indexed_count.load(Ordering::Acquire)
    }

    /// Slots evicted since the last clear.
    pub fn evicted_count(&self) -> u64 {
        self.evicted_count.load(Ordering::Acquire)
    }

    /// Estimated occupied bytes.
    pub fn current_size(&self) -> u64 {
        self.current_size.load(Ordering::Acquire)
    }

    /// Byte budget.
    pub fn max_size(&self) -> u64 {
        self.max_size.load(Ordering::Acquire)
    }

    /// `current_size / max_size`.
    pub fn occupancy_percentage(&self) -> f64 {
        self.current_size() as f64 / self.max_size() as f64
    }

    /// Occupancy above which eviction is requested.
    pub fn eviction_occupancy_percentage(&self) -> f64 {
        f64::from_bits(self.eviction_occupancy.load(Ordering::Acquire))
    }

    /// Expansion rate applied to newly analyzed slots.
    pub fn expansion_rate(&self) -> f64 {
        f64::from_bits(self.expansion_rate.load(Ordering::Relaxed))
    }

    /// Bytes added by analysis since the last clear.
    pub fn data_added_bytes(&self) -> u64 {
        self.data_added_bytes.load(Ordering::Relaxed)
    }

    /// Bytes removed by eviction since the last clear.
    pub fn data_removed_bytes(&self) -> u64 {
        self.data_removed_bytes.load(Ordering::Relaxed)
    }

    /// Last measured index footprint.
    pub fn index_tree_size(&self) -> u64 {
        self.index_tree_size.load(Ordering::Acquire)
    }

    /// Slots currently held.
    pub fn len(&self) -> usize {
        self.chain.lock().slots.len()
    }

    /// Whether the buffer holds no slots.
    pub fn is_empty(&self) -> bool {
        self.chain.lock().slots.is_empty()
    }

    /// The oldest payload still held.
    pub fn oldest(&self) -> Option<Arc<T>> {
        self.chain
            .lock()
            .slots
            .front()
            .map(|slot| Arc::clone(slot.payload()))
    }

    /// The newest payload.
    pub fn newest(&self) -> Option<Arc<T>> {
        self.chain
            .lock()
            .slots
            .back()
            .map(|slot| Arc::clone(slot.payload()))
    }

    /// Snapshot of all gauges.
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            inserted_count: self.inserted_count(),
            analyzed_count: self.analyzed_count(),
            indexed_count: self.indexed_count(),
            evicted_count: self.evicted_count(),
            len: self.len(),
            current_size: self.current_size(),
            max_size: self.max_size(),
            occupancy: self.occupancy_percentage(),
            eviction_occupancy: self.eviction_occupancy_percentage(),
            expansion_rate: self.expansion_rate(),
            data_added_bytes: self.data_added_bytes(),
            data_removed_bytes: self.data_removed_bytes(),
            index_tree_size: self.index_tree_size(),
        }
    }
}

/// Adds `bytes` to `accumulator`. Returns true, and resets it, for exactly one
/// caller once it exceeds `threshold`.
fn accumulate(accumulator: &AtomicU64, bytes: u64, threshold: u64) -> bool {
    let total = accumulator.fetch_add(bytes, Ordering::AcqRel) + bytes;
    total > threshold
        && accumulator
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v > threshold).then_some(0)
            })
            .is_ok()
}

fn saturating_sub(counter: &AtomicU64, bytes: u64) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
        Some(v.saturating_sub(bytes))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BufferConfig;
    use crate::index::{IndexQuery, MemoryIndex};
    use cmr_common::{
        HeapObjectSizes, MeasurementKind, MeasurementRecord, PlatformIdent, SensorTypeIdent,
        SqlStatementData, Timestamp,
    };
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    /// Records what the buffer asks of it.
    #[derive(Default)]
    struct RecordingIndex {
        puts: Mutex<Vec<u64>>,
        component_size: AtomicU64,
        size_queries: AtomicUsize,
        cleans: AtomicUsize,
        clears: AtomicUsize,
        fail_on: Option<u64>,
    }

    impl RecordingIndex {
        fn with_component_size(size: u64) -> Self {
            Self {
                component_size: AtomicU64::new(size),
                ..Self::default()
            }
        }
    }

    impl IndexTree<u64> for RecordingIndex {
        fn put(&self, payload: &Arc<u64>) -> Result<()> {
            if self.fail_on == Some(**payload) {
                return Err(Error::Index(format!("refusing {payload}")));
            }
            self.puts.lock().push(**payload);
            Ok(())
        }

        fn component_size(&self) -> u64 {
            self.size_queries.fetch_add(1, Ordering::SeqCst);
            self.component_size.load(Ordering::SeqCst)
        }

        fn clean(&self) {
            self.cleans.fetch_add(1, Ordering::SeqCst);
        }

        fn clear_all(&self) {
            self.clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> BufferConfig {
        BufferConfig::default()
            .with_fixed_expansion_rate(0.0)
            .with_indexing_wait_time(Duration::from_millis(5))
    }

    fn buffer_with(
        config: BufferConfig,
        budget: u64,
        index: Arc<RecordingIndex>,
    ) -> IngestBuffer<u64> {
        let policy = CapacityPolicy::fixed(config, budget).unwrap();
        IngestBuffer::new(policy, |_: &u64| 1u64, index).unwrap()
    }

    fn buffer(budget: u64) -> (IngestBuffer<u64>, Arc<RecordingIndex>) {
        let index = Arc::new(RecordingIndex::default());
        (buffer_with(config(), budget, Arc::clone(&index)), index)
    }

    fn analyze_all(buffer: &IngestBuffer<u64>) {
        while buffer.analyze_next(Duration::ZERO) {}
    }

    fn index_all(buffer: &IngestBuffer<u64>) {
        while buffer.index_next(Duration::ZERO) {}
    }

    #[test]
    fn test_put_appends_in_order() {
        let (buffer, _) = buffer(1_000);
        assert!(buffer.is_empty());
        for i in 0..3 {
            buffer.put(i);
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.inserted_count(), 3);
        assert_eq!(buffer.oldest().as_deref(), Some(&0));
        assert_eq!(buffer.newest().as_deref(), Some(&2));
        assert_eq!(buffer.current_size(), 0);
    }

    #[test]
    fn test_analysis_and_indexing_follow_insertion_order() {
        let (buffer, index) = buffer(1_000);
        for i in 0..100 {
            buffer.put(i);
        }

        // Nothing is indexed before it is analyzed.
        assert!(!buffer.index_next(Duration::ZERO));

        analyze_all(&buffer);
        index_all(&buffer);

        assert_eq!(*index.puts.lock(), (0..100).collect::<Vec<_>>());
        assert_eq!(buffer.analyzed_count(), 100);
        assert_eq!(buffer.indexed_count(), 100);
        assert_eq!(buffer.current_size(), 100);
        assert_eq!(buffer.data_added_bytes(), 100);
    }

    #[test]
    fn test_indexer_stops_at_unanalyzed_slot() {
        let (buffer, index) = buffer(1_000);
        for i in 0..5 {
            buffer.put(i);
        }
        assert!(buffer.analyze_next(Duration::ZERO));
        assert!(buffer.analyze_next(Duration::ZERO));

        index_all(&buffer);
        assert_eq!(*index.puts.lock(), vec![0, 1]);
    }

    #[test]
    fn test_expansion_rate_is_applied() {
        let index = Arc::new(RecordingIndex::default());
        let policy = CapacityPolicy::fixed(
            BufferConfig::default().with_fixed_expansion_rate(0.5),
            10_000,
        )
        .unwrap();
        let buffer = IngestBuffer::new(policy, |_: &u64| 100u64, index).unwrap();
        buffer.put(1);
        analyze_all(&buffer);
        assert_eq!(buffer.current_size(), 150);
    }

    #[test]
    fn test_every_slot_processed_exactly_once_across_threads() {
        init_tracing();
        let (buffer, index) = buffer(1_000_000);
        let buffer = Arc::new(buffer);
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 2_500;
        const TOTAL: u64 = PRODUCERS * PER_PRODUCER;

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let buffer = Arc::clone(&buffer);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    buffer.put(p * PER_PRODUCER + i);
                }
            }));
        }
        for _ in 0..3 {
            let buffer = Arc::clone(&buffer);
            handles.push(thread::spawn(move || {
                while buffer.analyzed_count() < TOTAL {
                    buffer.analyze_next(Duration::from_millis(1));
                }
            }));
        }
        for _ in 0..3 {
            let buffer = Arc::clone(&buffer);
            handles.push(thread::spawn(move || {
                while buffer.indexed_count() < TOTAL {
                    buffer.index_next(Duration::from_millis(1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(buffer.inserted_count(), TOTAL);
        assert_eq!(buffer.analyzed_count(), TOTAL);
        assert_eq!(buffer.indexed_count(), TOTAL);
        assert_eq!(buffer.current_size(), TOTAL);

        let mut puts = index.puts.lock().clone();
        assert_eq!(puts.len() as u64, TOTAL);
        puts.sort_unstable();
        puts.dedup();
        assert_eq!(puts.len() as u64, TOTAL);
    }

    #[test]
    fn test_evict_removes_fragment_of_current_size() {
        let index = Arc::new(RecordingIndex::default());
        let buffer = buffer_with(
            config().with_eviction_fragment_size_percentage(0.5),
            10_000,
            index,
        );
        for i in 0..1_000 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        assert_eq!(buffer.current_size(), 1_000);

        let summary = buffer.evict();
        assert_eq!(summary.target_bytes, 500);
        assert_eq!(summary.evicted_bytes, 500);
        assert!(!summary.stopped_early);
        assert_eq!(buffer.current_size(), 500);
        assert_eq!(buffer.evicted_count(), 500);
        assert_eq!(buffer.data_removed_bytes(), 500);
        assert_eq!(buffer.len(), 500);
        assert_eq!(buffer.oldest().as_deref(), Some(&500));
    }

    #[test]
    fn test_evict_stops_at_unanalyzed_slot() {
        // The index footprint keeps the target above what the analyzed slots hold.
        let index = Arc::new(RecordingIndex::with_component_size(100));
        let buffer = buffer_with(
            config()
                .with_eviction_fragment_size_percentage(1.0)
                .with_maintenance_threshold(1),
            10_000,
            index,
        );
        for i in 0..10 {
            buffer.put(i);
        }
        for _ in 0..4 {
            assert!(buffer.analyze_next(Duration::ZERO));
        }
        index_all(&buffer);
        assert_eq!(buffer.current_size(), 104);

        let summary = buffer.evict();
        assert!(summary.stopped_early);
        assert_eq!(summary.target_bytes, 104);
        assert_eq!(summary.evicted_slots, 4);
        assert_eq!(buffer.current_size(), 100);
        assert_eq!(buffer.oldest().as_deref(), Some(&4));

        // Analysis resumes where it left off.
        analyze_all(&buffer);
        assert_eq!(buffer.analyzed_count(), 10);
        assert_eq!(buffer.current_size(), 106);
    }

    #[test]
    fn test_indexer_skips_evicted_slots() {
        let index = Arc::new(RecordingIndex::default());
        let buffer = buffer_with(
            config().with_eviction_fragment_size_percentage(0.5),
            10_000,
            Arc::clone(&index),
        );
        for i in 0..10 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        buffer.evict();

        index_all(&buffer);
        assert_eq!(*index.puts.lock(), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_should_evict_is_independent_of_fragment() {
        for fragment in [0.1, 0.5, 1.0] {
            let index = Arc::new(RecordingIndex::default());
            let buffer = buffer_with(
                config()
                    .with_eviction_occupancy_percentage(0.99)
                    .with_eviction_fragment_size_percentage(fragment),
                10_000,
                index,
            );
            for i in 0..9_900 {
                buffer.put(i);
            }
            analyze_all(&buffer);
            assert_eq!(buffer.current_size(), 9_900);
            assert!(!buffer.should_evict());

            for i in 0..100 {
                buffer.put(i);
            }
            analyze_all(&buffer);
            assert_eq!(buffer.current_size(), 10_000);
            assert!(buffer.should_evict());
        }
    }

    #[test]
    fn test_maintenance_adds_index_footprint_once_threshold_exceeded() {
        let index = Arc::new(RecordingIndex::with_component_size(10));
        let buffer = buffer_with(
            config().with_maintenance_threshold(30),
            10_000,
            Arc::clone(&index),
        );

        for i in 0..30 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        index_all(&buffer);
        assert_eq!(index.size_queries.load(Ordering::SeqCst), 0);
        assert_eq!(buffer.current_size(), 30);

        buffer.put(30);
        analyze_all(&buffer);
        index_all(&buffer);
        assert_eq!(index.size_queries.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.index_tree_size(), 10);
        assert_eq!(buffer.current_size(), 31 + 10);

        // The next measurement only adds the growth of the index.
        index.component_size.store(15, Ordering::SeqCst);
        for i in 31..63 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        index_all(&buffer);
        assert_eq!(index.size_queries.load(Ordering::SeqCst), 2);
        assert_eq!(buffer.current_size(), 63 + 15);
    }

    #[test]
    fn test_cleanup_scheduled_after_enough_evicted_bytes() {
        let index = Arc::new(RecordingIndex::default());
        let buffer = buffer_with(
            config()
                .with_cleanup_threshold(10)
                .with_eviction_fragment_size_percentage(0.5),
            10_000,
            Arc::clone(&index),
        );
        for i in 0..40 {
            buffer.put(i);
        }
        analyze_all(&buffer);

        // 20 bytes evicted, above the threshold of 10.
        buffer.evict();

        let deadline = Instant::now() + Duration::from_secs(5);
        while index.cleans.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(index.cleans.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clear_is_not_eviction() {
        let (buffer, index) = buffer(1_000);
        for i in 0..50 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        index_all(&buffer);

        buffer.clear_all();
        assert_eq!(buffer.current_size(), 0);
        assert_eq!(buffer.evicted_count(), 0);
        assert_eq!(buffer.inserted_count(), 0);
        assert!(buffer.is_empty());
        assert!(buffer.oldest().is_none());
        assert_eq!(index.clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_repeated_clears_leave_buffer_usable() {
        let (buffer, _) = buffer(100_000);
        for round in 0..10 {
            buffer.put(round);
            buffer.clear_all();
        }

        for i in 0..100 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        index_all(&buffer);
        assert_eq!(buffer.inserted_count(), 100);
        assert_eq!(buffer.analyzed_count(), 100);
        assert_eq!(buffer.indexed_count(), 100);
        assert_eq!(buffer.evicted_count(), 0);
    }

    #[test]
    fn test_clear_racing_producers_keeps_counts_consistent() {
        let (buffer, _) = buffer(1 << 40);
        let done = AtomicBool::new(false);

        for _ in 0..200 {
            done.store(false, Ordering::SeqCst);
            thread::scope(|scope| {
                for p in 0..4u64 {
                    let buffer = &buffer;
                    let done = &done;
                    scope.spawn(move || {
                        let mut i = p;
                        while !done.load(Ordering::SeqCst) {
                            buffer.put(i);
                            i += 4;
                        }
                    });
                }
                for _ in 0..3 {
                    buffer.clear_all();
                    thread::yield_now();
                }
                done.store(true, Ordering::SeqCst);
            });
            assert_eq!(buffer.inserted_count(), buffer.len() as u64);

            buffer.clear_all();
            assert_eq!(buffer.inserted_count(), 0);
            assert!(buffer.is_empty());
        }

        buffer.put(7);
        analyze_all(&buffer);
        index_all(&buffer);
        assert_eq!(buffer.inserted_count(), 1);
        assert_eq!(buffer.analyzed_count(), 1);
        assert_eq!(buffer.indexed_count(), 1);
    }

    #[test]
    fn test_faulty_sizer_does_not_stall_analysis() {
        init_tracing();
        let index = Arc::new(RecordingIndex::default());
        let policy = CapacityPolicy::fixed(config(), 1_000).unwrap();
        let sizer = |v: &u64| -> u64 {
            assert!(*v != 1, "cannot size 1");
            5
        };
        let buffer = IngestBuffer::new(policy, sizer, index).unwrap();
        for i in 0..3 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        assert_eq!(buffer.analyzed_count(), 3);
        assert_eq!(buffer.current_size(), 10);
    }

    #[test]
    fn test_sizer_error_counts_as_empty() {
        struct Failing;
        impl ObjectSizes<u64> for Failing {
            fn size_of(&self, _: &u64) -> Result<u64> {
                Err(Error::Sizing("unsupported".into()))
            }
        }
        let policy = CapacityPolicy::fixed(config(), 1_000).unwrap();
        let buffer =
            IngestBuffer::new(policy, Failing, Arc::new(RecordingIndex::default())).unwrap();
        buffer.put(1);
        analyze_all(&buffer);
        assert_eq!(buffer.analyzed_count(), 1);
        assert_eq!(buffer.current_size(), 0);
    }

    #[test]
    fn test_index_failure_still_marks_indexed() {
        init_tracing();
        let index = Arc::new(RecordingIndex {
            fail_on: Some(1),
            ..RecordingIndex::default()
        });
        let buffer = buffer_with(config(), 1_000, Arc::clone(&index));
        for i in 0..3 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        index_all(&buffer);
        assert_eq!(buffer.indexed_count(), 3);
        assert_eq!(*index.puts.lock(), vec![0, 2]);
    }

    #[test]
    fn test_set_max_size_changes_gating() {
        let (buffer, _) = buffer(1_000);
        for i in 0..500 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        assert!(!buffer.should_evict());

        buffer.set_max_size(600);
        assert_eq!(buffer.max_size(), 600);
        assert!(buffer.should_evict());

        buffer.set_eviction_occupancy_percentage(0.9);
        assert!(!buffer.should_evict());
        buffer.set_eviction_occupancy_percentage(7.0);
        assert_eq!(buffer.eviction_occupancy_percentage(), 1.0);
    }

    #[test]
    fn test_set_max_size_recomputes_expansion_rate() {
        let index = Arc::new(RecordingIndex::default());
        let config = BufferConfig {
            max_object_expansion_rate_active_till_buffer_size: 100,
            min_object_expansion_rate_active_from_buffer_size: 1_000,
            ..BufferConfig::default().with_object_expansion_rates(0.1, 0.3)
        };
        let buffer = buffer_with(config, 100, index);
        let small = buffer.expansion_rate();

        buffer.set_max_size(1_000_000);
        assert!(buffer.expansion_rate() < small);
    }

    #[test]
    fn test_wait_for_eviction() {
        let (buffer, _) = buffer(10);
        assert!(!buffer.wait_for_eviction(Duration::from_millis(5)));

        let buffer = Arc::new(buffer);
        let waiter = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                while Instant::now() < deadline {
                    if buffer.wait_for_eviction(Duration::from_millis(50)) {
                        return true;
                    }
                }
                false
            })
        };
        for i in 0..10 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_stats_snapshot() {
        let (buffer, _) = buffer(100);
        for i in 0..10 {
            buffer.put(i);
        }
        analyze_all(&buffer);
        let stats = buffer.stats();
        assert_eq!(stats.inserted_count, 10);
        assert_eq!(stats.analyzed_count, 10);
        assert_eq!(stats.current_size, 10);
        assert_eq!(stats.max_size, 100);
        assert!((stats.occupancy - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_memory_index_sees_evicted_payloads_disappear() {
        let index: Arc<MemoryIndex<MeasurementRecord>> = Arc::new(MemoryIndex::new());
        let policy = CapacityPolicy::fixed(
            BufferConfig::default()
                .with_fixed_expansion_rate(0.0)
                .with_eviction_fragment_size_percentage(0.5),
            1_000_000,
        )
        .unwrap();
        let buffer = IngestBuffer::new(
            policy,
            HeapObjectSizes::<MeasurementRecord>::default(),
            Arc::clone(&index) as Arc<dyn IndexTree<MeasurementRecord>>,
        )
        .unwrap();

        for id in 0..4 {
            buffer.put(MeasurementRecord::new(
                id,
                PlatformIdent::new(1),
                SensorTypeIdent::new(1),
                Timestamp::from_millis(id),
                MeasurementKind::Sql(SqlStatementData {
                    sql: "SELECT 1".to_string(),
                    ..SqlStatementData::default()
                }),
            ));
        }
        while buffer.analyze_next(Duration::ZERO) {}
        while buffer.index_next(Duration::ZERO) {}
        assert_eq!(index.query(&IndexQuery::new()).len(), 4);

        buffer.evict();
        let ids: Vec<u64> = index.query(&IndexQuery::new()).iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![2, 3]);
    }
}
