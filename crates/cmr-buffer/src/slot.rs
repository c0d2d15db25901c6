//! A single buffered payload and its processing state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// One payload in the buffer.
///
/// Slots are addressed by their sequence number: the slot after `seq` is
/// `seq + 1`. Both flags go from false to true exactly once. The size is
/// written before `analyzed` is published and is only meaningful afterwards.
pub(crate) struct Slot<T> {
    seq: u64,
    payload: Arc<T>,
    analyzed: AtomicBool,
    indexed: AtomicBool,
    size: AtomicU64,
}

impl<T> Slot<T> {
    pub(crate) fn new(seq: u64, payload: T) -> Self {
        Self {
            seq,
            payload: Arc::new(payload),
            analyzed: AtomicBool::new(false),
            indexed: AtomicBool::new(false),
            size: AtomicU64::new(0),
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn payload(&self) -> &Arc<T> {
        &self.payload
    }

    pub(crate) fn is_analyzed(&self) -> bool {
        self.analyzed.load(Ordering::Acquire)
    }

    /// Footprint in bytes; 0 until analyzed.
    pub(crate) fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn mark_analyzed(&self, size: u64) {
        self.size.store(size, Ordering::Release);
        let was = self.analyzed.swap(true, Ordering::AcqRel);
        debug_assert!(!was, "slot {} analyzed twice", self.seq);
    }

    pub(crate) fn mark_indexed(&self) {
        let was = self.indexed.swap(true, Ordering::AcqRel);
        debug_assert!(!was, "slot {} indexed twice", self.seq);
    }
}
