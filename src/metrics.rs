//! # Engine Metrics
//!
//! Measurement counters owned by the environment and shared with the page
//! manager, journal and b-tree indexes. Counters are atomic so the shared
//! handle can be sprinkled through the subsystems without threading
//! `&mut` everywhere; nothing here is on a hot enough path for the relaxed
//! increments to matter.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) cache_evictions: AtomicU64,
    pub(crate) pages_allocated: AtomicU64,
    pub(crate) pages_freed: AtomicU64,
    pub(crate) btree_splits: AtomicU64,
    pub(crate) btree_merges: AtomicU64,
    pub(crate) btree_shifts: AtomicU64,
    pub(crate) extended_keys: AtomicU64,
    pub(crate) extended_duptables: AtomicU64,
    pub(crate) blob_allocs: AtomicU64,
    pub(crate) blob_frees: AtomicU64,
    pub(crate) journal_bytes: AtomicU64,
    pub(crate) journal_records: AtomicU64,
    pub(crate) recovery_replays: AtomicU64,
}

/// A point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub pages_allocated: u64,
    pub pages_freed: u64,
    pub btree_splits: u64,
    pub btree_merges: u64,
    pub btree_shifts: u64,
    pub extended_keys: u64,
    pub extended_duptables: u64,
    pub blob_allocs: u64,
    pub blob_frees: u64,
    pub journal_bytes: u64,
    pub journal_records: u64,
    pub recovery_replays: u64,
}

impl Metrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            cache_hits: read(&self.cache_hits),
            cache_misses: read(&self.cache_misses),
            cache_evictions: read(&self.cache_evictions),
            pages_allocated: read(&self.pages_allocated),
            pages_freed: read(&self.pages_freed),
            btree_splits: read(&self.btree_splits),
            btree_merges: read(&self.btree_merges),
            btree_shifts: read(&self.btree_shifts),
            extended_keys: read(&self.extended_keys),
            extended_duptables: read(&self.extended_duptables),
            blob_allocs: read(&self.blob_allocs),
            blob_frees: read(&self.blob_frees),
            journal_bytes: read(&self.journal_bytes),
            journal_records: read(&self.journal_records),
            recovery_replays: read(&self.recovery_replays),
        }
    }
}
