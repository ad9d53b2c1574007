use std::sync::atomic::{AtomicU64, Ordering};

/// Counters collected by a paged file and the structures layered on it.
/// All fields are atomics so hot paths only pay for a relaxed increment.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    // Page cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,

    // Page lifecycle
    pages_allocated: AtomicU64,
    pages_reused: AtomicU64,
    pages_freed: AtomicU64,
    pages_written: AtomicU64,

    // Record store
    records_added: AtomicU64,
    records_removed: AtomicU64,
    records_relocated: AtomicU64,
    page_splits: AtomicU64,
    overflow_pages: AtomicU64,

    // Journal
    journal_records: AtomicU64,
    journal_bytes: AtomicU64,
    redo_applied: AtomicU64,
    undo_applied: AtomicU64,
}

/// Point-in-time copy of [`StoreMetrics`] with derived ratios.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StoreStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_evictions: u64,
    pub cache_hit_rate: f64,

    pub pages_allocated: u64,
    pub pages_reused: u64,
    pub pages_freed: u64,
    pub pages_written: u64,

    pub records_added: u64,
    pub records_removed: u64,
    pub records_relocated: u64,
    pub page_splits: u64,
    pub overflow_pages: u64,

    pub journal_records: u64,
    pub journal_bytes: u64,
    pub redo_applied: u64,
    pub undo_applied: u64,
}

macro_rules! counter {
    ($name:ident, $field:ident) => {
        #[inline]
        pub fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter!(cache_hit, cache_hits);
    counter!(cache_miss, cache_misses);
    counter!(cache_eviction, cache_evictions);
    counter!(page_allocated, pages_allocated);
    counter!(page_reused, pages_reused);
    counter!(page_freed, pages_freed);
    counter!(page_written, pages_written);
    counter!(record_added, records_added);
    counter!(record_removed, records_removed);
    counter!(record_relocated, records_relocated);
    counter!(page_split, page_splits);
    counter!(overflow_page, overflow_pages);
    counter!(redo, redo_applied);
    counter!(undo, undo_applied);

    #[inline]
    pub fn journal_write(&self, bytes: usize) {
        self.journal_records.fetch_add(1, Ordering::Relaxed);
        self.journal_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StoreStats {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        StoreStats {
            cache_hits: hits,
            cache_misses: misses,
            cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
            cache_hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            pages_allocated: self.pages_allocated.load(Ordering::Relaxed),
            pages_reused: self.pages_reused.load(Ordering::Relaxed),
            pages_freed: self.pages_freed.load(Ordering::Relaxed),
            pages_written: self.pages_written.load(Ordering::Relaxed),
            records_added: self.records_added.load(Ordering::Relaxed),
            records_removed: self.records_removed.load(Ordering::Relaxed),
            records_relocated: self.records_relocated.load(Ordering::Relaxed),
            page_splits: self.page_splits.load(Ordering::Relaxed),
            overflow_pages: self.overflow_pages.load(Ordering::Relaxed),
            journal_records: self.journal_records.load(Ordering::Relaxed),
            journal_bytes: self.journal_bytes.load(Ordering::Relaxed),
            redo_applied: self.redo_applied.load(Ordering::Relaxed),
            undo_applied: self.undo_applied.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_evictions,
            &self.pages_allocated,
            &self.pages_reused,
            &self.pages_freed,
            &self.pages_written,
            &self.records_added,
            &self.records_removed,
            &self.records_relocated,
            &self.page_splits,
            &self.overflow_pages,
            &self.journal_records,
            &self.journal_bytes,
            &self.redo_applied,
            &self.undo_applied,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }
}

/// Occupancy of a page cache.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BufferStats {
    pub capacity: usize,
    pub used: usize,
    pub dirty: usize,
    pub pinned: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl BufferStats {
    pub fn efficiency(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Shape of a B-tree as seen by a full walk from the root.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TreeStatistics {
    pub depth: usize,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub entries: u64,
}

impl TreeStatistics {
    pub fn total_pages(&self) -> usize {
        self.branch_pages + self.leaf_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_hit_rate() {
        let m = StoreMetrics::new();
        m.cache_hit();
        m.cache_hit();
        m.cache_hit();
        m.cache_miss();

        let s = m.snapshot();
        assert_eq!(s.cache_hits, 3);
        assert_eq!(s.cache_misses, 1);
        assert!((s.cache_hit_rate - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_journal_bytes_and_reset() {
        let m = StoreMetrics::new();
        m.journal_write(40);
        m.journal_write(2);
        m.record_added();

        let s = m.snapshot();
        assert_eq!(s.journal_records, 2);
        assert_eq!(s.journal_bytes, 42);
        assert_eq!(s.records_added, 1);

        m.reset();
        assert_eq!(m.snapshot().journal_bytes, 0);
    }

    #[test]
    fn test_stats_serialize() {
        let stats = BufferStats {
            capacity: 8,
            used: 4,
            dirty: 1,
            pinned: 1,
            hits: 9,
            misses: 1,
            evictions: 0,
        };
        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"capacity\":8"));
        assert!((stats.efficiency() - 0.9).abs() < 1e-9);
    }
}
