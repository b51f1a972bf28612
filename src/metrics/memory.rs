//! In-process metric store: concurrent map of per-minute atomic counters.
//!
//! Mirrors the contract an external counter cache would honor: per-bucket
//! atomic increment, TTL refreshed on write, lazy creation, expired buckets
//! vanish without notice, no cross-bucket atomicity.

use std::ops::Range;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketId {
    key: String,
    bucket: i64,
}

struct Cell {
    count: AtomicU64,
    expires_at: AtomicI64,
}

pub struct MemoryMetricStore {
    cells: DashMap<BucketId, Cell>,
    ttl_seconds: i64,
}

impl MemoryMetricStore {
    pub fn new(ttl_seconds: u64) -> Self {
        Self {
            cells: DashMap::new(),
            ttl_seconds: ttl_seconds as i64,
        }
    }

    fn expired(&self, cell: &Cell, now: i64) -> bool {
        cell.expires_at.load(Ordering::Relaxed) <= now
    }

    /// Atomically add `delta` to `(key, bucket)`, refreshing its TTL.
    pub fn incr(&self, key: &str, bucket: i64) {
        self.incr_by(key, bucket, 1)
    }

    pub fn incr_by(&self, key: &str, bucket: i64, delta: u64) {
        let now = Utc::now().timestamp();
        let id = BucketId {
            key: key.to_string(),
            bucket,
        };
        let cell = self.cells.entry(id).or_insert_with(|| Cell {
            count: AtomicU64::new(0),
            expires_at: AtomicI64::new(now + self.ttl_seconds),
        });
        cell.count.fetch_add(delta, Ordering::Relaxed);
        cell.expires_at
            .store(now + self.ttl_seconds, Ordering::Relaxed);
    }

    /// Sum of one key's counters over a bucket range.
    pub fn sum(&self, key: &str, buckets: Range<i64>) -> u64 {
        self.series(key, buckets).into_iter().map(|(_, n)| n).sum()
    }

    /// Per-bucket values for one key over a range. Buckets that were never
    /// written (or have expired) are simply absent.
    pub fn series(&self, key: &str, buckets: Range<i64>) -> Vec<(i64, u64)> {
        let now = Utc::now().timestamp();
        let mut out = Vec::new();
        for bucket in buckets {
            let id = BucketId {
                key: key.to_string(),
                bucket,
            };
            if let Some(cell) = self.cells.get(&id) {
                if !self.expired(&cell, now) {
                    out.push((bucket, cell.count.load(Ordering::Relaxed)));
                }
            }
        }
        out
    }

    /// Every live `(key, bucket, count)` whose bucket falls in the range.
    /// This is the discovery primitive the detector uses to find which
    /// concrete traffic slices currently exist.
    pub fn scan(&self, buckets: Range<i64>) -> Vec<(String, i64, u64)> {
        let now = Utc::now().timestamp();
        self.cells
            .iter()
            .filter(|entry| {
                buckets.contains(&entry.key().bucket) && !self.expired(entry.value(), now)
            })
            .map(|entry| {
                (
                    entry.key().key.clone(),
                    entry.key().bucket,
                    entry.value().count.load(Ordering::Relaxed),
                )
            })
            .collect()
    }

    /// Drop expired cells; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Utc::now().timestamp();
        let before = self.cells.len();
        self.cells
            .retain(|_, cell| cell.expires_at.load(Ordering::Relaxed) > now);
        before - self.cells.len()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incr_sum_roundtrip() {
        let store = MemoryMetricStore::new(1800);
        for _ in 0..7 {
            store.incr("shopito/MX/STRIPE/_/ERROR", 100);
        }
        store.incr("shopito/MX/STRIPE/_/ERROR", 101);

        assert_eq!(store.sum("shopito/MX/STRIPE/_/ERROR", 100..102), 8);
        assert_eq!(store.sum("shopito/MX/STRIPE/_/ERROR", 100..101), 7);
        assert_eq!(store.sum("other/key", 100..102), 0);
    }

    #[test]
    fn test_series_skips_unwritten_buckets() {
        let store = MemoryMetricStore::new(1800);
        store.incr("k", 10);
        store.incr("k", 12);

        let series = store.series("k", 9..13);
        assert_eq!(series, vec![(10, 1), (12, 1)]);
    }

    #[test]
    fn test_scan_discovers_live_keys() {
        let store = MemoryMetricStore::new(1800);
        store.incr("a/MX/STRIPE/_/ERROR", 5);
        store.incr("a/MX/STRIPE/_/SUCCEEDED", 5);
        store.incr("a/MX/STRIPE/_/SUCCEEDED", 99);

        let mut hits = store.scan(0..10);
        hits.sort();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "a/MX/STRIPE/_/ERROR");
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let store = MemoryMetricStore::new(0);
        store.incr("k", 1);
        assert_eq!(store.sum("k", 0..10), 0);
        assert_eq!(store.sweep(), 1);
        assert!(store.is_empty());
    }

    #[test]
    fn test_sweep_keeps_live_cells() {
        let store = MemoryMetricStore::new(1800);
        store.incr("k", 1);
        assert_eq!(store.sweep(), 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_increments_land() {
        let store = std::sync::Arc::new(MemoryMetricStore::new(1800));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    store.incr("hot/key", 42);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.sum("hot/key", 42..43), 8000);
    }
}
