use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::CacheKey;

/// A snapshot of a single entry held by the [`CoalescingCache`](super::CoalescingCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    /// The key of the entry.
    pub key: CacheKey,
    /// Time since the entry was inserted.
    #[serde(with = "humantime_serde")]
    pub age: Duration,
    /// The time-to-live the entry was inserted with.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Whether a result was already delivered to a caller.
    pub settled: bool,
    /// Number of callers currently waiting on the entry.
    pub waiters: usize,
}

/// Cumulative counters of a [`CoalescingCache`](super::CoalescingCache).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Total number of lookups.
    pub requests: u64,
    /// Lookups served by an existing, fresh entry.
    pub hits: u64,
    /// Number of times a factory was invoked.
    pub computations: u64,
    /// Computations which resolved to an error.
    pub failures: u64,
    /// Entries removed to satisfy the size bound.
    pub evictions: u64,
    /// Entries removed because their time-to-live elapsed.
    pub expirations: u64,
    /// Callers which stopped waiting before their computation settled.
    pub abandoned: u64,
    /// Lookups that skipped the cache because nothing could be stored.
    pub bypassed: u64,
    /// Number of entries currently held.
    pub entries: usize,
}

impl CacheStats {
    /// The share of lookups that were served without invoking a factory.
    pub fn hit_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.hits as f64 / self.requests as f64
        }
    }
}

#[derive(Debug, Default)]
pub(super) struct Counters {
    pub requests: AtomicU64,
    pub hits: AtomicU64,
    pub computations: AtomicU64,
    pub failures: AtomicU64,
    pub evictions: AtomicU64,
    pub expirations: AtomicU64,
    pub abandoned: AtomicU64,
    pub bypassed: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self, entries: usize) -> CacheStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CacheStats {
            requests: load(&self.requests),
            hits: load(&self.hits),
            computations: load(&self.computations),
            failures: load(&self.failures),
            evictions: load(&self.evictions),
            expirations: load(&self.expirations),
            abandoned: load(&self.abandoned),
            bypassed: load(&self.bypassed),
            entries,
        }
    }
}
