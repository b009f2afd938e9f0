//! Per-store operation counters.
//!
//! Each [`TableStore`](crate::TableStore) owns a [`StoreMetrics`] and
//! exposes it through `metrics()`. The `malformed_properties` counter makes
//! properties skipped on read observable without switching to strict
//! conversion.
//!
//! # Memory Ordering
//!
//! All counters are independent and use `Ordering::Relaxed`. A snapshot may
//! see counters that are slightly inconsistent with each other, which is
//! acceptable for telemetry.
//!
//! # Usage
//!
//! ```
//! use cloudtable_storage::StoreMetrics;
//!
//! let metrics = StoreMetrics::new();
//! metrics.record_read();
//! metrics.record_malformed(2);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.reads, 1);
//! assert_eq!(snapshot.malformed_properties, 2);
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    queries: AtomicU64,
    pages: AtomicU64,
    retries: AtomicU64,
    conflicts: AtomicU64,
    malformed_properties: AtomicU64,
}

/// Shared operation counters. Clones observe the same values.
#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
    counters: Arc<Counters>,
}

/// A point-in-time copy of [`StoreMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    /// Point reads.
    pub reads: u64,
    /// Inserts, replaces and upserts, counting each batched entity.
    pub writes: u64,
    /// Deletes.
    pub deletes: u64,
    /// Queries started, including existence checks and clears.
    pub queries: u64,
    /// Query segments fetched.
    pub pages: u64,
    /// Attempts beyond the first.
    pub retries: u64,
    /// Writes rejected for a stale version token.
    pub conflicts: u64,
    /// Properties skipped on read because they could not be converted.
    pub malformed_properties: u64,
}

macro_rules! recorders {
    ($($fn_name:ident => $field:ident),+ $(,)?) => {
        $(
            #[doc = concat!("Adds one to `", stringify!($field), "`.")]
            pub fn $fn_name(&self) {
                self.counters.$field.fetch_add(1, Ordering::Relaxed);
            }
        )+
    };
}

impl StoreMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    recorders! {
        record_read => reads,
        record_delete => deletes,
        record_query => queries,
        record_page => pages,
        record_conflict => conflicts,
    }

    /// Adds `count` to `writes`.
    pub fn record_writes(&self, count: u64) {
        self.counters.writes.fetch_add(count, Ordering::Relaxed);
    }

    /// Adds `count` to `retries`.
    pub fn record_retries(&self, count: u64) {
        if count > 0 {
            self.counters.retries.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Adds `count` to `malformed_properties`.
    pub fn record_malformed(&self, count: u64) {
        if count > 0 {
            self.counters.malformed_properties.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// Copies the current values.
    #[must_use]
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        let c = &self.counters;
        StoreMetricsSnapshot {
            reads: c.reads.load(Ordering::Relaxed),
            writes: c.writes.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            queries: c.queries.load(Ordering::Relaxed),
            pages: c.pages.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            conflicts: c.conflicts.load(Ordering::Relaxed),
            malformed_properties: c.malformed_properties.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter. Increments racing with the reset may be lost.
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.reads,
            &c.writes,
            &c.deletes,
            &c.queries,
            &c.pages,
            &c.retries,
            &c.conflicts,
            &c.malformed_properties,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
