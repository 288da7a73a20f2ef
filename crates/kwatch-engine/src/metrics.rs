//! Engine counters.
//!
//! Lock-free atomics updated by the pipeline stages, plus per-owner match
//! statistics. A snapshot can be taken at any time without stopping the
//! pipeline.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// A single monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-owner match statistics.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerStats {
    pub matches: u64,
    pub last_match: Option<DateTime<Utc>>,
}

/// Counters for every pipeline stage.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Messages accepted into the ingest buffer.
    pub ingested: Counter,
    /// Messages dropped because the ingest buffer was full.
    pub dropped_backpressure: Counter,
    /// Match events produced by the matcher.
    pub matched: Counter,
    /// Match events suppressed as duplicates.
    pub deduplicated: Counter,
    /// Notifications flushed out of aggregation buckets.
    pub aggregated_flushes: Counter,
    /// Notifications that went through the delay heap.
    pub delayed: Counter,
    /// Notifications delivered by the external sender.
    pub sent: Counter,
    /// Notifications dropped at the rate ceiling.
    pub rate_limited: Counter,
    /// Sends that failed after exhausting retries.
    pub send_failures: Counter,
    /// Pattern evaluations that blew their time budget.
    pub match_timeouts: Counter,

    per_owner: DashMap<i64, OwnerStats>,
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub ingested: u64,
    pub dropped_backpressure: u64,
    pub matched: u64,
    pub deduplicated: u64,
    pub aggregated_flushes: u64,
    pub delayed: u64,
    pub sent: u64,
    pub rate_limited: u64,
    pub send_failures: u64,
    pub match_timeouts: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a match for an owner.
    pub fn record_match(&self, owner_id: i64) {
        self.matched.increment();
        let mut stats = self.per_owner.entry(owner_id).or_insert(OwnerStats {
            matches: 0,
            last_match: None,
        });
        stats.matches += 1;
        stats.last_match = Some(Utc::now());
    }

    /// Match statistics for one owner, if any matches were recorded.
    pub fn owner_stats(&self, owner_id: i64) -> Option<OwnerStats> {
        self.per_owner.get(&owner_id).map(|s| s.clone())
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ingested: self.ingested.get(),
            dropped_backpressure: self.dropped_backpressure.get(),
            matched: self.matched.get(),
            deduplicated: self.deduplicated.get(),
            aggregated_flushes: self.aggregated_flushes.get(),
            delayed: self.delayed.get(),
            sent: self.sent.get(),
            rate_limited: self.rate_limited.get(),
            send_failures: self.send_failures.get(),
            match_timeouts: self.match_timeouts.get(),
        }
    }
}
