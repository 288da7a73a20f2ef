//! Batching of accepted matches into aggregated notifications.
//!
//! Buckets are keyed by (owner, subscription). A bucket exists only while
//! it holds at least one pending event and is destroyed atomically with
//! its flush, so no event can be stranded in a half-flushed bucket.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::config::AggregationConfig;
use crate::message::{MatchEvent, NotificationPayload};

/// One open aggregation bucket.
#[derive(Debug)]
struct Bucket {
    events: Vec<MatchEvent>,
    opened_at: Instant,
    interval: Duration,
}

impl Bucket {
    fn deadline(&self) -> Instant {
        self.opened_at + self.interval
    }
}

/// Aggregates match events per (owner, subscription) key.
#[derive(Debug)]
pub struct Aggregator {
    buckets: DashMap<(i64, u64), Bucket>,
    default_interval: Duration,
    min_messages: usize,
}

impl Aggregator {
    pub fn new(config: &AggregationConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            default_interval: Duration::from_secs(config.default_interval_secs),
            min_messages: config.min_messages.max(1),
        }
    }

    /// Offer one accepted event.
    ///
    /// Returns a payload when the event flushes immediately: either the
    /// subscription does not aggregate (singleton pass-through), the
    /// global interval is zero, or the bucket reached the message
    /// threshold. Otherwise the event is buffered until the threshold or
    /// the deadline, whichever comes first.
    pub fn push(&self, event: MatchEvent) -> Option<NotificationPayload> {
        let interval = self.effective_interval(&event);
        if !event.policy.aggregate || interval.is_zero() {
            return NotificationPayload::from_events(vec![event]);
        }

        let key = (event.owner_id, event.subscription_id);
        let mut bucket = self.buckets.entry(key).or_insert_with(|| Bucket {
            events: Vec::new(),
            opened_at: Instant::now(),
            interval,
        });
        bucket.events.push(event);

        if bucket.events.len() >= self.min_messages {
            drop(bucket);
            // Remove-then-build keeps flush and destruction atomic under
            // the entry lock.
            let (_, bucket) = self.buckets.remove(&key)?;
            debug!(
                owner_id = key.0,
                subscription_id = key.1,
                count = bucket.events.len(),
                "flushing full aggregation bucket"
            );
            return NotificationPayload::from_events(bucket.events);
        }
        None
    }

    /// Flush every bucket whose deadline has passed, regardless of how
    /// many events it holds. Called from the background ticker so flush
    /// latency stays bounded even when no new matches arrive.
    pub fn flush_expired(&self) -> Vec<NotificationPayload> {
        let now = Instant::now();
        let expired: Vec<(i64, u64)> = self
            .buckets
            .iter()
            .filter(|entry| entry.deadline() <= now)
            .map(|entry| *entry.key())
            .collect();

        let mut payloads = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some((_, bucket)) = self.buckets.remove(&key) {
                debug!(
                    owner_id = key.0,
                    subscription_id = key.1,
                    count = bucket.events.len(),
                    "flushing expired aggregation bucket"
                );
                if let Some(payload) = NotificationPayload::from_events(bucket.events) {
                    payloads.push(payload);
                }
            }
        }
        payloads
    }

    /// Flush everything regardless of deadline. Used on shutdown so no
    /// buffered match is lost.
    pub fn flush_all(&self) -> Vec<NotificationPayload> {
        let keys: Vec<(i64, u64)> = self.buckets.iter().map(|e| *e.key()).collect();
        let mut payloads = Vec::new();
        for key in keys {
            if let Some((_, bucket)) = self.buckets.remove(&key)
                && let Some(payload) = NotificationPayload::from_events(bucket.events)
            {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Number of currently open buckets.
    pub fn open_buckets(&self) -> usize {
        self.buckets.len()
    }

    fn effective_interval(&self, event: &MatchEvent) -> Duration {
        // The global interval of zero disables aggregation outright; a
        // per-subscription override only narrows the default.
        if self.default_interval.is_zero() {
            return Duration::ZERO;
        }
        event
            .policy
            .aggregate_interval_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_interval)
    }
}
