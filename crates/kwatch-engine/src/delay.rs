//! Delayed release of ready notifications.
//!
//! Notifications with a configured delay sit in a min-heap ordered by
//! ready time, ties broken by insertion order (FIFO). The engine's release
//! loop pops due entries; a zero delay bypasses the heap entirely.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::config::DelayConfig;
use crate::message::NotificationPayload;

/// A notification waiting for its ready time.
#[derive(Debug)]
pub struct PendingNotification {
    pub payload: NotificationPayload,
    pub ready_at: Instant,
    seq: u64,
}

impl PartialEq for PendingNotification {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl Eq for PendingNotification {}

impl PartialOrd for PendingNotification {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingNotification {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Outcome of scheduling a payload.
#[derive(Debug)]
pub enum Scheduled {
    /// No delay configured: hand the payload straight to the formatter.
    Immediate(NotificationPayload),
    /// Queued until its ready time.
    Queued,
}

/// Time-ordered holding area for delayed notifications.
#[derive(Debug)]
pub struct DelayScheduler {
    heap: Mutex<BinaryHeap<Reverse<PendingNotification>>>,
    seq: AtomicU64,
    default_delay: Duration,
    max_delay: Duration,
}

impl DelayScheduler {
    pub fn new(config: &DelayConfig) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            default_delay: Duration::from_secs(config.default_delay_secs),
            max_delay: Duration::from_secs(config.max_delay_secs),
        }
    }

    /// Schedule a payload according to its subscription's delay (falling
    /// back to the configured default, capped at the maximum).
    pub fn schedule(&self, payload: NotificationPayload) -> Scheduled {
        let delay = payload
            .policy
            .delay_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_delay)
            .min(self.max_delay);

        if delay.is_zero() {
            return Scheduled::Immediate(payload);
        }

        let pending = PendingNotification {
            payload,
            ready_at: Instant::now() + delay,
            seq: self.seq.fetch_add(1, AtomicOrdering::Relaxed),
        };
        self.heap.lock().push(Reverse(pending));
        Scheduled::Queued
    }

    /// Pop every entry whose ready time has elapsed, in ready-time order
    /// (FIFO for ties).
    pub fn pop_due(&self) -> Vec<NotificationPayload> {
        let now = Instant::now();
        let mut heap = self.heap.lock();
        let mut due = Vec::new();
        while let Some(Reverse(head)) = heap.peek() {
            if head.ready_at > now {
                break;
            }
            let Reverse(pending) = heap.pop().expect("peeked entry exists");
            due.push(pending.payload);
        }
        due
    }

    /// Ready time of the earliest queued entry, if any. The release loop
    /// sleeps until this instant.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.lock().peek().map(|Reverse(p)| p.ready_at)
    }

    /// Drain everything regardless of ready time, in heap order. Used on
    /// shutdown: a queued notification is still delivered, best-effort.
    pub fn drain(&self) -> Vec<NotificationPayload> {
        let mut heap = self.heap.lock();
        let mut all = Vec::with_capacity(heap.len());
        while let Some(Reverse(pending)) = heap.pop() {
            all.push(pending.payload);
        }
        all
    }

    /// Number of queued notifications.
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{IncomingMessage, MatchEvent};
    use crate::subscription::DeliveryPolicy;
    use chrono::Utc;
    use std::sync::Arc;

    fn payload(owner: i64, delay_secs: Option<u64>, text: &str) -> NotificationPayload {
        let event = MatchEvent {
            owner_id: owner,
            subscription_id: 1,
            pattern: "kw".to_string(),
            policy: DeliveryPolicy {
                delay_secs,
                ..Default::default()
            },
            message: Arc::new(IncomingMessage::text(1, 1, text)),
            matched_at: Utc::now(),
        };
        NotificationPayload::from_events(vec![event]).unwrap()
    }

    fn scheduler(default_delay: u64, max_delay: u64) -> DelayScheduler {
        DelayScheduler::new(&DelayConfig {
            default_delay_secs: default_delay,
            max_delay_secs: max_delay,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delay_is_immediate() {
        let scheduler = scheduler(0, 3_600);
        match scheduler.schedule(payload(1, None, "x")) {
            Scheduled::Immediate(p) => assert_eq!(p.owner_id, 1),
            Scheduled::Queued => panic!("expected immediate"),
        }
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_only_after_ready_time() {
        let scheduler = scheduler(0, 3_600);
        assert!(matches!(
            scheduler.schedule(payload(1, Some(10), "x")),
            Scheduled::Queued
        ));

        // Not before 10s.
        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(scheduler.pop_due().is_empty());

        // Released within a second after.
        tokio::time::advance(Duration::from_secs(2)).await;
        let due = scheduler.pop_due();
        assert_eq!(due.len(), 1);
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_order_and_fifo_ties() {
        let scheduler = scheduler(0, 3_600);
        scheduler.schedule(payload(1, Some(20), "late"));
        scheduler.schedule(payload(2, Some(10), "early-a"));
        scheduler.schedule(payload(3, Some(10), "early-b"));

        tokio::time::advance(Duration::from_secs(21)).await;
        let due = scheduler.pop_due();
        let owners: Vec<i64> = due.iter().map(|p| p.owner_id).collect();
        // Ready-time order, insertion order within the tie.
        assert_eq!(owners, vec![2, 3, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_capped_at_max() {
        let scheduler = scheduler(0, 60);
        scheduler.schedule(payload(1, Some(10_000), "x"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(scheduler.pop_due().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_delay_applies_without_override() {
        let scheduler = scheduler(30, 3_600);
        assert!(matches!(
            scheduler.schedule(payload(1, None, "x")),
            Scheduled::Queued
        ));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(scheduler.pop_due().is_empty());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.pop_due().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_deadline_tracks_earliest_entry() {
        let scheduler = scheduler(0, 3_600);
        assert!(scheduler.next_deadline().is_none());

        scheduler.schedule(payload(1, Some(20), "x"));
        scheduler.schedule(payload(1, Some(5), "y"));

        let deadline = scheduler.next_deadline().unwrap();
        let expected = Instant::now() + Duration::from_secs(5);
        assert!(deadline <= expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_returns_everything() {
        let scheduler = scheduler(0, 3_600);
        scheduler.schedule(payload(1, Some(100), "x"));
        scheduler.schedule(payload(2, Some(200), "y"));

        let all = scheduler.drain();
        assert_eq!(all.len(), 2);
        assert!(scheduler.is_empty());
    }
}
