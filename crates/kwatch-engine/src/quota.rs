//! Per-user quota counters.
//!
//! The registry reports subscription counts through here (the ceiling
//! itself is enforced under the registry's entry lock); the notification
//! rate ceiling is checked by the dispatcher before each send. The rate
//! ceiling uses a fixed window: the counter resets at the window boundary,
//! and only delivered notifications stay counted.

use dashmap::DashMap;
use tokio::time::Instant;
use std::time::Duration;

/// Counters tracked per user.
#[derive(Debug)]
pub struct QuotaCounters {
    pub subscription_count: usize,
    pub sent_in_window: u32,
    pub window_started: Instant,
}

impl QuotaCounters {
    fn new() -> Self {
        Self {
            subscription_count: 0,
            sent_in_window: 0,
            window_started: Instant::now(),
        }
    }
}

/// Keyed quota state. Each user's counters live under their own map entry,
/// so one user's traffic never contends with another's.
#[derive(Debug, Default)]
pub struct QuotaLedger {
    counters: DashMap<i64, QuotaCounters>,
}

impl QuotaLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current subscription count for a user.
    pub fn subscription_count(&self, owner_id: i64) -> usize {
        self.counters
            .get(&owner_id)
            .map(|c| c.subscription_count)
            .unwrap_or(0)
    }

    /// Record a subscription being added.
    pub fn on_subscription_added(&self, owner_id: i64) {
        self.counters
            .entry(owner_id)
            .or_insert_with(QuotaCounters::new)
            .subscription_count += 1;
    }

    /// Record a subscription being removed.
    pub fn on_subscription_removed(&self, owner_id: i64) {
        if let Some(mut entry) = self.counters.get_mut(&owner_id) {
            entry.subscription_count = entry.subscription_count.saturating_sub(1);
        }
    }

    /// Try to consume one notification slot in the user's current window.
    ///
    /// Returns `false` when the fixed-window ceiling is hit; the caller
    /// drops the notification without retrying.
    pub fn try_acquire_send(&self, owner_id: i64, ceiling: u32, window: Duration) -> bool {
        let mut entry = self
            .counters
            .entry(owner_id)
            .or_insert_with(QuotaCounters::new);

        let now = Instant::now();
        if now.duration_since(entry.window_started) >= window {
            entry.sent_in_window = 0;
            entry.window_started = now;
        }

        if entry.sent_in_window >= ceiling {
            return false;
        }
        entry.sent_in_window += 1;
        true
    }

    /// Return a slot acquired for a send that ultimately failed, so the
    /// window only ever counts delivered notifications.
    ///
    /// A slot released after its window rolled over decrements the fresh
    /// counter instead; the error there is at most one notification and
    /// only in the permissive direction.
    pub fn release_send(&self, owner_id: i64) {
        if let Some(mut entry) = self.counters.get_mut(&owner_id) {
            entry.sent_in_window = entry.sent_in_window.saturating_sub(1);
        }
    }

    /// Notifications sent in the user's current window.
    pub fn sent_in_window(&self, owner_id: i64) -> u32 {
        self.counters
            .get(&owner_id)
            .map(|c| c.sent_in_window)
            .unwrap_or(0)
    }
}
