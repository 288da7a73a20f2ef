//! Time-windowed suppression of repeated matches.
//!
//! The deduplicator is the sole dedup authority in the pipeline:
//! downstream stages trust its accept/reject decision and never
//! re-examine message content.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use crate::message::{ContentType, MatchEvent};

/// Time-windowed duplicate filter keyed by match fingerprint.
#[derive(Debug)]
pub struct Deduplicator {
    entries: DashMap<u64, Instant>,
    window: Duration,
    enabled: bool,
}

impl Deduplicator {
    pub fn new(window: Duration, enabled: bool) -> Self {
        Self {
            entries: DashMap::new(),
            window,
            enabled,
        }
    }

    /// Decide whether a match event passes.
    ///
    /// An unexpired entry for the same fingerprint rejects the event
    /// without touching state; otherwise the fingerprint is recorded with
    /// a fresh expiry and the event is accepted. Expired entries found on
    /// lookup are replaced in place.
    pub fn should_accept(&self, event: &MatchEvent) -> bool {
        if !self.enabled {
            return true;
        }

        let fingerprint = self.fingerprint(event);
        let now = Instant::now();

        match self.entries.entry(fingerprint) {
            dashmap::Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    debug!(
                        owner_id = event.owner_id,
                        pattern = %event.pattern,
                        "suppressing duplicate match"
                    );
                    false
                } else {
                    occupied.insert(now + self.window);
                    true
                }
            }
            dashmap::Entry::Vacant(vacant) => {
                vacant.insert(now + self.window);
                true
            }
        }
    }

    /// Drop every expired entry. Run periodically to bound memory; lookups
    /// also evict lazily so correctness never depends on the sweep.
    pub fn sweep(&self) {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "dedup sweep");
        }
    }

    /// Number of tracked fingerprints, including expired ones not yet
    /// swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fingerprint of (owner, normalized content, source).
    ///
    /// Text is lowercased and whitespace-collapsed before hashing. Media
    /// messages hash content type, source, sender, and a window-sized time
    /// bucket instead, so identical media bursts collapse per window.
    fn fingerprint(&self, event: &MatchEvent) -> u64 {
        let mut hasher = DefaultHasher::new();
        event.owner_id.hash(&mut hasher);
        event.message.source_id.hash(&mut hasher);

        if event.message.content_type == ContentType::Text {
            normalize(event.message.body()).hash(&mut hasher);
        } else {
            event.message.content_type.label().hash(&mut hasher);
            event.message.sender_id.hash(&mut hasher);
            let bucket_secs = self.window.as_secs().max(1) as i64;
            (event.matched_at.timestamp() / bucket_secs).hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Lowercase and collapse runs of whitespace to single spaces.
fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            out.extend(c.to_lowercase());
            last_was_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}
