//! Per-owner source allow-lists and sender blacklists.
//!
//! Both are consulted by the registry when collecting match candidates, so
//! a blocked sender or an unmonitored source is rejected before any pattern
//! work happens.

use std::collections::HashSet;

use dashmap::DashMap;

/// Monitored sources per owner.
///
/// An owner with no entry (or an empty set) monitors every source.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    allowed: DashMap<i64, HashSet<i64>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a source to the owner's monitor list. Returns false if it was
    /// already present.
    pub fn add(&self, owner_id: i64, source_id: i64) -> bool {
        self.allowed.entry(owner_id).or_default().insert(source_id)
    }

    /// Remove a source from the owner's monitor list.
    pub fn remove(&self, owner_id: i64, source_id: i64) -> bool {
        match self.allowed.get_mut(&owner_id) {
            Some(mut set) => set.remove(&source_id),
            None => false,
        }
    }

    /// Sources the owner monitors, unordered.
    pub fn list(&self, owner_id: i64) -> Vec<i64> {
        self.allowed
            .get(&owner_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Whether messages from `source_id` may match this owner's
    /// subscriptions.
    pub fn allows(&self, owner_id: i64, source_id: i64) -> bool {
        match self.allowed.get(&owner_id) {
            Some(set) => set.is_empty() || set.contains(&source_id),
            None => true,
        }
    }
}

/// Blocked sender ids per owner.
#[derive(Debug, Default)]
pub struct SenderBlacklist {
    blocked: DashMap<i64, HashSet<i64>>,
}

impl SenderBlacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block a sender for this owner. Returns false if already blocked.
    pub fn block(&self, owner_id: i64, sender_id: i64) -> bool {
        self.blocked.entry(owner_id).or_default().insert(sender_id)
    }

    /// Unblock a sender for this owner.
    pub fn unblock(&self, owner_id: i64, sender_id: i64) -> bool {
        match self.blocked.get_mut(&owner_id) {
            Some(mut set) => set.remove(&sender_id),
            None => false,
        }
    }

    /// Whether the owner has blocked this sender. Anonymous senders are
    /// never blocked.
    pub fn is_blocked(&self, owner_id: i64, sender_id: Option<i64>) -> bool {
        match (sender_id, self.blocked.get(&owner_id)) {
            (Some(id), Some(set)) => set.contains(&id),
            _ => false,
        }
    }
}
