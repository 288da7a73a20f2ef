//! Subscription types and the registry that owns them.
//!
//! The registry is the single owner of all subscriptions. Entries are
//! keyed per owner in a sharded map, so adds and removes for different
//! owners never block each other while same-owner mutations are
//! serialized by the entry lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::FormatFlags;
use crate::error::{Error, Result};
use crate::filter::SubscriptionFilters;
use crate::formatter;
use crate::message::IncomingMessage;
use crate::quota::QuotaLedger;
use crate::sources::{SenderBlacklist, SourceRegistry};
use crate::storage::{StoredSubscription, SubscriptionStore};

/// Compiled regex size limit. Keeps user patterns from ballooning into
/// huge automata.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// How a subscription pattern is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    Literal,
    Regex,
}

/// Pattern in its matchable form. Compiled once at subscribe time and
/// immutable afterwards.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    /// Empty pattern: matches any message the filters allow. This is the
    /// only form media messages can satisfy.
    Any,
    /// Lowercased literal for case-insensitive substring containment.
    Literal(String),
    /// Case-insensitive regex, searched anywhere in the text.
    Regex(Regex),
}

impl CompiledPattern {
    /// Compile a pattern. Regex failures surface as `InvalidPattern` so
    /// they are rejected at subscribe time.
    pub fn compile(pattern: &str, kind: SubscriptionKind) -> Result<Self> {
        if pattern.is_empty() {
            return Ok(CompiledPattern::Any);
        }
        match kind {
            SubscriptionKind::Literal => Ok(CompiledPattern::Literal(pattern.to_lowercase())),
            SubscriptionKind::Regex => {
                let regex = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .size_limit(REGEX_SIZE_LIMIT)
                    .dfa_size_limit(REGEX_SIZE_LIMIT)
                    .build()
                    .map_err(|e| Error::invalid_pattern(pattern, e.to_string()))?;
                Ok(CompiledPattern::Regex(regex))
            }
        }
    }

    /// True for the empty "any" pattern.
    pub fn is_any(&self) -> bool {
        matches!(self, CompiledPattern::Any)
    }
}

/// Per-subscription delivery overrides. Fields left `None` fall back to
/// the engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryPolicy {
    /// Notification template overriding the global one.
    pub template: Option<String>,
    /// Seconds to hold the notification before sending.
    pub delay_secs: Option<u64>,
    /// Whether matches are batched into aggregated notifications.
    pub aggregate: bool,
    /// Aggregation bucket lifetime override.
    pub aggregate_interval_secs: Option<u64>,
    /// Styling flags overriding the global ones.
    pub format: Option<FormatFlags>,
    /// Surrounding context lines to include, capped by config.
    pub context_lines: Option<usize>,
    /// Additional user ids that get a best-effort copy of each
    /// notification.
    pub forward_to: Vec<i64>,
}

/// A user's registered keyword or pattern.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: u64,
    pub owner_id: i64,
    pub pattern: String,
    pub kind: SubscriptionKind,
    pub compiled: CompiledPattern,
    pub filters: SubscriptionFilters,
    pub policy: DeliveryPolicy,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Subscription {
    fn to_stored(&self) -> StoredSubscription {
        StoredSubscription {
            owner_id: self.owner_id,
            pattern: self.pattern.clone(),
            kind: self.kind,
            filters: self.filters.clone(),
            policy: self.policy.clone(),
            enabled: self.enabled,
            created_at: self.created_at,
        }
    }
}

/// Owner-keyed subscription registry with write-through persistence.
pub struct SubscriptionRegistry {
    subs: DashMap<i64, Vec<Subscription>>,
    quotas: Arc<QuotaLedger>,
    store: Arc<dyn SubscriptionStore>,
    sources: Arc<SourceRegistry>,
    blacklist: Arc<SenderBlacklist>,
    max_per_user: usize,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    pub fn new(
        quotas: Arc<QuotaLedger>,
        store: Arc<dyn SubscriptionStore>,
        sources: Arc<SourceRegistry>,
        blacklist: Arc<SenderBlacklist>,
        max_per_user: usize,
    ) -> Self {
        Self {
            subs: DashMap::new(),
            quotas,
            store,
            sources,
            blacklist,
            max_per_user,
            next_id: AtomicU64::new(1),
        }
    }

    /// Rebuild the in-memory cache from the persistence interface.
    ///
    /// Entries whose regex no longer compiles are skipped with a warning
    /// rather than failing startup.
    pub async fn load_from_store(&self) -> Result<usize> {
        let entries = self.store.load_all().await?;
        let mut loaded = 0;
        for stored in entries {
            let compiled = match CompiledPattern::compile(&stored.pattern, stored.kind) {
                Ok(compiled) => compiled,
                Err(e) => {
                    warn!(
                        owner_id = stored.owner_id,
                        pattern = %stored.pattern,
                        error = %e,
                        "skipping stored subscription with invalid pattern"
                    );
                    continue;
                }
            };
            let sub = Subscription {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                owner_id: stored.owner_id,
                pattern: stored.pattern,
                kind: stored.kind,
                compiled,
                filters: stored.filters,
                policy: stored.policy,
                enabled: stored.enabled,
                created_at: stored.created_at,
            };
            self.quotas.on_subscription_added(sub.owner_id);
            self.subs.entry(sub.owner_id).or_default().push(sub);
            loaded += 1;
        }
        Ok(loaded)
    }

    /// Register a new subscription.
    ///
    /// Fails with `QuotaExceeded` at the per-user ceiling, `InvalidPattern`
    /// for a regex that does not compile, and `DuplicateSubscription` for a
    /// repeated (owner, pattern, kind) tuple. The quota counter is only
    /// incremented on success.
    pub async fn add(
        &self,
        owner_id: i64,
        pattern: impl Into<String>,
        kind: SubscriptionKind,
        filters: SubscriptionFilters,
    ) -> Result<Subscription> {
        let pattern = pattern.into();
        let compiled = CompiledPattern::compile(&pattern, kind)?;

        let sub = Subscription {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            owner_id,
            pattern: pattern.clone(),
            kind,
            compiled,
            filters,
            policy: DeliveryPolicy::default(),
            enabled: true,
            created_at: Utc::now(),
        };

        // Quota check, duplicate check, and insert happen under the owner's
        // entry lock so concurrent same-owner adds cannot overshoot the
        // ceiling.
        {
            let mut entry = self.subs.entry(owner_id).or_default();
            if entry.len() >= self.max_per_user {
                return Err(Error::quota(format!(
                    "user {owner_id} already has {} of {} subscriptions",
                    entry.len(),
                    self.max_per_user
                )));
            }
            if entry
                .iter()
                .any(|s| s.pattern == pattern && s.kind == kind)
            {
                return Err(Error::DuplicateSubscription(pattern));
            }
            entry.push(sub.clone());
        }
        self.quotas.on_subscription_added(owner_id);

        if let Err(e) = self.store.save(&sub.to_stored()).await {
            // Roll back the cache so memory and storage agree.
            self.remove_from_cache(owner_id, &pattern);
            return Err(e);
        }
        Ok(sub)
    }

    /// Remove a subscription by pattern. Returns false when nothing
    /// matched; that is not an error.
    pub async fn remove(&self, owner_id: i64, pattern: &str) -> Result<bool> {
        let removed = self.remove_from_cache(owner_id, pattern);
        if let Some(kind) = removed {
            self.store.delete(owner_id, pattern, kind).await?;
            return Ok(true);
        }
        Ok(false)
    }

    fn remove_from_cache(&self, owner_id: i64, pattern: &str) -> Option<SubscriptionKind> {
        let mut entry = self.subs.get_mut(&owner_id)?;
        let pos = entry.iter().position(|s| s.pattern == pattern)?;
        let removed = entry.remove(pos);
        drop(entry);
        self.quotas.on_subscription_removed(owner_id);
        Some(removed.kind)
    }

    /// All of one owner's subscriptions, in creation order.
    pub fn list(&self, owner_id: i64) -> Vec<Subscription> {
        self.subs
            .get(&owner_id)
            .map(|subs| subs.clone())
            .unwrap_or_default()
    }

    /// Every enabled subscription across all owners that is structurally
    /// eligible to be tested against this message: the owner monitors the
    /// message's source and has not blocked its sender.
    pub fn match_candidates(&self, message: &IncomingMessage) -> Vec<Subscription> {
        let mut candidates = Vec::new();
        for entry in self.subs.iter() {
            let owner_id = *entry.key();
            if !self.sources.allows(owner_id, message.source_id) {
                continue;
            }
            if self.blacklist.is_blocked(owner_id, message.sender_id) {
                continue;
            }
            for sub in entry.value() {
                if sub.enabled {
                    candidates.push(sub.clone());
                }
            }
        }
        candidates
    }

    /// Enable or disable a subscription. Returns false when not found.
    pub async fn set_enabled(&self, owner_id: i64, pattern: &str, enabled: bool) -> Result<bool> {
        self.update_matching(owner_id, |s| s.pattern == pattern, |s| s.enabled = enabled)
            .await
            .map(|n| n > 0)
    }

    /// Set a custom notification template on a subscription after checking
    /// that it renders.
    pub async fn set_template(&self, owner_id: i64, pattern: &str, template: &str) -> Result<bool> {
        formatter::validate_template(template)?;
        let template = template.to_string();
        self.update_matching(
            owner_id,
            |s| s.pattern == pattern,
            move |s| s.policy.template = Some(template.clone()),
        )
        .await
        .map(|n| n > 0)
    }

    /// Set the delivery delay on all of the owner's subscriptions.
    /// Returns the number updated.
    pub async fn set_delay_all(&self, owner_id: i64, delay_secs: u64) -> Result<usize> {
        self.update_matching(owner_id, |_| true, move |s| {
            s.policy.delay_secs = Some(delay_secs)
        })
        .await
    }

    /// Set styling flags on all of the owner's subscriptions.
    pub async fn set_format_all(&self, owner_id: i64, format: FormatFlags) -> Result<usize> {
        self.update_matching(owner_id, |_| true, move |s| s.policy.format = Some(format))
            .await
    }

    /// Set the forward targets on one subscription; an empty list turns
    /// forwarding off.
    pub async fn set_forwarding(
        &self,
        owner_id: i64,
        pattern: &str,
        targets: Vec<i64>,
    ) -> Result<bool> {
        self.update_matching(
            owner_id,
            |s| s.pattern == pattern,
            move |s| s.policy.forward_to = targets.clone(),
        )
        .await
        .map(|n| n > 0)
    }

    /// Configure aggregation for one subscription.
    pub async fn set_aggregation(
        &self,
        owner_id: i64,
        pattern: &str,
        aggregate: bool,
        interval_secs: Option<u64>,
    ) -> Result<bool> {
        self.update_matching(
            owner_id,
            |s| s.pattern == pattern,
            move |s| {
                s.policy.aggregate = aggregate;
                s.policy.aggregate_interval_secs = interval_secs;
            },
        )
        .await
        .map(|n| n > 0)
    }

    /// Apply `mutate` to every subscription of `owner_id` selected by
    /// `select`, then persist the updated records. Returns how many were
    /// updated.
    async fn update_matching(
        &self,
        owner_id: i64,
        select: impl Fn(&Subscription) -> bool,
        mutate: impl Fn(&mut Subscription),
    ) -> Result<usize> {
        let updated: Vec<StoredSubscription> = {
            let mut entry = match self.subs.get_mut(&owner_id) {
                Some(entry) => entry,
                None => return Ok(0),
            };
            entry
                .iter_mut()
                .filter(|s| select(s))
                .map(|s| {
                    mutate(s);
                    s.to_stored()
                })
                .collect()
        };
        for stored in &updated {
            self.store.save(stored).await?;
        }
        Ok(updated.len())
    }
}
