//! Message-to-subscription matching with a bounded evaluation budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use tracing::warn;

use crate::error::Error;
use crate::filter;
use crate::message::{ContentType, IncomingMessage, MatchEvent};
use crate::metrics::EngineMetrics;
use crate::subscription::{CompiledPattern, Subscription, SubscriptionRegistry};

/// Evaluates incoming messages against the registry's subscriptions.
///
/// Each pattern evaluation runs under a wall-clock budget: an evaluation
/// that blows the budget is treated as a non-match and logged, so one
/// pathological pattern can never stall the pipeline for other users.
/// The `regex` crate guarantees linear-time search (no backtracking), so
/// in practice the budget only trips on extreme pattern/text sizes.
pub struct Matcher {
    registry: Arc<SubscriptionRegistry>,
    metrics: Arc<EngineMetrics>,
    budget: Duration,
    max_scan_len: usize,
}

impl Matcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        metrics: Arc<EngineMetrics>,
        budget: Duration,
        max_scan_len: usize,
    ) -> Self {
        Self {
            registry,
            metrics,
            budget,
            max_scan_len,
        }
    }

    /// Evaluate one message, producing a match event per satisfied
    /// subscription. Failures are isolated per subscription.
    pub fn evaluate(&self, message: &Arc<IncomingMessage>) -> Vec<MatchEvent> {
        let text = truncate_to_boundary(message.body(), self.max_scan_len);
        let lowered = text.to_lowercase();

        let mut events = Vec::new();
        for sub in self.registry.match_candidates(message) {
            if !filter::passes(message, &sub.filters) {
                continue;
            }
            if !self.pattern_matches(&sub, message, text, &lowered) {
                continue;
            }
            self.metrics.record_match(sub.owner_id);
            events.push(MatchEvent {
                owner_id: sub.owner_id,
                subscription_id: sub.id,
                pattern: sub.pattern.clone(),
                policy: sub.policy.clone(),
                message: Arc::clone(message),
                matched_at: Utc::now(),
            });
        }
        events
    }

    fn pattern_matches(
        &self,
        sub: &Subscription,
        message: &IncomingMessage,
        text: &str,
        lowered: &str,
    ) -> bool {
        // Media messages carry no matchable text: they can only satisfy an
        // empty "any" pattern whose filter admits their content type.
        if message.content_type != ContentType::Text {
            return sub.compiled.is_any() && sub.filters.allows_content(message.content_type);
        }

        let started = Instant::now();
        let matched = match &sub.compiled {
            CompiledPattern::Any => true,
            CompiledPattern::Literal(needle) => lowered.contains(needle.as_str()),
            CompiledPattern::Regex(regex) => regex.is_match(text),
        };

        let elapsed = started.elapsed();
        if elapsed > self.budget {
            self.metrics.match_timeouts.increment();
            let err = Error::MatchTimeout {
                pattern: sub.pattern.clone(),
                budget_ms: self.budget.as_millis() as u64,
            };
            warn!(
                owner_id = sub.owner_id,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %err,
                "treating as non-match"
            );
            return false;
        }
        matched
    }
}

/// Truncate to at most `max_len` bytes without splitting a UTF-8 character.
fn truncate_to_boundary(text: &str, max_len: usize) -> &str {
    if text.len() <= max_len {
        return text;
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
