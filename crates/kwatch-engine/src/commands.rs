//! User-facing command surface.
//!
//! One typed entry point for everything a user can ask of the engine:
//! managing subscriptions, delivery policies, monitored sources, blocked
//! senders, and statistics. Input validation lives here so the registries
//! below only ever see well-formed requests. Every command produces a
//! human-readable reply suitable for echoing back over a chat interface.

use std::sync::Arc;

use tracing::info;

use crate::config::{EngineConfig, FormatFlags};
use crate::error::{Error, Result};
use crate::filter::SubscriptionFilters;
use crate::metrics::EngineMetrics;
use crate::quota::QuotaLedger;
use crate::sources::{SenderBlacklist, SourceRegistry};
use crate::subscription::{SubscriptionKind, SubscriptionRegistry};

/// Aggregation intervals a user may request, in seconds.
const AGGREGATION_INTERVAL_RANGE: std::ops::RangeInclusive<u64> = 10..=3_600;

/// A request from the command surface.
#[derive(Debug, Clone)]
pub enum Command {
    Subscribe {
        owner_id: i64,
        pattern: String,
        kind: SubscriptionKind,
        filters: SubscriptionFilters,
    },
    Unsubscribe {
        owner_id: i64,
        pattern: String,
    },
    List {
        owner_id: i64,
    },
    Toggle {
        owner_id: i64,
        pattern: String,
        enabled: bool,
    },
    SetTemplate {
        owner_id: i64,
        pattern: String,
        template: String,
    },
    SetFormat {
        owner_id: i64,
        format: FormatFlags,
    },
    SetDelay {
        owner_id: i64,
        delay_secs: u64,
    },
    SetAggregation {
        owner_id: i64,
        pattern: String,
        aggregate: bool,
        interval_secs: Option<u64>,
    },
    SetForwarding {
        owner_id: i64,
        pattern: String,
        targets: Vec<i64>,
    },
    AddSource {
        owner_id: i64,
        source_id: i64,
    },
    RemoveSource {
        owner_id: i64,
        source_id: i64,
    },
    ListSources {
        owner_id: i64,
    },
    BlockSender {
        owner_id: i64,
        sender_id: i64,
    },
    UnblockSender {
        owner_id: i64,
        sender_id: i64,
    },
    Stats {
        owner_id: i64,
    },
}

/// Executes commands against the engine's registries.
pub struct CommandService {
    registry: Arc<SubscriptionRegistry>,
    sources: Arc<SourceRegistry>,
    blacklist: Arc<SenderBlacklist>,
    quotas: Arc<QuotaLedger>,
    metrics: Arc<EngineMetrics>,
    config: EngineConfig,
}

impl CommandService {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        sources: Arc<SourceRegistry>,
        blacklist: Arc<SenderBlacklist>,
        quotas: Arc<QuotaLedger>,
        metrics: Arc<EngineMetrics>,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            sources,
            blacklist,
            quotas,
            metrics,
            config,
        }
    }

    /// Execute one command and produce a reply for the requesting user.
    pub async fn execute(&self, command: Command) -> Result<String> {
        match command {
            Command::Subscribe {
                owner_id,
                pattern,
                kind,
                filters,
            } => {
                let sub = self.registry.add(owner_id, pattern, kind, filters).await?;
                info!(owner_id, pattern = %sub.pattern, ?kind, "subscription added");
                Ok(format!(
                    "Subscribed to '{}' ({}/{} used)",
                    sub.pattern,
                    self.quotas.subscription_count(owner_id),
                    self.config.monitor.max_keywords_per_user,
                ))
            }
            Command::Unsubscribe { owner_id, pattern } => {
                if self.registry.remove(owner_id, &pattern).await? {
                    info!(owner_id, %pattern, "subscription removed");
                    Ok(format!("Unsubscribed from '{pattern}'"))
                } else {
                    Err(Error::NotFound(pattern))
                }
            }
            Command::List { owner_id } => {
                let subs = self.registry.list(owner_id);
                if subs.is_empty() {
                    return Ok("No subscriptions".to_string());
                }
                let mut reply = format!("{} subscription(s):", subs.len());
                for sub in subs {
                    reply.push_str(&format!(
                        "\n- '{}' [{}]{}",
                        sub.pattern,
                        match sub.kind {
                            SubscriptionKind::Literal => "keyword",
                            SubscriptionKind::Regex => "regex",
                        },
                        if sub.enabled { "" } else { " (disabled)" },
                    ));
                }
                Ok(reply)
            }
            Command::Toggle {
                owner_id,
                pattern,
                enabled,
            } => {
                if self.registry.set_enabled(owner_id, &pattern, enabled).await? {
                    Ok(format!(
                        "'{pattern}' {}",
                        if enabled { "enabled" } else { "disabled" }
                    ))
                } else {
                    Err(Error::NotFound(pattern))
                }
            }
            Command::SetTemplate {
                owner_id,
                pattern,
                template,
            } => {
                if self
                    .registry
                    .set_template(owner_id, &pattern, &template)
                    .await?
                {
                    Ok(format!("Template updated for '{pattern}'"))
                } else {
                    Err(Error::NotFound(pattern))
                }
            }
            Command::SetFormat { owner_id, format } => {
                let updated = self.registry.set_format_all(owner_id, format).await?;
                Ok(format!("Format updated on {updated} subscription(s)"))
            }
            Command::SetDelay {
                owner_id,
                delay_secs,
            } => {
                if delay_secs > self.config.delay.max_delay_secs {
                    return Err(Error::config(format!(
                        "delay must be at most {} seconds",
                        self.config.delay.max_delay_secs
                    )));
                }
                let updated = self.registry.set_delay_all(owner_id, delay_secs).await?;
                Ok(format!(
                    "Delay set to {delay_secs}s on {updated} subscription(s)"
                ))
            }
            Command::SetAggregation {
                owner_id,
                pattern,
                aggregate,
                interval_secs,
            } => {
                if let Some(interval) = interval_secs
                    && !AGGREGATION_INTERVAL_RANGE.contains(&interval)
                {
                    return Err(Error::config(format!(
                        "aggregation interval must be between {} and {} seconds",
                        AGGREGATION_INTERVAL_RANGE.start(),
                        AGGREGATION_INTERVAL_RANGE.end()
                    )));
                }
                if self
                    .registry
                    .set_aggregation(owner_id, &pattern, aggregate, interval_secs)
                    .await?
                {
                    Ok(format!(
                        "Aggregation {} for '{pattern}'",
                        if aggregate { "enabled" } else { "disabled" }
                    ))
                } else {
                    Err(Error::NotFound(pattern))
                }
            }
            Command::SetForwarding {
                owner_id,
                pattern,
                targets,
            } => {
                if targets.contains(&owner_id) {
                    return Err(Error::config("forward targets must not include yourself"));
                }
                let count = targets.len();
                if self
                    .registry
                    .set_forwarding(owner_id, &pattern, targets)
                    .await?
                {
                    Ok(if count == 0 {
                        format!("Forwarding disabled for '{pattern}'")
                    } else {
                        format!("Forwarding '{pattern}' to {count} user(s)")
                    })
                } else {
                    Err(Error::NotFound(pattern))
                }
            }
            Command::AddSource {
                owner_id,
                source_id,
            } => {
                if self.sources.add(owner_id, source_id) {
                    Ok(format!("Now monitoring source {source_id}"))
                } else {
                    Ok(format!("Source {source_id} was already monitored"))
                }
            }
            Command::RemoveSource {
                owner_id,
                source_id,
            } => {
                if self.sources.remove(owner_id, source_id) {
                    Ok(format!("Stopped monitoring source {source_id}"))
                } else {
                    Err(Error::NotFound(format!("source {source_id}")))
                }
            }
            Command::ListSources { owner_id } => {
                let mut sources = self.sources.list(owner_id);
                if sources.is_empty() {
                    return Ok("Monitoring all sources".to_string());
                }
                sources.sort_unstable();
                Ok(format!(
                    "Monitoring {} source(s): {}",
                    sources.len(),
                    sources
                        .iter()
                        .map(i64::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            }
            Command::BlockSender {
                owner_id,
                sender_id,
            } => {
                self.blacklist.block(owner_id, sender_id);
                Ok(format!("Sender {sender_id} blocked"))
            }
            Command::UnblockSender {
                owner_id,
                sender_id,
            } => {
                if self.blacklist.unblock(owner_id, sender_id) {
                    Ok(format!("Sender {sender_id} unblocked"))
                } else {
                    Err(Error::NotFound(format!("blocked sender {sender_id}")))
                }
            }
            Command::Stats { owner_id } => {
                let stats = self.metrics.owner_stats(owner_id);
                Ok(format!(
                    "Subscriptions: {}/{}\nMatches: {}\nLast match: {}\nNotifications this window: {}/{}",
                    self.quotas.subscription_count(owner_id),
                    self.config.monitor.max_keywords_per_user,
                    stats.as_ref().map(|s| s.matches).unwrap_or(0),
                    stats
                        .as_ref()
                        .and_then(|s| s.last_match)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string()),
                    self.quotas.sent_in_window(owner_id),
                    self.config.notification.notifications_per_window,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn service() -> CommandService {
        let config = EngineConfig::default();
        let quotas = Arc::new(QuotaLedger::new());
        let sources = Arc::new(SourceRegistry::new());
        let blacklist = Arc::new(SenderBlacklist::new());
        let registry = Arc::new(SubscriptionRegistry::new(
            quotas.clone(),
            Arc::new(MemoryStore::new()),
            sources.clone(),
            blacklist.clone(),
            config.monitor.max_keywords_per_user,
        ));
        CommandService::new(
            registry,
            sources,
            blacklist,
            quotas,
            Arc::new(EngineMetrics::new()),
            config,
        )
    }

    fn subscribe(owner_id: i64, pattern: &str) -> Command {
        Command::Subscribe {
            owner_id,
            pattern: pattern.to_string(),
            kind: SubscriptionKind::Literal,
            filters: SubscriptionFilters::default(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_and_list() {
        let service = service();
        let reply = service.execute(subscribe(1, "foo")).await.unwrap();
        assert!(reply.contains("'foo'"));
        assert!(reply.contains("1/10"));

        let reply = service.execute(Command::List { owner_id: 1 }).await.unwrap();
        assert!(reply.contains("1 subscription(s)"));
        assert!(reply.contains("'foo' [keyword]"));
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_pattern() {
        let service = service();
        let err = service
            .execute(Command::Unsubscribe {
                owner_id: 1,
                pattern: "nope".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_toggle_shows_in_listing() {
        let service = service();
        service.execute(subscribe(1, "foo")).await.unwrap();
        service
            .execute(Command::Toggle {
                owner_id: 1,
                pattern: "foo".to_string(),
                enabled: false,
            })
            .await
            .unwrap();

        let reply = service.execute(Command::List { owner_id: 1 }).await.unwrap();
        assert!(reply.contains("(disabled)"));
    }

    #[tokio::test]
    async fn test_delay_validated_against_ceiling() {
        let service = service();
        service.execute(subscribe(1, "foo")).await.unwrap();

        let err = service
            .execute(Command::SetDelay {
                owner_id: 1,
                delay_secs: 1_000_000,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let reply = service
            .execute(Command::SetDelay {
                owner_id: 1,
                delay_secs: 60,
            })
            .await
            .unwrap();
        assert!(reply.contains("1 subscription(s)"));
    }

    #[tokio::test]
    async fn test_aggregation_interval_validated() {
        let service = service();
        service.execute(subscribe(1, "foo")).await.unwrap();

        let err = service
            .execute(Command::SetAggregation {
                owner_id: 1,
                pattern: "foo".to_string(),
                aggregate: true,
                interval_secs: Some(5),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        assert!(
            service
                .execute(Command::SetAggregation {
                    owner_id: 1,
                    pattern: "foo".to_string(),
                    aggregate: true,
                    interval_secs: Some(120),
                })
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_forwarding_command() {
        let service = service();
        service.execute(subscribe(1, "foo")).await.unwrap();

        let err = service
            .execute(Command::SetForwarding {
                owner_id: 1,
                pattern: "foo".to_string(),
                targets: vec![1, 2],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let reply = service
            .execute(Command::SetForwarding {
                owner_id: 1,
                pattern: "foo".to_string(),
                targets: vec![2, 3],
            })
            .await
            .unwrap();
        assert!(reply.contains("2 user(s)"));

        let reply = service
            .execute(Command::SetForwarding {
                owner_id: 1,
                pattern: "foo".to_string(),
                targets: vec![],
            })
            .await
            .unwrap();
        assert!(reply.contains("disabled"));
    }

    #[tokio::test]
    async fn test_source_commands() {
        let service = service();
        let reply = service
            .execute(Command::ListSources { owner_id: 1 })
            .await
            .unwrap();
        assert_eq!(reply, "Monitoring all sources");

        service
            .execute(Command::AddSource {
                owner_id: 1,
                source_id: 42,
            })
            .await
            .unwrap();
        let reply = service
            .execute(Command::ListSources { owner_id: 1 })
            .await
            .unwrap();
        assert!(reply.contains("42"));

        service
            .execute(Command::RemoveSource {
                owner_id: 1,
                source_id: 42,
            })
            .await
            .unwrap();
        let err = service
            .execute(Command::RemoveSource {
                owner_id: 1,
                source_id: 42,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_block_and_unblock_sender() {
        let service = service();
        service
            .execute(Command::BlockSender {
                owner_id: 1,
                sender_id: 5,
            })
            .await
            .unwrap();
        service
            .execute(Command::UnblockSender {
                owner_id: 1,
                sender_id: 5,
            })
            .await
            .unwrap();
        let err = service
            .execute(Command::UnblockSender {
                owner_id: 1,
                sender_id: 5,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stats_reply() {
        let service = service();
        service.execute(subscribe(1, "foo")).await.unwrap();

        let reply = service.execute(Command::Stats { owner_id: 1 }).await.unwrap();
        assert!(reply.contains("Subscriptions: 1/10"));
        assert!(reply.contains("Last match: never"));
    }
}
