//! Engine configuration.
//!
//! All sections deserialize with serde and fall back to defaults, so a
//! partial config file is always valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default notification template.
pub const DEFAULT_TEMPLATE: &str =
    "🔔 {keyword} mentioned in {group_name} ({source})\nFrom: {sender_name}";

/// Marker appended when a rendered notification is cut at the length cap.
pub const TRUNCATION_MARKER: &str = "… [truncated]";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub monitor: MonitorConfig,
    pub dedup: DedupConfig,
    pub aggregation: AggregationConfig,
    pub delay: DelayConfig,
    pub format: FormatFlags,
    pub context: ContextConfig,
    pub notification: NotificationConfig,
    pub pipeline: PipelineConfig,
}

/// Subscription registry limits and timer granularity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Subscription ceiling per user.
    pub max_keywords_per_user: usize,
    /// Granularity of the background timers (aggregation flush, delay
    /// release). Capped at 1s so flush latency stays bounded.
    pub check_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            max_keywords_per_user: 10,
            check_interval_ms: 500,
        }
    }
}

impl MonitorConfig {
    /// Ticker period, clamped to (0, 1s].
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms.clamp(10, 1_000))
    }
}

/// Time-windowed suppression of repeated matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    /// Window within which identical fingerprints are suppressed.
    pub window_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: 600,
        }
    }
}

impl DedupConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Batching of accepted matches per (owner, subscription).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Bucket lifetime before a forced flush. Zero disables aggregation
    /// entirely: every match flushes as a singleton.
    pub default_interval_secs: u64,
    /// Bucket flushes early once it holds this many events.
    pub min_messages: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: 300,
            min_messages: 5,
        }
    }
}

/// Delayed delivery limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelayConfig {
    /// Delay applied when a subscription has none of its own.
    pub default_delay_secs: u64,
    /// Hard ceiling on any configured delay.
    pub max_delay_secs: u64,
}

impl Default for DelayConfig {
    fn default() -> Self {
        Self {
            default_delay_secs: 0,
            max_delay_secs: 3_600,
        }
    }
}

/// Styling flags applied to the matched text in rendered notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatFlags {
    pub bold: bool,
    pub italic: bool,
    pub code: bool,
}

/// Context window of surrounding lines included with a notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub default_lines: usize,
    /// Ceiling on per-subscription context overrides.
    pub max_lines: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_lines: 2,
            max_lines: 5,
        }
    }
}

/// Rendering template, rate ceiling, and dispatcher retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Global template; subscriptions may override it.
    pub template: String,
    /// Notifications allowed per user per window (fixed window).
    pub notifications_per_window: u32,
    pub window_secs: u64,
    /// Total send attempts for transient failures (first try included).
    pub max_send_attempts: u32,
    /// Base delay for exponential backoff between attempts.
    pub retry_base_ms: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            notifications_per_window: 30,
            window_secs: 60,
            max_send_attempts: 3,
            retry_base_ms: 500,
        }
    }
}

impl NotificationConfig {
    pub fn rate_window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Channel sizes and per-evaluation bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Ingestion buffer; when full, incoming messages are dropped and
    /// counted rather than blocking the platform client.
    pub ingest_buffer: usize,
    /// Buffer between internal stages.
    pub stage_buffer: usize,
    /// Wall-clock budget for one pattern evaluation.
    pub match_budget_ms: u64,
    /// Text is truncated to this many bytes before matching.
    pub max_scan_len: usize,
    /// Rendered notifications are truncated to this many characters.
    pub max_render_len: usize,
    /// Separator between events of an aggregated notification.
    pub aggregate_separator: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ingest_buffer: 1_024,
            stage_buffer: 256,
            match_budget_ms: 25,
            max_scan_len: 4_096,
            max_render_len: 4_000,
            aggregate_separator: "\n———\n".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn match_budget(&self) -> Duration {
        Duration::from_millis(self.match_budget_ms)
    }
}
