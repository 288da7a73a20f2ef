//! Kwatch: keyword notification engine for chat-style message streams.
//!
//! This crate turns a stream of platform messages into per-user
//! notifications: users register keyword or regex subscriptions and the
//! engine matches, filters, deduplicates, batches, delays, renders, and
//! delivers.
//!
//! ## Pipeline
//!
//! - [`EngineHandle`] - Assembled pipeline: ingest messages, run commands,
//!   read metrics, shut down
//! - [`Matcher`] - Evaluates messages against registered subscriptions
//! - [`Deduplicator`] - Suppresses repeated matches within a time window
//! - [`Aggregator`] - Batches matches into aggregated notifications
//! - [`DelayScheduler`] - Holds notifications until their ready time
//! - [`Formatter`] - Renders notification text from templates
//! - [`Dispatcher`] - Rate-checks, retries, and delivers
//!
//! ## Registries
//!
//! - [`SubscriptionRegistry`] - Owns all subscriptions, write-through to a
//!   [`SubscriptionStore`]
//! - [`SourceRegistry`] - Per-owner monitored source lists
//! - [`SenderBlacklist`] - Per-owner blocked senders
//! - [`QuotaLedger`] - Subscription ceilings and notification rate windows
//!
//! ## Integration points
//!
//! - [`Notifier`] - Outbound delivery seam; implement for your platform
//! - [`SubscriptionStore`] - Persistence seam; [`JsonFileStore`] and
//!   [`MemoryStore`] are provided
//! - [`CommandService`] - Typed command surface for user requests

pub mod aggregator;
pub mod commands;
pub mod config;
pub mod dedup;
pub mod delay;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod filter;
pub mod formatter;
pub mod matcher;
pub mod message;
pub mod metrics;
pub mod quota;
pub mod sender;
pub mod sources;
pub mod storage;
pub mod subscription;

pub use aggregator::Aggregator;
pub use commands::{Command, CommandService};
pub use config::{EngineConfig, FormatFlags};
pub use dedup::Deduplicator;
pub use delay::DelayScheduler;
pub use dispatcher::{Dispatcher, OperatorAlert};
pub use engine::EngineHandle;
pub use error::{Error, Result};
pub use filter::{HourRange, SubscriptionFilters};
pub use formatter::Formatter;
pub use matcher::Matcher;
pub use message::{
    ContentType, IncomingMessage, MatchEvent, NotificationPayload, SenderKind, SourceKind,
};
pub use metrics::{EngineMetrics, MetricsSnapshot, OwnerStats};
pub use quota::QuotaLedger;
pub use sender::{ConsoleNotifier, Notifier, SendError, SendOptions};
pub use sources::{SenderBlacklist, SourceRegistry};
pub use storage::{JsonFileStore, MemoryStore, StoredSubscription, SubscriptionStore};
pub use subscription::{
    CompiledPattern, DeliveryPolicy, Subscription, SubscriptionKind, SubscriptionRegistry,
};
