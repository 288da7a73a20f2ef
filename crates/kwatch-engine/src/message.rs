//! Message and match-event types flowing through the pipeline.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::subscription::DeliveryPolicy;

/// Content classification of an incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Photo,
    Video,
    Document,
    Voice,
}

impl ContentType {
    /// Short label used in dedupe fingerprints and rendered output.
    pub fn label(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Photo => "photo",
            ContentType::Video => "video",
            ContentType::Document => "document",
            ContentType::Voice => "voice",
        }
    }
}

/// Category of the sender within the monitored source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderKind {
    User,
    Admin,
    Anonymous,
}

/// Kind of monitored source a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Channel,
    Group,
}

impl SourceKind {
    /// Human-readable label for the `{source}` template placeholder.
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Channel => "channel message",
            SourceKind::Group => "group message",
        }
    }
}

/// A message pushed by the external platform client.
///
/// Transient: exists for the duration of one pipeline pass and is shared
/// between match events via `Arc`, never persisted by the engine. It
/// deserializes from ingestion-layer records, where only the source and
/// message ids are mandatory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Id of the monitored source (channel or group).
    pub source_id: i64,
    /// Display name of the source.
    #[serde(default)]
    pub source_name: String,
    /// Channel or group.
    #[serde(default = "default_source_kind")]
    pub source_kind: SourceKind,
    /// Platform message id, unique within the source.
    pub message_id: i64,
    /// Sender id, if known.
    #[serde(default)]
    pub sender_id: Option<i64>,
    #[serde(default = "default_sender_kind")]
    pub sender_kind: SenderKind,
    /// Sender handle, if known.
    #[serde(default)]
    pub sender_username: Option<String>,
    /// Sender display name, if known.
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default = "default_content_type")]
    pub content_type: ContentType,
    /// Absent or empty for media-only messages.
    #[serde(default)]
    pub text: Option<String>,
    /// Surrounding lines captured by the ingestion layer, oldest first.
    #[serde(default)]
    pub context_lines: Vec<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

fn default_source_kind() -> SourceKind {
    SourceKind::Group
}

fn default_sender_kind() -> SenderKind {
    SenderKind::User
}

fn default_content_type() -> ContentType {
    ContentType::Text
}

impl IncomingMessage {
    /// Construct a plain text message from a group source.
    pub fn text(source_id: i64, message_id: i64, text: impl Into<String>) -> Self {
        Self {
            source_id,
            source_name: String::new(),
            source_kind: SourceKind::Group,
            message_id,
            sender_id: None,
            sender_kind: SenderKind::User,
            sender_username: None,
            sender_name: None,
            content_type: ContentType::Text,
            text: Some(text.into()),
            context_lines: Vec::new(),
            received_at: Utc::now(),
        }
    }

    /// Construct a media message with no text body.
    pub fn media(source_id: i64, message_id: i64, content_type: ContentType) -> Self {
        Self {
            content_type,
            text: None,
            ..Self::text(source_id, message_id, "")
        }
    }

    pub fn with_source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    pub fn with_source_kind(mut self, kind: SourceKind) -> Self {
        self.source_kind = kind;
        self
    }

    pub fn with_sender(mut self, id: i64, kind: SenderKind) -> Self {
        self.sender_id = Some(id);
        self.sender_kind = kind;
        self
    }

    pub fn with_sender_names(
        mut self,
        username: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        self.sender_username = Some(username.into());
        self.sender_name = Some(name.into());
        self
    }

    pub fn with_context_lines(mut self, lines: Vec<String>) -> Self {
        self.context_lines = lines;
        self
    }

    /// The text body used for matching; empty for media messages.
    pub fn body(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Record that a specific message satisfied a specific subscription.
///
/// Carries a snapshot of the subscription's delivery policy so downstream
/// stages never consult the registry; deleting the subscription after a
/// match does not cancel in-flight notifications.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    pub owner_id: i64,
    pub subscription_id: u64,
    /// Pattern text as registered, for rendering and bucket keys.
    pub pattern: String,
    pub policy: DeliveryPolicy,
    pub message: Arc<IncomingMessage>,
    pub matched_at: DateTime<Utc>,
}

/// One or more match events ready to become a single notification.
///
/// Produced by the aggregator (a singleton payload when aggregation is off),
/// consumed by the delay scheduler, formatter, and dispatcher.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    pub owner_id: i64,
    pub subscription_id: u64,
    pub pattern: String,
    pub policy: DeliveryPolicy,
    /// Events in arrival order. Never empty.
    pub events: Vec<MatchEvent>,
}

impl NotificationPayload {
    /// Build a payload from buffered events. The policy and keys come from
    /// the first event; all events share the same (owner, subscription).
    pub fn from_events(events: Vec<MatchEvent>) -> Option<Self> {
        let first = events.first()?;
        Some(Self {
            owner_id: first.owner_id,
            subscription_id: first.subscription_id,
            pattern: first.pattern.clone(),
            policy: first.policy.clone(),
            events,
        })
    }
}
