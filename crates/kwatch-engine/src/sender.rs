//! Outbound delivery seam.
//!
//! The engine renders notification text and hands it to a [`Notifier`];
//! everything platform-specific (chat API, webhooks, email) lives behind
//! this trait. Implementations classify failures as transient or permanent
//! so the dispatcher knows whether retrying can help.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::config::FormatFlags;

/// Delivery failure, classified for retry purposes.
#[derive(Debug, Error)]
pub enum SendError {
    /// Worth retrying: timeouts, connection resets, 5xx-style failures.
    #[error("transient send failure: {0}")]
    Transient(String),
    /// Retrying cannot help: recipient gone, payload rejected, auth revoked.
    #[error("permanent send failure: {0}")]
    Permanent(String),
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SendError::Transient(_))
    }
}

/// Formatting hints passed alongside the rendered text, for platforms
/// that need to know which styling markers are in play.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    pub format: FormatFlags,
}

/// Destination-agnostic delivery of rendered notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one rendered notification to its owner.
    async fn send(&self, owner_id: i64, text: &str, opts: &SendOptions)
    -> Result<(), SendError>;
}

/// Notifier that logs notifications instead of delivering them.
///
/// Useful for local runs and as the default sink when no platform client
/// is wired up.
#[derive(Debug, Default)]
pub struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn send(&self, owner_id: i64, text: &str, _opts: &SendOptions) -> Result<(), SendError> {
        info!(owner_id, "notification:\n{text}");
        Ok(())
    }
}
