//! Persistence interface for subscriptions.
//!
//! The registry's in-memory state is a cache rebuilt from a
//! [`SubscriptionStore`] at startup; adds, removes, and setting changes
//! write through. Durability itself is the store's problem, not the
//! engine's.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::filter::SubscriptionFilters;
use crate::subscription::{DeliveryPolicy, SubscriptionKind};

/// Serializable form of a subscription, as handed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSubscription {
    pub owner_id: i64,
    pub pattern: String,
    pub kind: SubscriptionKind,
    #[serde(default)]
    pub filters: SubscriptionFilters,
    #[serde(default)]
    pub policy: DeliveryPolicy,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

/// Durable storage for subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Load every stored subscription.
    async fn load_all(&self) -> Result<Vec<StoredSubscription>>;

    /// Insert or update one subscription, keyed by (owner, pattern, kind).
    async fn save(&self, sub: &StoredSubscription) -> Result<()>;

    /// Delete a subscription. Missing entries are not an error.
    async fn delete(&self, owner_id: i64, pattern: &str, kind: SubscriptionKind) -> Result<()>;
}

/// In-memory store. Useful for tests and for running without durability.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<Vec<StoredSubscription>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn load_all(&self) -> Result<Vec<StoredSubscription>> {
        Ok(self.entries.lock().await.clone())
    }

    async fn save(&self, sub: &StoredSubscription) -> Result<()> {
        let mut entries = self.entries.lock().await;
        match entries.iter_mut().find(|e| {
            e.owner_id == sub.owner_id && e.pattern == sub.pattern && e.kind == sub.kind
        }) {
            Some(existing) => *existing = sub.clone(),
            None => entries.push(sub.clone()),
        }
        Ok(())
    }

    async fn delete(&self, owner_id: i64, pattern: &str, kind: SubscriptionKind) -> Result<()> {
        self.entries
            .lock()
            .await
            .retain(|e| !(e.owner_id == owner_id && e.pattern == pattern && e.kind == kind));
        Ok(())
    }
}

/// JSON-file-backed store. The whole file is rewritten on every change,
/// which is fine for the subscription counts this engine quotas at.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the file.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_entries(&self) -> Result<Vec<StoredSubscription>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let entries = serde_json::from_slice(&bytes)?;
                Ok(entries)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn write_entries(&self, entries: &[StoredSubscription]) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let bytes = serde_json::to_vec_pretty(entries)?;
        tokio::fs::write(&self.path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for JsonFileStore {
    async fn load_all(&self) -> Result<Vec<StoredSubscription>> {
        let _guard = self.lock.lock().await;
        self.read_entries().await
    }

    async fn save(&self, sub: &StoredSubscription) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        match entries.iter_mut().find(|e| {
            e.owner_id == sub.owner_id && e.pattern == sub.pattern && e.kind == sub.kind
        }) {
            Some(existing) => *existing = sub.clone(),
            None => entries.push(sub.clone()),
        }
        self.write_entries(&entries).await
    }

    async fn delete(&self, owner_id: i64, pattern: &str, kind: SubscriptionKind) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        entries.retain(|e| !(e.owner_id == owner_id && e.pattern == pattern && e.kind == kind));
        self.write_entries(&entries).await
    }
}
