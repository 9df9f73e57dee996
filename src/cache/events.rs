//! Cache events
//!
//! Invalidations, warming runs and configuration changes are published on a
//! broadcast channel. Subscribers receive every event sent after they
//! subscribed; a lagging subscriber loses the oldest events, never blocks
//! the cache.

use crate::cache::{
    config::CacheConfig,
    types::{CacheKey, Category},
    warming::WarmingReport,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default number of events buffered per subscriber
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Reason for cache invalidation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum InvalidationReason {
    /// Manual invalidation by key
    Manual,

    /// Removed by an expiry sweep
    Expired,

    /// Every entry of one category dropped
    CategoryInvalidated { category: Category },

    /// Results computed under a settings snapshot dropped
    SettingsChanged { settings_hash: String },

    /// `invalidate_all`
    BulkInvalidation,

    /// `clear`
    Cleared,
}

impl std::fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidationReason::Manual => write!(f, "manual invalidation"),
            InvalidationReason::Expired => write!(f, "TTL expired"),
            InvalidationReason::CategoryInvalidated { category } => {
                write!(f, "category invalidated: {}", category)
            }
            InvalidationReason::SettingsChanged { settings_hash } => {
                write!(f, "settings changed: {}", settings_hash)
            }
            InvalidationReason::BulkInvalidation => write!(f, "bulk invalidation"),
            InvalidationReason::Cleared => write!(f, "cache cleared"),
        }
    }
}

/// Event for cache invalidation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    /// Reason for invalidation
    pub reason: InvalidationReason,

    /// When the invalidation occurred
    pub timestamp: DateTime<Utc>,

    /// Keys that were invalidated, when known individually
    pub keys: Vec<CacheKey>,

    /// Entries removed across all layers
    pub removed: usize,

    /// Additional context
    pub context: Option<String>,
}

impl InvalidationEvent {
    /// Create a new invalidation event
    pub fn new(reason: InvalidationReason, removed: usize) -> Self {
        Self {
            reason,
            timestamp: Utc::now(),
            keys: Vec::new(),
            removed,
            context: None,
        }
    }

    /// Attach the invalidated keys
    pub fn with_keys(mut self, keys: Vec<CacheKey>) -> Self {
        self.keys = keys;
        self
    }

    /// Add context to the event
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Everything a subscriber can observe
#[derive(Debug, Clone)]
pub enum CacheEvent {
    Invalidated(InvalidationEvent),
    Warmed(WarmingReport),
    /// Carries the configuration now in effect
    ConfigUpdated(CacheConfig),
}

/// Fan-out of cache events to any number of subscribers
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CacheEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Send an event, returning how many subscribers received it
    pub fn publish(&self, event: CacheEvent) -> usize {
        match self.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!("No subscribers for cache event");
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
