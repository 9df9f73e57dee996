//! Cache entry management with TTL support

use crate::cache::types::{CacheKey, CacheValue, Category};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A cache entry with TTL and category-specific metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// The cached value
    pub value: CacheValue,

    /// What kind of content this is
    pub category: Category,

    /// When the entry was written
    pub created_at: DateTime<Utc>,

    /// When the entry stops being visible
    pub expires_at: DateTime<Utc>,

    /// Serialized length of `value`
    pub size_bytes: usize,

    /// Optional category-specific metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EntryMetadata>,
}

impl CacheEntry {
    /// Create a new entry expiring `ttl` from now
    pub fn new(
        key: CacheKey,
        value: CacheValue,
        category: Category,
        ttl: Duration,
        metadata: Option<EntryMetadata>,
    ) -> Self {
        let now = Utc::now();
        let size_bytes = serialized_size(&value);

        Self {
            key,
            value,
            category,
            created_at: now,
            expires_at: expiry_from(now, ttl),
            size_bytes,
            metadata,
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Check expiry against a fixed instant (for sweeps)
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self) -> Option<Duration> {
        let now = Utc::now();
        if now > self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }

    /// Copy of this entry with a fresh expiry window, used when promoting
    pub fn refreshed(&self, ttl: Duration) -> Self {
        let mut entry = self.clone();
        entry.expires_at = expiry_from(Utc::now(), ttl);
        entry
    }

    /// Resource hash carried by validation metadata
    pub fn resource_hash(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(EntryMetadata::resource_hash)
    }

    /// Settings hash carried by validation metadata
    pub fn settings_hash(&self) -> Option<&str> {
        self.metadata.as_ref().and_then(EntryMetadata::settings_hash)
    }
}

/// Metadata attached to an entry, shaped by the entry's category
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EntryMetadata {
    /// Validation result of one resource under one settings snapshot
    Validation {
        resource_hash: Option<String>,
        settings_hash: Option<String>,
        schema_version: Option<String>,
        subject_type: Option<String>,
    },

    /// Resolved profile definition
    Profile {
        canonical_url: String,
        schema_version: Option<String>,
    },

    /// Terminology lookup
    Terminology {
        canonical_url: String,
        schema_version: Option<String>,
    },

    /// Implementation-guide package
    IgPackage {
        package_id: String,
        version: Option<String>,
    },
}

impl EntryMetadata {
    /// Metadata for a validation result
    pub fn validation(
        resource_hash: impl Into<String>,
        settings_hash: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        EntryMetadata::Validation {
            resource_hash: Some(resource_hash.into()),
            settings_hash: Some(settings_hash.into()),
            schema_version: Some(schema_version.into()),
            subject_type: None,
        }
    }

    /// Category this metadata belongs to
    pub fn category(&self) -> Category {
        match self {
            EntryMetadata::Validation { .. } => Category::Validation,
            EntryMetadata::Profile { .. } => Category::Profile,
            EntryMetadata::Terminology { .. } => Category::Terminology,
            EntryMetadata::IgPackage { .. } => Category::IgPackage,
        }
    }

    /// Reject metadata attached to the wrong category
    pub fn check_category(&self, category: Category) -> Result<()> {
        if self.category() == category {
            Ok(())
        } else {
            Err(CacheError::MetadataMismatch {
                category,
                metadata: self.category(),
            })
        }
    }

    pub fn resource_hash(&self) -> Option<&str> {
        match self {
            EntryMetadata::Validation { resource_hash, .. } => resource_hash.as_deref(),
            _ => None,
        }
    }

    pub fn settings_hash(&self) -> Option<&str> {
        match self {
            EntryMetadata::Validation { settings_hash, .. } => settings_hash.as_deref(),
            _ => None,
        }
    }

    pub fn schema_version(&self) -> Option<&str> {
        match self {
            EntryMetadata::Validation { schema_version, .. }
            | EntryMetadata::Profile { schema_version, .. }
            | EntryMetadata::Terminology { schema_version, .. } => schema_version.as_deref(),
            EntryMetadata::IgPackage { version, .. } => version.as_deref(),
        }
    }

    pub fn canonical_url(&self) -> Option<&str> {
        match self {
            EntryMetadata::Profile { canonical_url, .. }
            | EntryMetadata::Terminology { canonical_url, .. } => Some(canonical_url),
            _ => None,
        }
    }

    pub fn subject_type(&self) -> Option<&str> {
        match self {
            EntryMetadata::Validation { subject_type, .. } => subject_type.as_deref(),
            _ => None,
        }
    }
}

/// Approximate size of a value: its serialized JSON length
pub fn serialized_size(value: &CacheValue) -> usize {
    serde_json::to_vec(value).map(|bytes| bytes.len()).unwrap_or(0)
}

fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
