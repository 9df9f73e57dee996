//! Cache warming inputs and results
//!
//! Values are fetched through a `Resolver` supplied by the embedding
//! application; the `CacheManager` batches the calls and stores the results.

use crate::cache::{
    entry::EntryMetadata,
    types::{CacheValue, Category},
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Schema version used when warming options do not name one
pub const DEFAULT_SCHEMA_VERSION: &str = "R4";

/// Source of definitions to pre-load into the cache
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a profile by canonical URL
    async fn resolve_profile(
        &self,
        canonical_url: &str,
        schema_version: &str,
    ) -> anyhow::Result<CacheValue>;

    /// Resolve a code system or value set by canonical URL
    async fn resolve_terminology(
        &self,
        system_url: &str,
        schema_version: &str,
    ) -> anyhow::Result<CacheValue>;
}

/// What `CacheManager::warm_cache` should load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WarmOptions {
    /// Profile canonical URLs
    pub profiles: Vec<String>,

    /// Terminology system URLs
    pub terminology_systems: Vec<String>,

    /// Restrict warming to these categories; `None` warms everything listed
    pub categories: Option<Vec<Category>>,

    pub schema_version: String,
}

impl Default for WarmOptions {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            terminology_systems: Vec::new(),
            categories: None,
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
        }
    }
}

impl WarmOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profiles<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.profiles = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_terminology_systems<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.terminology_systems = urls.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_categories(mut self, categories: Vec<Category>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_schema_version(mut self, schema_version: impl Into<String>) -> Self {
        self.schema_version = schema_version.into();
        self
    }

    fn wants(&self, category: Category) -> bool {
        self.categories
            .as_ref()
            .map_or(true, |categories| categories.contains(&category))
    }

    /// Items to warm, profiles first, in the order given
    pub(crate) fn items(&self) -> Vec<WarmItem> {
        let profiles = self
            .profiles
            .iter()
            .filter(|_| self.wants(Category::Profile))
            .map(|url| WarmItem::new(url, Category::Profile));
        let terminology = self
            .terminology_systems
            .iter()
            .filter(|_| self.wants(Category::Terminology))
            .map(|url| WarmItem::new(url, Category::Terminology));

        profiles.chain(terminology).collect()
    }
}

/// Outcome of a warming run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingReport {
    pub profiles_warmed: usize,
    pub terminology_warmed: usize,
    pub total_warmed: usize,

    /// One `"<url>: <reason>"` line per failed item
    pub errors: Vec<String>,

    pub duration_ms: u64,
}

impl WarmingReport {
    pub(crate) fn record_success(&mut self, category: Category) {
        match category {
            Category::Profile => self.profiles_warmed += 1,
            Category::Terminology => self.terminology_warmed += 1,
            _ => {}
        }
        self.total_warmed += 1;
    }

    pub(crate) fn record_failure(&mut self, item: &WarmItem, reason: impl std::fmt::Display) {
        self.errors.push(format!("{}: {}", item.url, reason));
    }

    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A single definition to resolve and store
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WarmItem {
    pub url: String,
    pub category: Category,
}

impl WarmItem {
    fn new(url: &str, category: Category) -> Self {
        Self {
            url: url.to_string(),
            category,
        }
    }

    pub async fn resolve(
        &self,
        resolver: &dyn Resolver,
        schema_version: &str,
    ) -> anyhow::Result<CacheValue> {
        match self.category {
            Category::Terminology => resolver.resolve_terminology(&self.url, schema_version).await,
            _ => resolver.resolve_profile(&self.url, schema_version).await,
        }
    }

    pub fn metadata(&self, schema_version: &str) -> EntryMetadata {
        let canonical_url = self.url.clone();
        let schema_version = Some(schema_version.to_string());
        match self.category {
            Category::Terminology => EntryMetadata::Terminology {
                canonical_url,
                schema_version,
            },
            _ => EntryMetadata::Profile {
                canonical_url,
                schema_version,
            },
        }
    }
}
