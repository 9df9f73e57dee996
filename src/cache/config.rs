//! Configuration for the cache system

use crate::cache::types::{CacheLayer, Category};
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Prefix for every environment variable read by `from_env`
pub const ENV_PREFIX: &str = "VALIDATION_CACHE_";

/// Which layers participate in reads and writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerToggles {
    #[serde(rename = "L1")]
    pub l1: bool,
    #[serde(rename = "L2")]
    pub l2: bool,
    #[serde(rename = "L3")]
    pub l3: bool,
}

impl LayerToggles {
    pub fn is_enabled(&self, layer: CacheLayer) -> bool {
        match layer {
            CacheLayer::L1 => self.l1,
            CacheLayer::L2 => self.l2,
            CacheLayer::L3 => self.l3,
        }
    }

    pub fn set(&mut self, layer: CacheLayer, enabled: bool) {
        match layer {
            CacheLayer::L1 => self.l1 = enabled,
            CacheLayer::L2 => self.l2 = enabled,
            CacheLayer::L3 => self.l3 = enabled,
        }
    }
}

impl Default for LayerToggles {
    fn default() -> Self {
        Self {
            l1: true,
            l2: true,
            l3: true,
        }
    }
}

/// Size budgets for the bounded layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheLimits {
    /// Hard budget for L1, summed serialized value length
    pub l1_max_bytes: usize,

    /// Soft budget for L3 files on disk
    pub l3_max_bytes: u64,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            // 64 MB
            l1_max_bytes: 64 * 1024 * 1024,
            // 1 GB
            l3_max_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Settings for `CacheManager::warm_cache`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmingConfig {
    /// Items resolved concurrently per batch
    pub batch_size: usize,

    /// Upper bound for a single resolver call
    pub item_timeout: Duration,
}

impl Default for WarmingConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            item_timeout: Duration::from_secs(10),
        }
    }
}

/// Live configuration of the cache manager
///
/// Mutable at runtime through `CacheManager::update_config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Layer enablement
    pub layers: LayerToggles,

    /// Size budgets
    pub limits: CacheLimits,

    /// Time-to-live applied to every write of a category
    pub ttl_by_category: HashMap<Category, Duration>,

    /// TTL jitter factor (0.0 - 1.0)
    /// Spreads expiry of entries written together, e.g. by warming
    pub ttl_jitter: f64,

    /// Cache warming behaviour
    pub warming: WarmingConfig,

    /// Interval for the background expiry sweep
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            layers: LayerToggles::default(),
            limits: CacheLimits::default(),
            ttl_by_category: Category::ALL
                .into_iter()
                .map(|category| (category, default_ttl(category)))
                .collect(),
            ttl_jitter: 0.0,
            warming: WarmingConfig::default(),
            // Cleanup every 5 minutes
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

/// Built-in TTL for a category
pub fn default_ttl(category: Category) -> Duration {
    match category {
        // Results go stale as soon as resources or settings change upstream
        Category::Validation => Duration::from_secs(3600),
        Category::Terminology => Duration::from_secs(12 * 3600),
        Category::Profile => Duration::from_secs(24 * 3600),
        Category::IgPackage => Duration::from_secs(7 * 24 * 3600),
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Configuration with only the in-memory layer enabled
    pub fn memory_only() -> Self {
        Self {
            layers: LayerToggles {
                l1: true,
                l2: false,
                l3: false,
            },
            ..Default::default()
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.limits.l1_max_bytes == 0 {
            return Err(CacheError::ConfigValidation(
                "l1MaxBytes must be greater than 0".to_string(),
            ));
        }

        if self.limits.l3_max_bytes == 0 {
            return Err(CacheError::ConfigValidation(
                "l3MaxBytes must be greater than 0".to_string(),
            ));
        }

        for (category, ttl) in &self.ttl_by_category {
            if ttl.is_zero() {
                return Err(CacheError::ConfigValidation(format!(
                    "TTL for {} must be greater than 0",
                    category
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::ConfigValidation(
                "ttlJitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.warming.batch_size == 0 {
            return Err(CacheError::ConfigValidation(
                "warming batchSize must be greater than 0".to_string(),
            ));
        }

        if self.warming.item_timeout.is_zero() {
            return Err(CacheError::ConfigValidation(
                "warming itemTimeout must be greater than 0".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() {
            return Err(CacheError::ConfigValidation(
                "cleanupInterval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Configured TTL for a category, without jitter
    pub fn base_ttl(&self, category: Category) -> Duration {
        self.ttl_by_category
            .get(&category)
            .copied()
            .unwrap_or_else(|| default_ttl(category))
    }

    /// TTL to apply to a write of `category`, with jitter applied
    pub fn ttl_for(&self, category: Category) -> Duration {
        let base = self.base_ttl(category);
        if self.ttl_jitter == 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.001);

        Duration::from_secs_f64(final_secs)
    }

    /// Apply a partial update, returning the merged configuration
    ///
    /// Nothing is applied unless the whole update is valid.
    pub fn merged(&self, update: &CacheConfigUpdate) -> Result<CacheConfig> {
        let mut config = self.clone();

        if let Some(layers) = &update.layers {
            if let Some(l1) = layers.l1 {
                config.layers.l1 = l1;
            }
            if let Some(l2) = layers.l2 {
                config.layers.l2 = l2;
            }
            if let Some(l3) = layers.l3 {
                config.layers.l3 = l3;
            }
        }

        if let Some(limits) = &update.limits {
            if let Some(bytes) = limits.l1_max_bytes {
                config.limits.l1_max_bytes = non_negative("limits.l1MaxBytes", bytes)? as usize;
            }
            if let Some(bytes) = limits.l3_max_bytes {
                config.limits.l3_max_bytes = non_negative("limits.l3MaxBytes", bytes)?;
            }
        }

        for (category, millis) in &update.ttl_by_category_ms {
            let millis = non_negative(&format!("ttlByCategoryMs.{}", category), *millis)?;
            config
                .ttl_by_category
                .insert(*category, Duration::from_millis(millis));
        }

        if let Some(jitter) = update.ttl_jitter {
            config.ttl_jitter = jitter;
        }

        if let Some(size) = update.warming_batch_size {
            config.warming.batch_size = non_negative("warmingBatchSize", size)? as usize;
        }

        if let Some(millis) = update.warming_item_timeout_ms {
            config.warming.item_timeout =
                Duration::from_millis(non_negative("warmingItemTimeoutMs", millis)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `VALIDATION_CACHE_*` environment variables
    ///
    /// A `.env` file in the working directory is read first if present.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = CacheConfig::default();

        for layer in CacheLayer::PROBE_ORDER {
            if let Some(enabled) = parse_var::<bool, _>(&lookup, &format!("{}_ENABLED", layer))? {
                config.layers.set(layer, enabled);
            }
        }

        if let Some(bytes) = parse_var(&lookup, "L1_MAX_BYTES")? {
            config.limits.l1_max_bytes = bytes;
        }
        if let Some(bytes) = parse_var(&lookup, "L3_MAX_BYTES")? {
            config.limits.l3_max_bytes = bytes;
        }

        for category in Category::ALL {
            let name = format!("TTL_{}_SECS", env_suffix(category));
            if let Some(secs) = parse_var::<u64, _>(&lookup, &name)? {
                config
                    .ttl_by_category
                    .insert(category, Duration::from_secs(secs));
            }
        }

        if let Some(jitter) = parse_var(&lookup, "TTL_JITTER")? {
            config.ttl_jitter = jitter;
        }
        if let Some(size) = parse_var(&lookup, "WARM_BATCH_SIZE")? {
            config.warming.batch_size = size;
        }
        if let Some(millis) = parse_var::<u64, _>(&lookup, "WARM_TIMEOUT_MS")? {
            config.warming.item_timeout = Duration::from_millis(millis);
        }
        if let Some(secs) = parse_var::<u64, _>(&lookup, "CLEANUP_INTERVAL_SECS")? {
            config.cleanup_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }
}

/// Builder for cache configuration with validation
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    layers: Option<LayerToggles>,
    l1_max_bytes: Option<usize>,
    l3_max_bytes: Option<u64>,
    ttls: HashMap<Category, Duration>,
    ttl_jitter: Option<f64>,
    warming_batch_size: Option<usize>,
    warming_item_timeout: Option<Duration>,
    cleanup_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Enable or disable a single layer
    pub fn layer(mut self, layer: CacheLayer, enabled: bool) -> Self {
        let mut layers = self.layers.unwrap_or_default();
        layers.set(layer, enabled);
        self.layers = Some(layers);
        self
    }

    /// Set the L1 byte budget
    pub fn l1_max_bytes(mut self, bytes: usize) -> Self {
        self.l1_max_bytes = Some(bytes);
        self
    }

    /// Set the L3 soft byte budget
    pub fn l3_max_bytes(mut self, bytes: u64) -> Self {
        self.l3_max_bytes = Some(bytes);
        self
    }

    /// Set the TTL for one category
    pub fn ttl(mut self, category: Category, ttl: Duration) -> Self {
        self.ttls.insert(category, ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Set how many warming items run concurrently
    pub fn warming_batch_size(mut self, size: usize) -> Self {
        self.warming_batch_size = Some(size);
        self
    }

    /// Set the per-item warming timeout
    pub fn warming_item_timeout(mut self, timeout: Duration) -> Self {
        self.warming_item_timeout = Some(timeout);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();
        let mut ttl_by_category = defaults.ttl_by_category;
        ttl_by_category.extend(self.ttls);

        CacheConfig {
            layers: self.layers.unwrap_or(defaults.layers),
            limits: CacheLimits {
                l1_max_bytes: self.l1_max_bytes.unwrap_or(defaults.limits.l1_max_bytes),
                l3_max_bytes: self.l3_max_bytes.unwrap_or(defaults.limits.l3_max_bytes),
            },
            ttl_by_category,
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            warming: WarmingConfig {
                batch_size: self
                    .warming_batch_size
                    .unwrap_or(defaults.warming.batch_size),
                item_timeout: self
                    .warming_item_timeout
                    .unwrap_or(defaults.warming.item_timeout),
            },
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
        }
    }

    /// Build and validate
    pub fn try_build(self) -> Result<CacheConfig> {
        let config = self.build();
        config.validate()?;
        Ok(config)
    }
}

/// Partial configuration update as received from outer layers
///
/// Numeric fields are signed so that negative input can be rejected
/// instead of failing to deserialize.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfigUpdate {
    pub layers: Option<LayerTogglesUpdate>,
    pub limits: Option<CacheLimitsUpdate>,
    pub ttl_by_category_ms: HashMap<Category, i64>,
    pub ttl_jitter: Option<f64>,
    pub warming_batch_size: Option<i64>,
    pub warming_item_timeout_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerTogglesUpdate {
    #[serde(rename = "L1")]
    pub l1: Option<bool>,
    #[serde(rename = "L2")]
    pub l2: Option<bool>,
    #[serde(rename = "L3")]
    pub l3: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheLimitsUpdate {
    pub l1_max_bytes: Option<i64>,
    pub l3_max_bytes: Option<i64>,
}

impl CacheConfigUpdate {
    /// Enable or disable one layer
    pub fn with_layer(mut self, layer: CacheLayer, enabled: bool) -> Self {
        let layers = self.layers.get_or_insert_with(LayerTogglesUpdate::default);
        match layer {
            CacheLayer::L1 => layers.l1 = Some(enabled),
            CacheLayer::L2 => layers.l2 = Some(enabled),
            CacheLayer::L3 => layers.l3 = Some(enabled),
        }
        self
    }

    /// Change a category TTL, in milliseconds
    pub fn with_ttl_ms(mut self, category: Category, millis: i64) -> Self {
        self.ttl_by_category_ms.insert(category, millis);
        self
    }

    /// Change the L1 budget
    pub fn with_l1_max_bytes(mut self, bytes: i64) -> Self {
        self.limits
            .get_or_insert_with(CacheLimitsUpdate::default)
            .l1_max_bytes = Some(bytes);
        self
    }

    /// Change the L3 budget
    pub fn with_l3_max_bytes(mut self, bytes: i64) -> Self {
        self.limits
            .get_or_insert_with(CacheLimitsUpdate::default)
            .l3_max_bytes = Some(bytes);
        self
    }
}

/// Locations of the durable backing stores
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    /// SQLite database file backing L2
    pub l2_database_path: PathBuf,

    /// Mount path backing L3
    pub l3_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            l2_database_path: PathBuf::from(".cache/validation-cache.sqlite3"),
            l3_root: PathBuf::from(".cache/objects"),
        }
    }
}

impl StorageConfig {
    /// Load storage locations from the environment
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load storage locations through an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Self {
            l2_database_path: lookup(&format!("{}L2_PATH", ENV_PREFIX))
                .map(PathBuf::from)
                .unwrap_or(defaults.l2_database_path),
            l3_root: lookup(&format!("{}L3_ROOT", ENV_PREFIX))
                .map(PathBuf::from)
                .unwrap_or(defaults.l3_root),
        }
    }
}

fn non_negative(field: &str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| {
        CacheError::ConfigValidation(format!("{} must not be negative (got {})", field, value))
    })
}

fn env_suffix(category: Category) -> &'static str {
    match category {
        Category::Validation => "VALIDATION",
        Category::Profile => "PROFILE",
        Category::Terminology => "TERMINOLOGY",
        Category::IgPackage => "IG_PACKAGE",
    }
}

fn parse_var<T, F>(lookup: &F, suffix: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let name = format!("{}{}", ENV_PREFIX, suffix);
    match lookup(&name) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            CacheError::ConfigValidation(format!("{}={:?} is invalid: {}", name, raw, e))
        }),
    }
}
