//! Multi-layer cache orchestration
//!
//! Reads probe L1, L2, L3 in that order and promote hits into every faster
//! enabled layer. Writes go to every enabled layer. A value too large for
//! memory still lands in L2/L3; L2/L3 failures are logged and absorbed, so
//! the cache keeps serving from memory when both backing stores are gone.

use crate::cache::{
    config::{CacheConfig, CacheConfigUpdate, LayerToggles, StorageConfig},
    entry::{CacheEntry, EntryMetadata},
    events::{CacheEvent, EventBus, InvalidationEvent, InvalidationReason, DEFAULT_EVENT_CAPACITY},
    key::CacheKeyGenerator,
    memory::MemoryCache,
    object_store::ObjectStore,
    persistent::PersistentCache,
    types::{CacheKey, CacheLayer, CacheStats, CacheValue, Category, LayerStats, LayerStatsSet},
    warming::{Resolver, WarmItem, WarmOptions, WarmingReport},
};
use crate::error::Result;
use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Hit/miss counters for the layers that do not count for themselves
#[derive(Debug, Default)]
struct LayerCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LayerCounters {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}

/// Entry point for every cache operation
///
/// Construct one per process and share it behind an `Arc`.
pub struct CacheManager {
    config: RwLock<CacheConfig>,
    keys: CacheKeyGenerator,
    l1: MemoryCache,
    l2: Option<PersistentCache>,
    l3: Option<ObjectStore>,
    l2_counters: LayerCounters,
    l3_counters: LayerCounters,
    resolver: Option<Arc<dyn Resolver>>,
    events: EventBus,
}

impl CacheManager {
    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    /// Manager with only the in-memory layer attached
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Manager backed by the SQLite file and object root in `storage`
    pub fn with_storage(config: CacheConfig, storage: &StorageConfig) -> Result<Self> {
        Self::builder().config(config).storage(storage).build()
    }

    /// Look up a value, probing L1, L2 and L3 in order
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        self.get_entry(key).await.map(|entry| entry.value)
    }

    /// Look up the full entry, metadata included
    pub async fn get_entry(&self, key: &str) -> Option<CacheEntry> {
        let layers = self.layers().await;

        if layers.l1 {
            if let Some(entry) = self.l1.get(key).await {
                debug!("L1 hit: {}", key);
                return Some(entry);
            }
        }

        if let Some(l2) = self.l2.as_ref().filter(|_| layers.l2) {
            match l2.get(key).await {
                Ok(Some(entry)) => {
                    debug!("L2 hit: {}", key);
                    self.l2_counters.hit();
                    self.promote(&entry, &layers, CacheLayer::L2).await;
                    return Some(entry);
                }
                Ok(None) => self.l2_counters.miss(),
                Err(e) => {
                    warn!("L2 read failed for {}: {}", key, e);
                    self.l2_counters.miss();
                }
            }
        }

        if let Some(l3) = self.l3.as_ref().filter(|_| layers.l3) {
            match l3.get(key).await {
                Ok(Some(entry)) => {
                    debug!("L3 hit: {}", key);
                    self.l3_counters.hit();
                    self.promote(&entry, &layers, CacheLayer::L3).await;
                    return Some(entry);
                }
                Ok(None) => self.l3_counters.miss(),
                Err(e) => {
                    warn!("L3 read failed for {}: {}", key, e);
                    self.l3_counters.miss();
                }
            }
        }

        debug!("Cache miss: {}", key);
        None
    }

    /// Look up a value and deserialize it
    ///
    /// Returns `Serialization` when the stored value does not fit `T`.
    pub async fn get_as<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match self.get(key).await {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Store a value in every enabled layer with the category's TTL
    pub async fn set(
        &self,
        key: &str,
        value: CacheValue,
        category: Category,
        metadata: Option<EntryMetadata>,
    ) -> Result<()> {
        if let Some(metadata) = &metadata {
            metadata.check_category(category)?;
        }

        let (layers, ttl) = {
            let config = self.config.read().await;
            (config.layers, config.ttl_for(category))
        };
        let entry = CacheEntry::new(key.to_string(), value, category, ttl, metadata);

        let mut l1_rejected = None;
        if layers.l1 {
            if let Err(e) = self.l1.set(entry.clone()).await {
                // An older, smaller value must not outlive the rejected write
                self.l1.delete(key).await;
                l1_rejected = Some(e);
            }
        }

        let l2_write = async {
            match self.l2.as_ref().filter(|_| layers.l2) {
                Some(l2) => match l2.set(&entry).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("L2 write failed for {}: {}", key, e);
                        false
                    }
                },
                None => false,
            }
        };
        let l3_write = async {
            match self.l3.as_ref().filter(|_| layers.l3) {
                Some(l3) => match l3.set(&entry).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("L3 write failed for {}: {}", key, e);
                        false
                    }
                },
                None => false,
            }
        };
        let (in_l2, in_l3) = tokio::join!(l2_write, l3_write);

        if let Some(e) = l1_rejected {
            if !(in_l2 || in_l3) {
                error!("L1 write failed for {}: {}", key, e);
                return Err(e);
            }
            info!("{} skipped L1 ({}), stored in the durable layers", key, e);
        }

        debug!("Cached {} ({}, {} bytes, ttl {:?})", key, category, entry.size_bytes, ttl);
        Ok(())
    }

    /// Serialize and store a value
    pub async fn set_serialized<T>(
        &self,
        key: &str,
        value: &T,
        category: Category,
        metadata: Option<EntryMetadata>,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let value = serde_json::to_value(value)?;
        self.set(key, value, category, metadata).await
    }

    /// Remove a key from every enabled layer, returning whether any held it
    pub async fn delete(&self, key: &str) -> bool {
        let layers = self.layers().await;
        let mut removed = false;

        if layers.l1 {
            removed |= self.l1.delete(key).await;
        }
        if let Some(l2) = self.l2.as_ref().filter(|_| layers.l2) {
            match l2.delete(key).await {
                Ok(existed) => removed |= existed,
                Err(e) => warn!("L2 delete failed for {}: {}", key, e),
            }
        }
        if let Some(l3) = self.l3.as_ref().filter(|_| layers.l3) {
            match l3.delete(key).await {
                Ok(existed) => removed |= existed,
                Err(e) => warn!("L3 delete failed for {}: {}", key, e),
            }
        }

        if removed {
            debug!("Deleted {}", key);
            self.publish_invalidation(
                InvalidationEvent::new(InvalidationReason::Manual, 1).with_keys(vec![key.to_string()]),
            );
        }
        removed
    }

    /// Empty every enabled layer; hit/miss counters are kept
    pub async fn clear(&self) -> usize {
        let removed = self.clear_layers().await;
        info!("Cleared cache ({} entries)", removed);
        self.publish_invalidation(InvalidationEvent::new(InvalidationReason::Cleared, removed));
        removed
    }

    /// Same as `clear`, announced to subscribers as a bulk invalidation
    pub async fn invalidate_all(&self) -> usize {
        let removed = self.clear_layers().await;
        info!("Invalidated all cache entries ({})", removed);
        self.publish_invalidation(InvalidationEvent::new(
            InvalidationReason::BulkInvalidation,
            removed,
        ));
        removed
    }

    /// Remove every entry of `category` from every enabled layer
    pub async fn invalidate_category(&self, category: Category) -> usize {
        let layers = self.layers().await;
        let mut removed = 0;

        if layers.l1 {
            removed += self.l1.remove_category(category).await;
        }
        if let Some(l2) = self.l2.as_ref().filter(|_| layers.l2) {
            match l2.remove_category(category).await {
                Ok(count) => removed += count,
                Err(e) => warn!("L2 category invalidation failed for {}: {}", category, e),
            }
        }
        if let Some(l3) = self.l3.as_ref().filter(|_| layers.l3) {
            match l3.remove_category(category).await {
                Ok(count) => removed += count,
                Err(e) => warn!("L3 category invalidation failed for {}: {}", category, e),
            }
        }

        info!("Invalidated {} entries of category {}", removed, category);
        self.publish_invalidation(InvalidationEvent::new(
            InvalidationReason::CategoryInvalidated { category },
            removed,
        ));
        removed
    }

    /// Drop every result computed under `settings_hash`
    pub async fn invalidate_by_settings_hash(&self, settings_hash: &str) -> usize {
        let layers = self.layers().await;
        let mut removed = 0;

        if layers.l1 {
            removed += self.l1.remove_by_settings_hash(settings_hash).await;
        }
        if let Some(l2) = self.l2.as_ref().filter(|_| layers.l2) {
            match l2.invalidate_by_settings_hash(settings_hash).await {
                Ok(count) => removed += count,
                Err(e) => warn!("L2 settings invalidation failed: {}", e),
            }
        }
        if let Some(l3) = self.l3.as_ref().filter(|_| layers.l3) {
            match l3.remove_by_settings_hash(settings_hash).await {
                Ok(count) => removed += count,
                Err(e) => warn!("L3 settings invalidation failed: {}", e),
            }
        }

        info!("Invalidated {} entries for settings {}", removed, settings_hash);
        self.publish_invalidation(InvalidationEvent::new(
            InvalidationReason::SettingsChanged {
                settings_hash: settings_hash.to_string(),
            },
            removed,
        ));
        removed
    }

    /// Newest validation result for a resource, whatever settings produced it
    pub async fn get_by_resource_hash(&self, resource_hash: &str) -> Option<CacheEntry> {
        let layers = self.layers().await;

        if layers.l1 {
            let newest = self
                .l1
                .entries_by_category(Category::Validation)
                .await
                .into_iter()
                .filter(|entry| entry.resource_hash() == Some(resource_hash))
                .max_by_key(|entry| entry.created_at);
            if newest.is_some() {
                return newest;
            }
        }

        let l2 = self.l2.as_ref().filter(|_| layers.l2)?;
        match l2.get_by_resource_hash(resource_hash).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!("L2 resource hash lookup failed: {}", e);
                None
            }
        }
    }

    /// Whether any enabled layer holds a live entry; not counted in stats
    pub async fn has(&self, key: &str) -> bool {
        let layers = self.layers().await;

        if layers.l1 && self.l1.contains_key(key).await {
            return true;
        }
        if let Some(l2) = self.l2.as_ref().filter(|_| layers.l2) {
            match l2.contains_key(key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("L2 lookup failed for {}: {}", key, e),
            }
        }
        if let Some(l3) = self.l3.as_ref().filter(|_| layers.l3) {
            match l3.contains_key(key).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => warn!("L3 lookup failed for {}: {}", key, e),
            }
        }
        false
    }

    /// Live keys of one layer; empty when the layer is disabled or unreachable
    pub async fn get_keys(&self, layer: CacheLayer) -> Vec<CacheKey> {
        let layers = self.layers().await;
        if !self.is_active(layer, &layers) {
            return Vec::new();
        }

        let result = match layer {
            CacheLayer::L1 => Ok(self.l1.keys().await),
            CacheLayer::L2 => match &self.l2 {
                Some(l2) => l2.keys().await,
                None => Ok(Vec::new()),
            },
            CacheLayer::L3 => match &self.l3 {
                Some(l3) => l3.keys().await,
                None => Ok(Vec::new()),
            },
        };

        result.unwrap_or_else(|e| {
            warn!("Listing {} keys failed: {}", layer, e);
            Vec::new()
        })
    }

    /// Remove expired entries from every enabled layer
    pub async fn cleanup_expired(&self) -> usize {
        let layers = self.layers().await;
        let mut removed = 0;

        if layers.l1 {
            removed += self.l1.cleanup_expired().await.len();
        }
        if let Some(l2) = self.l2.as_ref().filter(|_| layers.l2) {
            match l2.cleanup_expired().await {
                Ok(count) => removed += count,
                Err(e) => warn!("L2 cleanup failed: {}", e),
            }
        }
        if let Some(l3) = self.l3.as_ref().filter(|_| layers.l3) {
            match l3.cleanup_expired().await {
                Ok(count) => removed += count,
                Err(e) => warn!("L3 cleanup failed: {}", e),
            }
        }

        if removed > 0 {
            debug!("Expiry sweep removed {} entries", removed);
            self.publish_invalidation(InvalidationEvent::new(InvalidationReason::Expired, removed));
        }
        removed
    }

    /// Pre-load profiles and terminology through the configured resolver
    ///
    /// Never fails: per-item problems end up in `WarmingReport::errors`.
    pub async fn warm_cache(&self, options: WarmOptions) -> WarmingReport {
        let started = Instant::now();
        let (batch_size, item_timeout) = {
            let config = self.config.read().await;
            (config.warming.batch_size.max(1), config.warming.item_timeout)
        };
        let items = options.items();
        let mut report = WarmingReport::default();

        info!(
            "Warming {} items (batch size {}, timeout {:?})",
            items.len(),
            batch_size,
            item_timeout
        );

        match self.resolver.as_deref() {
            Some(resolver) => {
                for batch in items.chunks(batch_size) {
                    let outcomes = join_all(batch.iter().map(|item| {
                        self.warm_item(resolver, item, &options.schema_version, item_timeout)
                    }))
                    .await;

                    for (item, outcome) in batch.iter().zip(outcomes) {
                        match outcome {
                            Ok(()) => report.record_success(item.category),
                            Err(reason) => {
                                warn!("Warming {} failed: {}", item.url, reason);
                                report.record_failure(item, reason);
                            }
                        }
                    }
                }
            }
            None => {
                warn!("Cache warming requested without a resolver");
                for item in &items {
                    report.record_failure(item, "no resolver configured");
                }
            }
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            "Cache warming finished: {} warmed, {} errors in {}ms",
            report.total_warmed,
            report.errors.len(),
            report.duration_ms
        );
        self.events.publish(CacheEvent::Warmed(report.clone()));
        report
    }

    async fn warm_item(
        &self,
        resolver: &dyn Resolver,
        item: &WarmItem,
        schema_version: &str,
        item_timeout: Duration,
    ) -> std::result::Result<(), String> {
        let value = match tokio::time::timeout(item_timeout, item.resolve(resolver, schema_version))
            .await
        {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("timed out after {}ms", item_timeout.as_millis())),
        };

        let key = self
            .keys
            .canonical_url_key(&item.url, schema_version, item.category)
            .map_err(|e| e.to_string())?;

        self.set(&key, value, item.category, Some(item.metadata(schema_version)))
            .await
            .map_err(|e| e.to_string())
    }

    /// Per-layer and overall statistics
    pub async fn get_stats(&self) -> CacheStats {
        let layers = self.layers().await;
        let memory = self.l1.stats().await;

        let l1 = LayerStats {
            enabled: layers.l1,
            hits: memory.hits,
            misses: memory.misses,
            entries: memory.entries,
            size_bytes: memory.size_bytes as u64,
        };

        let mut l2 = LayerStats {
            enabled: self.is_active(CacheLayer::L2, &layers),
            ..Default::default()
        };
        (l2.hits, l2.misses) = self.l2_counters.snapshot();
        if let Some(store) = self.l2.as_ref().filter(|_| l2.enabled) {
            match store.usage().await {
                Ok(usage) => {
                    l2.entries = usage.entries;
                    l2.size_bytes = usage.size_bytes;
                }
                Err(e) => warn!("L2 usage unavailable: {}", e),
            }
        }

        let mut l3 = LayerStats {
            enabled: self.is_active(CacheLayer::L3, &layers),
            ..Default::default()
        };
        (l3.hits, l3.misses) = self.l3_counters.snapshot();
        if let Some(store) = self.l3.as_ref().filter(|_| l3.enabled) {
            match store.usage().await {
                Ok(usage) => {
                    l3.entries = usage.entries;
                    l3.size_bytes = usage.size_bytes;
                }
                Err(e) => warn!("L3 usage unavailable: {}", e),
            }
        }

        CacheStats::from_layers(LayerStatsSet { l1, l2, l3 })
    }

    /// Zero every hit/miss counter
    pub async fn reset_stats(&self) {
        self.l1.reset_stats().await;
        self.l2_counters.reset();
        self.l3_counters.reset();
    }

    /// Snapshot of the live configuration
    pub async fn get_config(&self) -> CacheConfig {
        self.config.read().await.clone()
    }

    /// Merge a partial update into the live configuration
    ///
    /// Invalid values leave the current configuration untouched.
    pub async fn update_config(&self, update: &CacheConfigUpdate) -> Result<()> {
        let (previous, updated) = {
            let mut config = self.config.write().await;
            let updated = config.merged(update)?;
            let previous = std::mem::replace(&mut *config, updated.clone());
            (previous, updated)
        };

        if previous.layers.l1 && !updated.layers.l1 {
            let dropped = self.l1.clear().await;
            info!("L1 disabled, dropped {} in-memory entries", dropped);
        }
        // Writes and invalidations skipped a disabled store, so its contents may be stale
        if !previous.layers.l2 && updated.layers.l2 {
            if let Some(l2) = &self.l2 {
                match l2.clear().await {
                    Ok(dropped) => info!("L2 re-enabled, dropped {} stale entries", dropped),
                    Err(e) => warn!("Clearing re-enabled L2 failed: {}", e),
                }
            }
        }
        if !previous.layers.l3 && updated.layers.l3 {
            if let Some(l3) = &self.l3 {
                match l3.clear().await {
                    Ok(dropped) => info!("L3 re-enabled, dropped {} stale entries", dropped),
                    Err(e) => warn!("Clearing re-enabled L3 failed: {}", e),
                }
            }
        }
        if previous.limits.l1_max_bytes != updated.limits.l1_max_bytes {
            let evicted = self.l1.set_max_bytes(updated.limits.l1_max_bytes).await;
            debug!("L1 budget now {} bytes ({} evicted)", updated.limits.l1_max_bytes, evicted);
        }
        if previous.limits.l3_max_bytes != updated.limits.l3_max_bytes {
            if let Some(l3) = &self.l3 {
                if let Err(e) = l3.set_max_bytes(updated.limits.l3_max_bytes).await {
                    warn!("Applying L3 budget failed: {}", e);
                }
            }
        }

        info!("Cache configuration updated");
        self.events.publish(CacheEvent::ConfigUpdated(updated));
        Ok(())
    }

    /// Key for a payload under the given settings
    pub fn generate_key<P>(
        &self,
        payload: &P,
        settings: Option<&CacheValue>,
        schema_version: &str,
        category: Category,
    ) -> Result<CacheKey>
    where
        P: Serialize + ?Sized,
    {
        self.keys
            .generate_key(payload, settings, schema_version, category)
    }

    pub fn key_generator(&self) -> &CacheKeyGenerator {
        &self.keys
    }

    /// Receive invalidation, warming and configuration events
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Run `cleanup_expired` every `cleanup_interval` until the manager is dropped
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);

        tokio::spawn(async move {
            info!("Starting automatic cache cleanup task");

            loop {
                let interval = match manager.upgrade() {
                    Some(manager) => manager.config.read().await.cleanup_interval,
                    None => break,
                };

                tokio::time::sleep(interval).await;

                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let removed = manager.cleanup_expired().await;
                if removed > 0 {
                    debug!("Auto cleanup removed {} entries", removed);
                }
            }

            debug!("Cache manager dropped, cleanup task exiting");
        })
    }

    async fn layers(&self) -> LayerToggles {
        self.config.read().await.layers
    }

    fn is_active(&self, layer: CacheLayer, layers: &LayerToggles) -> bool {
        layers.is_enabled(layer)
            && match layer {
                CacheLayer::L1 => true,
                CacheLayer::L2 => self.l2.is_some(),
                CacheLayer::L3 => self.l3.is_some(),
            }
    }

    /// Copy an entry found in `found_in` into every faster enabled layer
    async fn promote(&self, entry: &CacheEntry, layers: &LayerToggles, found_in: CacheLayer) {
        let ttl = self.config.read().await.ttl_for(entry.category);
        let promoted = entry.refreshed(ttl);

        if found_in == CacheLayer::L3 {
            if let Some(l2) = self.l2.as_ref().filter(|_| layers.l2) {
                if let Err(e) = l2.set(&promoted).await {
                    warn!("Promotion of {} into L2 failed: {}", entry.key, e);
                }
            }
        }

        if layers.l1 {
            if let Err(e) = self.l1.set(promoted).await {
                debug!("Promotion of {} into L1 skipped: {}", entry.key, e);
            }
        }
    }

    async fn clear_layers(&self) -> usize {
        let layers = self.layers().await;
        let mut removed = 0;

        if layers.l1 {
            removed += self.l1.clear().await;
        }
        if let Some(l2) = self.l2.as_ref().filter(|_| layers.l2) {
            match l2.clear().await {
                Ok(count) => removed += count,
                Err(e) => warn!("L2 clear failed: {}", e),
            }
        }
        if let Some(l3) = self.l3.as_ref().filter(|_| layers.l3) {
            match l3.clear().await {
                Ok(count) => removed += count,
                Err(e) => warn!("L3 clear failed: {}", e),
            }
        }
        removed
    }

    fn publish_invalidation(&self, event: InvalidationEvent) {
        self.events.publish(CacheEvent::Invalidated(event));
    }
}

/// Builder for `CacheManager`
#[derive(Default)]
pub struct CacheManagerBuilder {
    config: Option<CacheConfig>,
    persistent: Option<PersistentCache>,
    object_root: Option<PathBuf>,
    resolver: Option<Arc<dyn Resolver>>,
    event_capacity: Option<usize>,
}

impl CacheManagerBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Attach an L2 store
    pub fn persistent(mut self, persistent: PersistentCache) -> Self {
        self.persistent = Some(persistent);
        self
    }

    /// Attach an L3 store rooted at `root`, budgeted by the config
    pub fn object_store(mut self, root: impl Into<PathBuf>) -> Self {
        self.object_root = Some(root.into());
        self
    }

    /// Attach both backing stores described by `storage`
    pub fn storage(self, storage: &StorageConfig) -> Self {
        self.persistent(PersistentCache::open(&storage.l2_database_path))
            .object_store(storage.l3_root.clone())
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = Some(capacity);
        self
    }

    /// Validate the configuration and assemble the manager
    pub fn build(self) -> Result<CacheManager> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        if config.layers.l2 && self.persistent.is_none() {
            warn!("L2 enabled but no persistent store attached; L2 stays inactive");
        }
        if config.layers.l3 && self.object_root.is_none() {
            warn!("L3 enabled but no object store attached; L3 stays inactive");
        }

        let l3 = self
            .object_root
            .map(|root| ObjectStore::new(root, config.limits.l3_max_bytes));

        info!(
            "Cache manager ready (L1: {}, L2: {}, L3: {})",
            config.layers.l1,
            config.layers.l2 && self.persistent.is_some(),
            config.layers.l3 && l3.is_some()
        );

        Ok(CacheManager {
            l1: MemoryCache::new(config.limits.l1_max_bytes),
            config: RwLock::new(config),
            keys: CacheKeyGenerator::new(),
            l2: self.persistent,
            l3,
            l2_counters: LayerCounters::default(),
            l3_counters: LayerCounters::default(),
            resolver: self.resolver,
            events: EventBus::new(self.event_capacity.unwrap_or(DEFAULT_EVENT_CAPACITY)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use serde_json::json;

    fn memory_manager() -> CacheManager {
        CacheManager::new(CacheConfig::memory_only()).unwrap()
    }

    fn full_manager(dir: &tempfile::TempDir) -> (CacheManager, PersistentCache) {
        let l2 = PersistentCache::in_memory();
        let manager = CacheManager::builder()
            .config(CacheConfig::default())
            .persistent(l2.clone())
            .object_store(dir.path().join("objects"))
            .build()
            .unwrap();
        (manager, l2)
    }

    #[tokio::test]
    async fn test_set_and_get_round_trip() {
        let manager = memory_manager();
        manager
            .set("k", json!({"a": 1}), Category::Validation, None)
            .await
            .unwrap();

        assert_eq!(manager.get("k").await, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_metadata_mismatch_rejected() {
        let manager = memory_manager();
        let result = manager
            .set(
                "k",
                json!(1),
                Category::Validation,
                Some(EntryMetadata::Profile {
                    canonical_url: "http://x".to_string(),
                    schema_version: None,
                }),
            )
            .await;

        assert!(matches!(result, Err(CacheError::MetadataMismatch { .. })));
        assert!(!manager.has("k").await);
    }

    #[tokio::test]
    async fn test_l1_entry_too_large_is_reported() {
        let config = CacheConfig::builder()
            .layer(CacheLayer::L2, false)
            .layer(CacheLayer::L3, false)
            .l1_max_bytes(8)
            .build();
        let manager = CacheManager::new(config).unwrap();

        let result = manager
            .set("big", json!("this value is longer than eight bytes"), Category::Validation, None)
            .await;
        assert!(matches!(result, Err(CacheError::EntryTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_oversized_value_still_reaches_object_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .layer(CacheLayer::L2, false)
            .l1_max_bytes(64)
            .build();
        let manager = CacheManager::builder()
            .config(config)
            .object_store(dir.path().join("objects"))
            .build()
            .unwrap();
        let package = json!({"package": "x".repeat(1000)});

        manager
            .set("pkg", package.clone(), Category::IgPackage, None)
            .await
            .unwrap();

        assert!(manager.get_keys(CacheLayer::L1).await.is_empty());
        assert_eq!(manager.get_keys(CacheLayer::L3).await, vec!["pkg".to_string()]);
        assert_eq!(manager.get("pkg").await, Some(package));
    }

    #[tokio::test]
    async fn test_oversized_value_replaces_older_memory_copy() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::builder()
            .layer(CacheLayer::L3, false)
            .l1_max_bytes(64)
            .build();
        let manager = CacheManager::builder()
            .config(config)
            .persistent(PersistentCache::in_memory())
            .object_store(dir.path().join("objects"))
            .build()
            .unwrap();

        manager.set("k", json!("small"), Category::Validation, None).await.unwrap();
        let large = json!("y".repeat(200));
        manager.set("k", large.clone(), Category::Validation, None).await.unwrap();

        assert_eq!(manager.get("k").await, Some(large));
    }

    #[tokio::test]
    async fn test_reenabled_l2_does_not_resurrect_deleted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, l2) = full_manager(&dir);
        manager
            .update_config(&CacheConfigUpdate::default().with_layer(CacheLayer::L3, false))
            .await
            .unwrap();

        manager.set("k", json!("v1"), Category::Validation, None).await.unwrap();
        manager
            .update_config(&CacheConfigUpdate::default().with_layer(CacheLayer::L2, false))
            .await
            .unwrap();
        assert!(manager.delete("k").await);

        manager
            .update_config(&CacheConfigUpdate::default().with_layer(CacheLayer::L2, true))
            .await
            .unwrap();

        assert!(!l2.contains_key("k").await.unwrap());
        assert_eq!(manager.get("k").await, None);
    }

    #[tokio::test]
    async fn test_reenabled_l3_does_not_serve_overwritten_value() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _l2) = full_manager(&dir);

        manager.set("k", json!("v1"), Category::Profile, None).await.unwrap();
        manager
            .update_config(&CacheConfigUpdate::default().with_layer(CacheLayer::L3, false))
            .await
            .unwrap();
        manager.set("k", json!("v2"), Category::Profile, None).await.unwrap();
        manager
            .update_config(&CacheConfigUpdate::default().with_layer(CacheLayer::L3, true))
            .await
            .unwrap();

        assert!(manager.get_keys(CacheLayer::L3).await.is_empty());
        assert_eq!(manager.get("k").await, Some(json!("v2")));
    }

    #[tokio::test]
    async fn test_l2_hit_promotes_into_l1() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, l2) = full_manager(&dir);

        let seeded = CacheEntry::new(
            "seeded".to_string(),
            json!({"from": "l2"}),
            Category::Profile,
            Duration::from_secs(60),
            None,
        );
        l2.set(&seeded).await.unwrap();

        assert_eq!(manager.get("seeded").await, Some(json!({"from": "l2"})));
        let stats = manager.get_stats().await;
        assert_eq!(stats.layers.l2.hits, 1);
        assert_eq!(stats.layers.l1.misses, 1);

        assert_eq!(manager.get("seeded").await, Some(json!({"from": "l2"})));
        let stats = manager.get_stats().await;
        assert_eq!(stats.layers.l1.hits, 1);
        assert_eq!(stats.layers.l2.hits, 1);
    }

    #[tokio::test]
    async fn test_l3_hit_promotes_into_l2_and_l1() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("objects");
        let store = ObjectStore::new(&root, 1024 * 1024);
        store
            .set(&CacheEntry::new(
                "pkg".to_string(),
                json!({"package": "hl7.fhir.r4.core"}),
                Category::IgPackage,
                Duration::from_secs(60),
                None,
            ))
            .await
            .unwrap();

        let l2 = PersistentCache::in_memory();
        let manager = CacheManager::builder()
            .persistent(l2.clone())
            .object_store(&root)
            .build()
            .unwrap();

        assert!(manager.get("pkg").await.is_some());
        assert!(l2.contains_key("pkg").await.unwrap());
        assert_eq!(manager.get_keys(CacheLayer::L1).await, vec!["pkg".to_string()]);

        let stats = manager.get_stats().await;
        assert_eq!(stats.layers.l3.hits, 1);
        assert_eq!(stats.layers.l2.misses, 1);
    }

    #[tokio::test]
    async fn test_total_miss_counts_every_enabled_layer() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = full_manager(&dir);

        assert!(manager.get("absent").await.is_none());

        let stats = manager.get_stats().await;
        assert_eq!(stats.layers.l1.misses, 1);
        assert_eq!(stats.layers.l2.misses, 1);
        assert_eq!(stats.layers.l3.misses, 1);
        assert_eq!(stats.overall.total_misses, 3);
    }

    #[tokio::test]
    async fn test_has_does_not_touch_stats() {
        let manager = memory_manager();
        manager.set("k", json!(true), Category::Validation, None).await.unwrap();

        assert!(manager.has("k").await);
        assert!(!manager.has("other").await);

        let stats = manager.get_stats().await;
        assert_eq!(stats.overall.total_hits + stats.overall.total_misses, 0);
    }

    #[tokio::test]
    async fn test_disabled_layer_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, l2) = full_manager(&dir);
        manager
            .update_config(&CacheConfigUpdate::default().with_layer(CacheLayer::L2, false))
            .await
            .unwrap();

        manager.set("k", json!(1), Category::Validation, None).await.unwrap();

        assert!(!l2.contains_key("k").await.unwrap());
        assert!(manager.get_keys(CacheLayer::L2).await.is_empty());
        assert!(!manager.get_stats().await.layers.l2.enabled);
    }

    #[tokio::test]
    async fn test_disabling_l1_drops_memory_contents() {
        let manager = memory_manager();
        manager.set("k", json!(1), Category::Validation, None).await.unwrap();

        manager
            .update_config(&CacheConfigUpdate::default().with_layer(CacheLayer::L1, false))
            .await
            .unwrap();
        manager
            .update_config(&CacheConfigUpdate::default().with_layer(CacheLayer::L1, true))
            .await
            .unwrap();

        assert!(manager.get("k").await.is_none());
    }

    #[tokio::test]
    async fn test_invalid_update_keeps_config() {
        let manager = memory_manager();
        let before = manager.get_config().await;

        let result = manager
            .update_config(
                &CacheConfigUpdate::default()
                    .with_layer(CacheLayer::L3, true)
                    .with_ttl_ms(Category::Profile, -5),
            )
            .await;

        assert!(matches!(result, Err(CacheError::ConfigValidation(_))));
        assert_eq!(manager.get_config().await, before);
    }

    #[tokio::test]
    async fn test_invalidate_by_settings_hash() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, l2) = full_manager(&dir);

        manager
            .set(
                "stale",
                json!({"isValid": true}),
                Category::Validation,
                Some(EntryMetadata::validation("r1", "s-old", "R4")),
            )
            .await
            .unwrap();
        manager
            .set(
                "fresh",
                json!({"isValid": false}),
                Category::Validation,
                Some(EntryMetadata::validation("r2", "s-new", "R4")),
            )
            .await
            .unwrap();

        let removed = manager.invalidate_by_settings_hash("s-old").await;
        assert_eq!(removed, 3);
        assert!(!manager.has("stale").await);
        assert!(manager.has("fresh").await);
        assert!(!l2.contains_key("stale").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_by_resource_hash_prefers_memory() {
        let manager = memory_manager();
        manager
            .set(
                "k",
                json!({"score": 92}),
                Category::Validation,
                Some(EntryMetadata::validation("res-1", "set-1", "R4")),
            )
            .await
            .unwrap();

        let entry = manager.get_by_resource_hash("res-1").await.unwrap();
        assert_eq!(entry.key, "k");
        assert!(manager.get_by_resource_hash("res-2").await.is_none());
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let manager = memory_manager();
        let mut events = manager.subscribe();

        manager.set("k", json!(1), Category::Profile, None).await.unwrap();
        manager.invalidate_category(Category::Profile).await;

        match events.recv().await.unwrap() {
            CacheEvent::Invalidated(event) => {
                assert_eq!(
                    event.reason,
                    InvalidationReason::CategoryInvalidated {
                        category: Category::Profile
                    }
                );
                assert_eq!(event.removed, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }

        manager.invalidate_all().await;
        match events.recv().await.unwrap() {
            CacheEvent::Invalidated(event) => {
                assert_eq!(event.reason, InvalidationReason::BulkInvalidation);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_warming_without_resolver_reports_errors() {
        let manager = memory_manager();
        let report = manager
            .warm_cache(WarmOptions::new().with_profiles(["http://a.example/P"]))
            .await;

        assert_eq!(report.total_warmed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("http://a.example/P: "));
    }

    #[tokio::test]
    async fn test_cleanup_task_sweeps_expired_entries() {
        let config = CacheConfig::builder()
            .layer(CacheLayer::L2, false)
            .layer(CacheLayer::L3, false)
            .ttl(Category::Validation, Duration::from_millis(20))
            .cleanup_interval(Duration::from_millis(30))
            .build();
        let manager = Arc::new(CacheManager::new(config).unwrap());
        let mut events = manager.subscribe();
        let handle = manager.spawn_cleanup_task();

        manager.set("k", json!(1), Category::Validation, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        match events.try_recv().unwrap() {
            CacheEvent::Invalidated(event) => {
                assert_eq!(event.reason, InvalidationReason::Expired);
                assert_eq!(event.removed, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        handle.abort();
    }
}
