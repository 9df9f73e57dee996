//! L1: process-local memory cache bounded by serialized byte size

use crate::cache::{
    entry::CacheEntry,
    types::{CacheKey, Category},
};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Statistics kept by the memory layer itself
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub size_bytes: usize,
    /// Entries evicted to stay under the byte budget
    pub evictions_size: u64,
    /// Entries dropped because they expired
    pub evictions_ttl: u64,
}

/// In-memory cache with per-entry TTL and a byte budget
///
/// When a write would exceed the budget, entries closest to expiry are
/// evicted first, ties broken by insertion order (oldest first).
pub struct MemoryCache {
    store: RwLock<MemoryStore>,
}

struct Slot {
    entry: CacheEntry,
    seq: u64,
}

type EvictionKey = (DateTime<Utc>, u64, CacheKey);

/// Internal cache storage
struct MemoryStore {
    entries: HashMap<CacheKey, Slot>,

    /// Eviction order: (expires_at, insertion sequence, key)
    eviction_order: BTreeSet<EvictionKey>,

    next_seq: u64,
    current_size_bytes: usize,
    max_size_bytes: usize,
    stats: MemoryStats,
}

impl MemoryStore {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let slot = self.entries.remove(key)?;
        let removed = self
            .eviction_order
            .remove(&(slot.entry.expires_at, slot.seq, slot.entry.key.clone()));
        debug_assert!(removed, "eviction index out of sync for {}", key);
        debug_assert!(
            self.current_size_bytes >= slot.entry.size_bytes,
            "L1 size accounting underflow"
        );
        self.current_size_bytes -= slot.entry.size_bytes;
        Some(slot.entry)
    }

    fn insert(&mut self, entry: CacheEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.current_size_bytes += entry.size_bytes;
        self.eviction_order
            .insert((entry.expires_at, seq, entry.key.clone()));
        self.entries.insert(entry.key.clone(), Slot { entry, seq });
    }

    /// Evict until `needed` more bytes fit in the budget
    fn evict_for(&mut self, needed: usize) -> usize {
        let now = Utc::now();
        let mut evicted = 0;

        while self.current_size_bytes + needed > self.max_size_bytes {
            let Some((expires_at, _, key)) = self.eviction_order.first().cloned() else {
                break;
            };
            self.remove(&key);
            if now > expires_at {
                self.stats.evictions_ttl += 1;
            } else {
                self.stats.evictions_size += 1;
            }
            evicted += 1;
            debug!("Evicted L1 entry to stay within budget: {}", key);
        }

        evicted
    }

    fn remove_matching<F>(&mut self, predicate: F) -> Vec<CacheKey>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let keys: Vec<CacheKey> = self
            .entries
            .values()
            .filter(|slot| predicate(&slot.entry))
            .map(|slot| slot.entry.key.clone())
            .collect();

        for key in &keys {
            self.remove(key);
        }

        keys
    }

    fn purge_expired(&mut self) -> Vec<CacheKey> {
        let now = Utc::now();
        let expired = self.remove_matching(|entry| entry.is_expired_at(now));
        self.stats.evictions_ttl += expired.len() as u64;
        expired
    }
}

impl MemoryCache {
    /// Create a memory cache holding at most `max_size_bytes` of values
    pub fn new(max_size_bytes: usize) -> Self {
        info!("Initializing L1 memory cache (budget: {} bytes)", max_size_bytes);

        Self {
            store: RwLock::new(MemoryStore {
                entries: HashMap::new(),
                eviction_order: BTreeSet::new(),
                next_seq: 0,
                current_size_bytes: 0,
                max_size_bytes,
                stats: MemoryStats::default(),
            }),
        }
    }

    /// Get a live entry, counting a hit or a miss
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        let mut store = self.store.write().await;

        let Some(expired) = store.entries.get(key).map(|slot| slot.entry.is_expired()) else {
            store.stats.misses += 1;
            debug!("L1 miss: {}", key);
            return None;
        };

        if expired {
            debug!("L1 entry expired: {}", key);
            store.remove(key);
            store.stats.evictions_ttl += 1;
            store.stats.misses += 1;
            return None;
        }

        store.stats.hits += 1;
        debug!("L1 hit: {}", key);
        store.entries.get(key).map(|slot| slot.entry.clone())
    }

    /// Whether a live entry exists, without touching statistics
    pub async fn contains_key(&self, key: &str) -> bool {
        let store = self.store.read().await;
        store
            .entries
            .get(key)
            .is_some_and(|slot| !slot.entry.is_expired())
    }

    /// Store an entry, replacing any previous value for the key
    pub async fn set(&self, entry: CacheEntry) -> Result<()> {
        let mut store = self.store.write().await;

        if entry.size_bytes > store.max_size_bytes {
            warn!(
                "Refusing L1 write of {} bytes for {} (budget {} bytes)",
                entry.size_bytes, entry.key, store.max_size_bytes
            );
            return Err(CacheError::EntryTooLarge {
                size_bytes: entry.size_bytes,
                limit_bytes: store.max_size_bytes,
            });
        }

        if store.remove(&entry.key).is_some() {
            debug!("Updating existing L1 entry: {}", entry.key);
        } else {
            debug!("Inserting new L1 entry: {}", entry.key);
        }

        store.evict_for(entry.size_bytes);
        store.insert(entry);

        Ok(())
    }

    /// Remove a specific entry, returning whether it existed
    pub async fn delete(&self, key: &str) -> bool {
        let mut store = self.store.write().await;
        let removed = store.remove(key).is_some();
        if removed {
            debug!("Removed L1 entry: {}", key);
        }
        removed
    }

    /// Clear all entries; hit/miss counters are kept
    pub async fn clear(&self) -> usize {
        let mut store = self.store.write().await;

        let count = store.entries.len();
        store.entries.clear();
        store.eviction_order.clear();
        store.current_size_bytes = 0;

        info!("Cleared {} entries from L1", count);
        count
    }

    /// Keys of all live entries
    pub async fn keys(&self) -> Vec<CacheKey> {
        let now = Utc::now();
        let store = self.store.read().await;
        store
            .entries
            .values()
            .filter(|slot| !slot.entry.is_expired_at(now))
            .map(|slot| slot.entry.key.clone())
            .collect()
    }

    /// Live entries of one category
    pub async fn entries_by_category(&self, category: Category) -> Vec<CacheEntry> {
        let now = Utc::now();
        let store = self.store.read().await;
        store
            .entries
            .values()
            .filter(|slot| slot.entry.category == category && !slot.entry.is_expired_at(now))
            .map(|slot| slot.entry.clone())
            .collect()
    }

    /// Remove every entry of a category
    pub async fn remove_category(&self, category: Category) -> usize {
        let mut store = self.store.write().await;
        let removed = store.remove_matching(|entry| entry.category == category);
        debug!("Removed {} {} entries from L1", removed.len(), category);
        removed.len()
    }

    /// Remove every entry produced under the given settings hash
    pub async fn remove_by_settings_hash(&self, settings_hash: &str) -> usize {
        let mut store = self.store.write().await;
        store
            .remove_matching(|entry| entry.settings_hash() == Some(settings_hash))
            .len()
    }

    /// Remove all expired entries
    pub async fn cleanup_expired(&self) -> Vec<CacheKey> {
        let mut store = self.store.write().await;
        let expired = store.purge_expired();
        if !expired.is_empty() {
            debug!("Cleaned up {} expired L1 entries", expired.len());
        }
        expired
    }

    /// Change the byte budget, evicting as needed to fit
    pub async fn set_max_bytes(&self, max_size_bytes: usize) -> usize {
        let mut store = self.store.write().await;
        store.max_size_bytes = max_size_bytes;
        let evicted = store.evict_for(0);
        if evicted > 0 {
            info!(
                "Evicted {} L1 entries after budget change to {} bytes",
                evicted, max_size_bytes
            );
        }
        evicted
    }

    /// Current statistics; expired entries are swept first so they are not counted
    pub async fn stats(&self) -> MemoryStats {
        let mut store = self.store.write().await;
        store.purge_expired();

        let mut stats = store.stats.clone();
        stats.entries = store.entries.len();
        stats.size_bytes = store.current_size_bytes;
        stats
    }

    /// Reset hit/miss/eviction counters
    pub async fn reset_stats(&self) {
        let mut store = self.store.write().await;
        store.stats = MemoryStats::default();
    }

    /// Get current size in bytes
    pub async fn size_bytes(&self) -> usize {
        self.store.read().await.current_size_bytes
    }

    /// Get number of entries held, including not-yet-swept expired ones
    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }
}
