//! # Validation Caching Layer
//!
//! Three storage layers behind one orchestrator:
//!
//! - **L1** `MemoryCache`: in-process map with per-entry TTL and a byte budget
//! - **L2** `PersistentCache`: SQLite table shared across restarts and processes
//! - **L3** `ObjectStore`: sharded files for large artifacts such as IG packages
//!
//! `CacheManager` probes the layers in that order, promotes hits into the
//! faster layers, writes to every enabled layer, and keeps working on L1
//! alone when the backing stores are unreachable.
//!
//! ## Example
//!
//! ```rust
//! use validation_cache::cache::{CacheConfig, CacheManager, Category};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let manager = CacheManager::new(CacheConfig::memory_only())?;
//!
//! let resource = json!({"resourceType": "Patient", "id": "123"});
//! let settings = json!({"strict": true});
//! let key = manager.generate_key(&resource, Some(&settings), "R4", Category::Validation)?;
//!
//! manager
//!     .set(&key, json!({"isValid": true, "score": 92}), Category::Validation, None)
//!     .await?;
//!
//! if let Some(result) = manager.get(&key).await {
//!     println!("Cache hit: {}", result);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod events;
pub mod key;
pub mod manager;
pub mod memory;
pub mod object_store;
pub mod persistent;
pub mod types;
pub mod warming;

pub use config::{
    CacheConfig, CacheConfigBuilder, CacheConfigUpdate, CacheLimits, LayerToggles,
    StorageConfig, WarmingConfig,
};
pub use entry::{CacheEntry, EntryMetadata};
pub use events::{CacheEvent, EventBus, InvalidationEvent, InvalidationReason};
pub use key::CacheKeyGenerator;
pub use manager::{CacheManager, CacheManagerBuilder};
pub use memory::{MemoryCache, MemoryStats};
pub use object_store::ObjectStore;
pub use persistent::PersistentCache;
pub use types::{
    CacheKey, CacheLayer, CacheStats, CacheValue, Category, LayerStats, LayerStatsSet,
    OverallStats, StoreUsage,
};
pub use warming::{Resolver, WarmOptions, WarmingReport};
