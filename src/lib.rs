//! # Validation Cache (validation-cache)
//!
//! Multi-layer cache for validation results, resolved profiles, terminology
//! lookups and implementation-guide packages.
//!
//! ## Features
//!
//! - Content-addressed keys: SHA-256 over RFC 8785 canonical JSON
//! - Three layers: in-memory, SQLite, sharded object store
//! - Read promotion with the category's configured TTL
//! - Graceful degradation to memory when L2/L3 are unreachable
//! - Category and settings-hash invalidation
//! - Cache warming through a pluggable `Resolver`
//! - Runtime configuration updates and event subscription
//!
//! ## Quick start
//!
//! ```no_run
//! use validation_cache::{CacheConfig, CacheManager, Category, StorageConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = CacheConfig::from_env()?;
//!     let storage = StorageConfig::from_env();
//!     let manager = CacheManager::with_storage(config, &storage)?;
//!
//!     manager
//!         .set("patient-123|validation|R4", json!({"isValid": true}), Category::Validation, None)
//!         .await?;
//!
//!     println!("{}", manager.get_stats().await);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    CacheConfig, CacheConfigBuilder, CacheConfigUpdate, CacheEntry, CacheEvent, CacheKey,
    CacheKeyGenerator, CacheLayer, CacheManager, CacheStats, CacheValue, Category,
    EntryMetadata, InvalidationReason, Resolver, StorageConfig, WarmOptions, WarmingReport,
};
pub use error::{CacheError, Result};
