//! Walkthrough of the validation cache
//!
//! This example shows how to:
//! - Build a manager from environment configuration
//! - Cache a validation result under a content-addressed key
//! - Warm profiles and terminology through a resolver
//! - Invalidate by category and by settings hash
//!
//! Run: RUST_LOG=validation_cache=debug cargo run --example cache_demo

use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use validation_cache::cache::{CacheEvent, CacheManager, WarmOptions};
use validation_cache::{CacheConfig, CacheLayer, CacheValue, Category, EntryMetadata, Resolver, StorageConfig};

/// Serves a tiny in-process catalogue of definitions
struct CatalogueResolver;

#[async_trait]
impl Resolver for CatalogueResolver {
    async fn resolve_profile(&self, url: &str, schema_version: &str) -> anyhow::Result<CacheValue> {
        match url {
            "http://hl7.org/fhir/StructureDefinition/Patient" => Ok(json!({
                "resourceType": "StructureDefinition",
                "url": url,
                "fhirVersion": schema_version,
                "type": "Patient"
            })),
            _ => anyhow::bail!("unknown profile"),
        }
    }

    async fn resolve_terminology(&self, url: &str, _schema_version: &str) -> anyhow::Result<CacheValue> {
        Ok(json!({"resourceType": "CodeSystem", "url": url, "content": "not-present"}))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = CacheConfig::from_env()?;
    let storage = StorageConfig::from_env();
    println!(
        "Using L2 at {} and L3 at {}\n",
        storage.l2_database_path.display(),
        storage.l3_root.display()
    );

    let manager = Arc::new(
        CacheManager::builder()
            .config(config)
            .storage(&storage)
            .resolver(Arc::new(CatalogueResolver))
            .build()?,
    );
    let cleanup = manager.spawn_cleanup_task();

    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                CacheEvent::Invalidated(event) => {
                    println!("   [event] {} ({} removed)", event.reason, event.removed)
                }
                CacheEvent::Warmed(report) => {
                    println!("   [event] warmed {} items", report.total_warmed)
                }
                CacheEvent::ConfigUpdated(_) => println!("   [event] configuration updated"),
            }
        }
    });

    // 1. Cache a validation result
    println!("1. Caching a validation result...");
    let resource = json!({"resourceType": "Patient", "id": "123", "gender": "female"});
    let settings = json!({"strict": true, "terminology": {"validateCodes": true}});

    let keys = manager.key_generator();
    let resource_hash = keys.hash_value(&resource)?;
    let settings_hash = keys.hash_value(&settings)?;
    let key = manager.generate_key(&resource, Some(&settings), "R4", Category::Validation)?;

    manager
        .set(
            &key,
            json!({"isValid": true, "score": 92, "issues": []}),
            Category::Validation,
            Some(EntryMetadata::validation(&resource_hash, &settings_hash, "R4")),
        )
        .await?;
    println!("   key: {}", key);
    println!("   cached: {:?}\n", manager.get(&key).await);

    // 2. Warm definitions
    println!("2. Warming profiles and terminology...");
    let report = manager
        .warm_cache(
            WarmOptions::new()
                .with_profiles([
                    "http://hl7.org/fhir/StructureDefinition/Patient",
                    "http://example.org/StructureDefinition/Missing",
                ])
                .with_terminology_systems(["http://loinc.org"]),
        )
        .await;
    println!(
        "   profiles: {}, terminology: {}, errors: {:?} ({}ms)\n",
        report.profiles_warmed, report.terminology_warmed, report.errors, report.duration_ms
    );

    // 3. Inspect layers
    println!("3. Layer contents...");
    for layer in CacheLayer::PROBE_ORDER {
        println!("   {}: {} keys", layer, manager.get_keys(layer).await.len());
    }
    println!("   {}\n", manager.get_stats().await);

    // 4. Invalidate
    println!("4. Invalidating...");
    let removed = manager.invalidate_category(Category::Profile).await;
    println!("   profiles removed: {}", removed);
    let removed = manager.invalidate_by_settings_hash(&settings_hash).await;
    println!("   results under old settings removed: {}", removed);
    println!("   validation result still cached: {}\n", manager.has(&key).await);

    println!("{}", manager.get_stats().await);

    cleanup.abort();
    Ok(())
}
