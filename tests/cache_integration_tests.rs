//! Integration tests for the cache manager
//!
//! These tests exercise the public API end to end:
//! - Round trips and TTL expiry
//! - Promotion from slower layers
//! - Category isolation and bulk invalidation
//! - Degradation when backing stores are unreachable
//! - Statistics and cache warming

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;
use validation_cache::cache::{
    CacheConfig, CacheConfigUpdate, CacheEntry, CacheEvent, CacheLayer, CacheManager, Category,
    EntryMetadata, InvalidationReason, PersistentCache, Resolver, StorageConfig, WarmOptions,
};
use validation_cache::{CacheError, CacheValue};

const PATIENT_KEY: &str = "patient-123|validation|R4";

/// Resolver that fails for URLs on `bad.example` and stalls on `slow.example`
struct FakeResolver;

#[async_trait]
impl Resolver for FakeResolver {
    async fn resolve_profile(
        &self,
        canonical_url: &str,
        schema_version: &str,
    ) -> anyhow::Result<CacheValue> {
        if canonical_url.contains("bad.example") {
            anyhow::bail!("profile not found");
        }
        if canonical_url.contains("slow.example") {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(json!({
            "resourceType": "StructureDefinition",
            "url": canonical_url,
            "fhirVersion": schema_version,
        }))
    }

    async fn resolve_terminology(
        &self,
        system_url: &str,
        _schema_version: &str,
    ) -> anyhow::Result<CacheValue> {
        if system_url.contains("bad.example") {
            anyhow::bail!("code system unavailable");
        }
        Ok(json!({"resourceType": "CodeSystem", "url": system_url}))
    }
}

fn memory_only(config: CacheConfig) -> CacheManager {
    CacheManager::new(config).unwrap()
}

fn full_stack(dir: &tempfile::TempDir) -> CacheManager {
    let storage = StorageConfig {
        l2_database_path: dir.path().join("cache.sqlite3"),
        l3_root: dir.path().join("objects"),
    };
    CacheManager::with_storage(CacheConfig::default(), &storage).unwrap()
}

#[tokio::test]
async fn test_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let manager = full_stack(&dir);

    assert_ok!(manager.set("k", json!({"a": 1}), Category::Validation, None).await);
    assert_eq!(manager.get("k").await, Some(json!({"a": 1})));
}

#[tokio::test]
async fn test_patient_scenario_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let manager = full_stack(&dir);

    manager
        .set(
            PATIENT_KEY,
            json!({"isValid": true, "score": 92}),
            Category::Validation,
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        manager.get(PATIENT_KEY).await,
        Some(json!({"isValid": true, "score": 92}))
    );

    manager.clear().await;

    assert_eq!(manager.get(PATIENT_KEY).await, None);
    assert_eq!(manager.get_stats().await.overall.total_entries, 0);
}

#[tokio::test]
async fn test_clear_keeps_hit_counters() {
    let manager = memory_only(CacheConfig::memory_only());
    manager.set("k", json!(1), Category::Validation, None).await.unwrap();
    manager.get("k").await;

    manager.clear().await;

    let stats = manager.get_stats().await;
    assert_eq!(stats.overall.total_hits, 1);
    assert_eq!(stats.overall.total_entries, 0);

    manager.reset_stats().await;
    assert_eq!(manager.get_stats().await.overall.total_hits, 0);
}

#[tokio::test]
async fn test_ttl_expiry() {
    let config = CacheConfig::builder()
        .layer(CacheLayer::L2, false)
        .layer(CacheLayer::L3, false)
        .ttl(Category::Validation, Duration::from_millis(50))
        .ttl_jitter(0.0) // No jitter for predictable tests
        .build();
    let manager = memory_only(config);

    manager.set("k", json!("v"), Category::Validation, None).await.unwrap();
    assert!(manager.has("k").await);

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(manager.get("k").await, None);
    assert_eq!(manager.get_stats().await.layers.l1.entries, 0);
}

#[tokio::test]
async fn test_expired_persistent_entry_not_returned() {
    let l2 = PersistentCache::in_memory();
    let manager = CacheManager::builder()
        .config(
            CacheConfig::builder()
                .layer(CacheLayer::L3, false)
                .ttl(Category::Terminology, Duration::from_millis(30))
                .build(),
        )
        .persistent(l2.clone())
        .build()
        .unwrap();

    manager.set("t", json!({"code": "1234-5"}), Category::Terminology, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(manager.get("t").await, None);
    assert!(!l2.contains_key("t").await.unwrap());
}

#[tokio::test]
async fn test_promotion_from_persistent_layer() {
    let l2 = PersistentCache::in_memory();
    let manager = CacheManager::builder()
        .config(CacheConfig::builder().layer(CacheLayer::L3, false).build())
        .persistent(l2.clone())
        .build()
        .unwrap();

    // Seed L2 only, bypassing the manager
    l2.set(&CacheEntry::new(
        "profile-key".to_string(),
        json!({"url": "http://hl7.org/fhir/StructureDefinition/Patient"}),
        Category::Profile,
        Duration::from_secs(60),
        None,
    ))
    .await
    .unwrap();
    assert!(manager.get_keys(CacheLayer::L1).await.is_empty());

    assert!(manager.get("profile-key").await.is_some());
    let stats = manager.get_stats().await;
    assert_eq!(stats.layers.l2.hits, 1);
    assert_eq!(stats.layers.l1.hits, 0);

    assert!(manager.get("profile-key").await.is_some());
    let stats = manager.get_stats().await;
    assert_eq!(stats.layers.l1.hits, 1);
    assert_eq!(stats.layers.l2.hits, 1);
}

#[tokio::test]
async fn test_promotion_uses_configured_ttl() {
    let l2 = PersistentCache::in_memory();
    let manager = CacheManager::builder()
        .config(
            CacheConfig::builder()
                .layer(CacheLayer::L3, false)
                .ttl(Category::Profile, Duration::from_secs(3600))
                .build(),
        )
        .persistent(l2.clone())
        .build()
        .unwrap();

    // Nearly expired in L2; promotion must grant a fresh window
    l2.set(&CacheEntry::new(
        "p".to_string(),
        json!(1),
        Category::Profile,
        Duration::from_millis(150),
        None,
    ))
    .await
    .unwrap();

    assert!(manager.get("p").await.is_some());
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(manager.get("p").await.is_some());
    assert_eq!(manager.get_stats().await.layers.l1.hits, 1);
}

#[tokio::test]
async fn test_category_isolation() {
    let dir = tempfile::tempdir().unwrap();
    let manager = full_stack(&dir);

    manager
        .set("profile", json!({"kind": "profile"}), Category::Profile, None)
        .await
        .unwrap();
    manager
        .set("result", json!({"kind": "validation"}), Category::Validation, None)
        .await
        .unwrap();

    let removed = manager.invalidate_category(Category::Profile).await;
    assert!(removed >= 1);

    assert_eq!(manager.get("profile").await, None);
    assert_eq!(
        manager.get("result").await,
        Some(json!({"kind": "validation"}))
    );
}

#[tokio::test]
async fn test_invalidate_all_signals_bulk_invalidation() {
    let manager = memory_only(CacheConfig::memory_only());
    let mut events = manager.subscribe();

    manager.set("a", json!(1), Category::Validation, None).await.unwrap();
    manager.set("b", json!(2), Category::Profile, None).await.unwrap();

    assert_eq!(manager.invalidate_all().await, 2);
    assert!(!manager.has("a").await);
    assert!(!manager.has("b").await);

    match events.recv().await.unwrap() {
        CacheEvent::Invalidated(event) => {
            assert_eq!(event.reason, InvalidationReason::BulkInvalidation);
            assert_eq!(event.removed, 2);
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_delete_removes_from_every_layer() {
    let dir = tempfile::tempdir().unwrap();
    let manager = full_stack(&dir);

    manager.set("k", json!(1), Category::IgPackage, None).await.unwrap();
    for layer in [CacheLayer::L1, CacheLayer::L2, CacheLayer::L3] {
        assert_eq!(manager.get_keys(layer).await, vec!["k".to_string()]);
    }

    assert!(manager.delete("k").await);
    assert!(!manager.delete("k").await);
    assert!(!manager.has("k").await);
}

#[tokio::test]
async fn test_unwritable_object_store_degrades_to_memory() {
    // A regular file cannot hold a directory tree, even for root
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let manager = CacheManager::builder()
        .config(CacheConfig::builder().layer(CacheLayer::L2, false).build())
        .object_store(blocker.path().join("objects"))
        .build()
        .unwrap();

    assert_ok!(manager.set("k", json!({"ok": true}), Category::IgPackage, None).await);
    assert_eq!(manager.get("k").await, Some(json!({"ok": true})));
    assert!(manager.has("k").await);
    assert!(manager.delete("k").await);
    assert!(manager.get_keys(CacheLayer::L3).await.is_empty());

    let stats = manager.get_stats().await;
    assert_eq!(stats.layers.l3.entries, 0);
}

#[tokio::test]
async fn test_unreachable_backing_stores_keep_l1_serving() {
    let blocker = tempfile::NamedTempFile::new().unwrap();
    let storage = StorageConfig {
        l2_database_path: blocker.path().join("db").join("cache.sqlite3"),
        l3_root: blocker.path().join("objects"),
    };
    let manager = CacheManager::with_storage(CacheConfig::default(), &storage).unwrap();

    manager.set(PATIENT_KEY, json!({"isValid": true}), Category::Validation, None)
        .await
        .unwrap();
    assert_eq!(manager.get(PATIENT_KEY).await, Some(json!({"isValid": true})));
    assert!(manager.get("missing").await.is_none());
    assert_eq!(manager.invalidate_category(Category::Validation).await, 1);
    assert_eq!(manager.cleanup_expired().await, 0);
}

#[tokio::test]
async fn test_stats_hit_rate() {
    let manager = memory_only(CacheConfig::memory_only());
    manager.set("k", json!(1), Category::Validation, None).await.unwrap();

    manager.get("k").await;
    manager.get("k").await;
    manager.get("absent").await;

    let stats = manager.get_stats().await;
    assert_eq!(stats.overall.total_hits + stats.overall.total_misses, 3);
    assert!((stats.overall.hit_rate - 2.0 / 3.0).abs() < 1e-9);
    assert!(!stats.layers.l2.enabled);
    assert!(!stats.layers.l3.enabled);
}

#[tokio::test]
async fn test_typed_helpers() {
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Outcome {
        is_valid: bool,
        score: u32,
    }

    let manager = memory_only(CacheConfig::memory_only());
    let outcome = Outcome {
        is_valid: true,
        score: 92,
    };

    manager
        .set_serialized("typed", &outcome, Category::Validation, None)
        .await
        .unwrap();
    assert_eq!(manager.get_as::<Outcome>("typed").await.unwrap(), Some(outcome));
    assert!(matches!(
        manager.get_as::<Vec<String>>("typed").await,
        Err(CacheError::Serialization(_))
    ));
}

#[tokio::test]
async fn test_settings_change_invalidates_results() {
    let dir = tempfile::tempdir().unwrap();
    let manager = full_stack(&dir);
    let keys = manager.key_generator();

    let resource = json!({"resourceType": "Patient", "id": "123"});
    let old_settings = json!({"strict": false});
    let new_settings = json!({"strict": true});

    let resource_hash = keys.hash_value(&resource).unwrap();
    let old_hash = keys.hash_value(&old_settings).unwrap();
    let key = manager
        .generate_key(&resource, Some(&old_settings), "R4", Category::Validation)
        .unwrap();

    manager
        .set(
            &key,
            json!({"isValid": true}),
            Category::Validation,
            Some(EntryMetadata::validation(&resource_hash, &old_hash, "R4")),
        )
        .await
        .unwrap();

    let found = manager.get_by_resource_hash(&resource_hash).await.unwrap();
    assert_eq!(found.key, key);

    manager.invalidate_by_settings_hash(&old_hash).await;
    assert!(manager.get(&key).await.is_none());
    assert!(manager.get_by_resource_hash(&resource_hash).await.is_none());

    let new_key = manager
        .generate_key(&resource, Some(&new_settings), "R4", Category::Validation)
        .unwrap();
    assert_ne!(key, new_key);
}

#[tokio::test]
async fn test_update_config_rejects_negative_values() {
    let manager = memory_only(CacheConfig::memory_only());
    let before = manager.get_config().await;

    let negative_ttl = CacheConfigUpdate::default().with_ttl_ms(Category::Validation, -1);
    assert!(matches!(
        manager.update_config(&negative_ttl).await,
        Err(CacheError::ConfigValidation(_))
    ));

    let negative_size = CacheConfigUpdate::default().with_l1_max_bytes(-1024);
    assert!(matches!(
        manager.update_config(&negative_size).await,
        Err(CacheError::ConfigValidation(_))
    ));

    assert_eq!(manager.get_config().await, before);
}

#[tokio::test]
async fn test_update_config_applies_and_notifies() {
    let manager = memory_only(CacheConfig::memory_only());
    let mut events = manager.subscribe();

    let update: CacheConfigUpdate = serde_json::from_value(json!({
        "ttlByCategoryMs": {"profile": 120000},
        "limits": {"l1MaxBytes": 2048}
    }))
    .unwrap();
    manager.update_config(&update).await.unwrap();

    let config = manager.get_config().await;
    assert_eq!(config.base_ttl(Category::Profile), Duration::from_secs(120));
    assert_eq!(config.limits.l1_max_bytes, 2048);

    match events.recv().await.unwrap() {
        CacheEvent::ConfigUpdated(config) => assert_eq!(config.limits.l1_max_bytes, 2048),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_warming_partial_failure() {
    let manager = CacheManager::builder()
        .config(CacheConfig::memory_only())
        .resolver(Arc::new(FakeResolver))
        .build()
        .unwrap();

    let report = manager
        .warm_cache(
            WarmOptions::new()
                .with_profiles(["http://good.example/P", "http://bad.example/P"])
                .with_categories(vec![Category::Profile]),
        )
        .await;

    assert_eq!(report.profiles_warmed, 1);
    assert_eq!(report.total_warmed, 1);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].starts_with("http://bad.example/P: "));

    let key = manager
        .key_generator()
        .canonical_url_key("http://good.example/P", "R4", Category::Profile)
        .unwrap();
    let entry = manager.get_entry(&key).await.unwrap();
    assert_eq!(entry.category, Category::Profile);
    assert_eq!(
        entry.metadata.as_ref().and_then(|m| m.canonical_url()),
        Some("http://good.example/P")
    );
}

#[tokio::test]
async fn test_warming_filters_categories_and_times_out() {
    let config = CacheConfig::builder()
        .layer(CacheLayer::L2, false)
        .layer(CacheLayer::L3, false)
        .warming_batch_size(2)
        .warming_item_timeout(Duration::from_millis(50))
        .build();
    let manager = CacheManager::builder()
        .config(config)
        .resolver(Arc::new(FakeResolver))
        .build()
        .unwrap();
    let mut events = manager.subscribe();

    let report = manager
        .warm_cache(
            WarmOptions::new()
                .with_profiles([
                    "http://good.example/A",
                    "http://slow.example/B",
                    "http://good.example/C",
                ])
                .with_terminology_systems(["http://loinc.org", "http://bad.example/CS"]),
        )
        .await;

    assert_eq!(report.profiles_warmed, 2);
    assert_eq!(report.terminology_warmed, 1);
    assert_eq!(report.total_warmed, 3);
    assert_eq!(report.errors.len(), 2);
    assert!(report
        .errors
        .iter()
        .any(|e| e.starts_with("http://slow.example/B: timed out")));

    match events.recv().await.unwrap() {
        CacheEvent::Warmed(warmed) => assert_eq!(warmed, report),
        other => panic!("unexpected event: {:?}", other),
    }

    let terminology_only = manager
        .warm_cache(
            WarmOptions::new()
                .with_profiles(["http://good.example/A"])
                .with_terminology_systems(["http://snomed.info/sct"])
                .with_categories(vec![Category::Terminology]),
        )
        .await;
    assert_eq!(terminology_only.profiles_warmed, 0);
    assert_eq!(terminology_only.terminology_warmed, 1);
}

#[tokio::test]
async fn test_persistent_layer_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let manager = full_stack(&dir);
        manager
            .set(PATIENT_KEY, json!({"isValid": false}), Category::Validation, None)
            .await
            .unwrap();
    }

    let manager = full_stack(&dir);
    assert_eq!(manager.get(PATIENT_KEY).await, Some(json!({"isValid": false})));
    assert_eq!(manager.get_stats().await.layers.l2.hits, 1);
}

#[test]
fn test_manager_usable_from_blocking_context() {
    let manager = memory_only(CacheConfig::memory_only());

    let value = tokio_test::block_on(async {
        manager.set("k", json!([1, 2, 3]), Category::Validation, None).await.unwrap();
        manager.get("k").await
    });

    assert_eq!(value, Some(json!([1, 2, 3])));
}
