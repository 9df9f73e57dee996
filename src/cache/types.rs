//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cache key type - fixed-length hex digest when produced by the key generator
pub type CacheKey = String;

/// Cache value type - any structured value (validation results, definitions, packages)
pub type CacheValue = serde_json::Value;

/// Classification of cached content, each with its own TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Category {
    /// Result of validating a resource
    Validation,
    /// Resolved profile (structure definition)
    Profile,
    /// Terminology lookup (code system / value set)
    Terminology,
    /// Downloaded implementation-guide package
    IgPackage,
}

impl Category {
    /// Every category, in a stable order
    pub const ALL: [Category; 4] = [
        Category::Validation,
        Category::Profile,
        Category::Terminology,
        Category::IgPackage,
    ];

    /// Convert category to its storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Validation => "validation",
            Category::Profile => "profile",
            Category::Terminology => "terminology",
            Category::IgPackage => "igPackage",
        }
    }

    /// Parse category from its storage representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(Category::Validation),
            "profile" => Some(Category::Profile),
            "terminology" => Some(Category::Terminology),
            "igPackage" | "ig_package" | "igpackage" => Some(Category::IgPackage),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cache layers in probe order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheLayer {
    /// In-process memory
    L1,
    /// Durable store shared across restarts and instances
    L2,
    /// On-disk object store for large artifacts
    L3,
}

impl CacheLayer {
    /// Layers in the fixed order they are probed
    pub const PROBE_ORDER: [CacheLayer; 3] = [CacheLayer::L1, CacheLayer::L2, CacheLayer::L3];
}

impl fmt::Display for CacheLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheLayer::L1 => write!(f, "L1"),
            CacheLayer::L2 => write!(f, "L2"),
            CacheLayer::L3 => write!(f, "L3"),
        }
    }
}

/// Entry count and byte usage reported by a storage layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreUsage {
    pub entries: usize,
    pub size_bytes: u64,
}

/// Statistics for a single layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerStats {
    /// Whether the layer is currently enabled
    pub enabled: bool,

    /// Reads served by this layer
    pub hits: u64,

    /// Reads this layer could not serve
    pub misses: u64,

    /// Live entries held by the layer
    pub entries: usize,

    /// Approximate bytes held by the layer
    pub size_bytes: u64,
}

/// Per-layer statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayerStatsSet {
    #[serde(rename = "L1")]
    pub l1: LayerStats,
    #[serde(rename = "L2")]
    pub l2: LayerStats,
    #[serde(rename = "L3")]
    pub l3: LayerStats,
}

impl LayerStatsSet {
    /// Iterate layers in probe order
    pub fn iter(&self) -> impl Iterator<Item = (CacheLayer, &LayerStats)> {
        [
            (CacheLayer::L1, &self.l1),
            (CacheLayer::L2, &self.l2),
            (CacheLayer::L3, &self.l3),
        ]
        .into_iter()
    }
}

/// Aggregated statistics across enabled layers
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallStats {
    pub total_hits: u64,
    pub total_misses: u64,
    /// hits / (hits + misses), 0.0 when nothing was read yet
    pub hit_rate: f64,
    pub total_entries: usize,
    pub total_size_bytes: u64,
}

/// Statistics snapshot returned by `CacheManager::get_stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub layers: LayerStatsSet,
    pub overall: OverallStats,
}

impl CacheStats {
    /// Build a snapshot, deriving the overall section from enabled layers
    pub fn from_layers(layers: LayerStatsSet) -> Self {
        let mut overall = OverallStats::default();

        for (_, stats) in layers.iter().filter(|(_, s)| s.enabled) {
            overall.total_hits += stats.hits;
            overall.total_misses += stats.misses;
            overall.total_entries += stats.entries;
            overall.total_size_bytes += stats.size_bytes;
        }

        overall.hit_rate = hit_rate(overall.total_hits, overall.total_misses);

        Self { layers, overall }
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, entries: {}, size: {} bytes }}",
            self.overall.total_hits,
            self.overall.total_misses,
            self.overall.hit_rate * 100.0,
            self.overall.total_entries,
            self.overall.total_size_bytes
        )
    }
}

/// Hit rate as a fraction in `[0.0, 1.0]`
pub fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}
