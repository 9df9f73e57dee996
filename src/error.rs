//! Error types for cache operations
//!
//! Only caller-input errors (`KeyGeneration`, `ConfigValidation`,
//! `EntryTooLarge`, `MetadataMismatch`) ever leave the `CacheManager`.
//! Storage-layer failures are absorbed there and logged.

use crate::cache::types::{CacheLayer, Category};
use thiserror::Error;

/// Main error type for cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    /// Payload or settings could not be canonicalized for hashing
    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    /// A storage layer could not be reached
    #[error("Layer {layer} unavailable: {reason}")]
    LayerUnavailable { layer: CacheLayer, reason: String },

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    ConfigValidation(String),

    /// Value does not fit in the in-memory budget at all
    #[error("Entry of {size_bytes} bytes exceeds the L1 budget of {limit_bytes} bytes")]
    EntryTooLarge { size_bytes: usize, limit_bytes: usize },

    /// Metadata variant does not belong to the entry's category
    #[error("Metadata for category {metadata} attached to a {category} entry")]
    MetadataMismatch { category: Category, metadata: Category },

    /// Serialization/Deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error with context
    #[error("Error: {0}")]
    Other(String),
}

impl CacheError {
    /// Shorthand for a `LayerUnavailable` error
    pub fn unavailable(layer: CacheLayer, reason: impl std::fmt::Display) -> Self {
        CacheError::LayerUnavailable {
            layer,
            reason: reason.to_string(),
        }
    }

    /// Whether this error was caused by the caller rather than a storage layer
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            CacheError::KeyGeneration(_)
                | CacheError::ConfigValidation(_)
                | CacheError::EntryTooLarge { .. }
                | CacheError::MetadataMismatch { .. }
        )
    }
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

impl From<String> for CacheError {
    fn from(s: String) -> Self {
        CacheError::Other(s)
    }
}

impl From<&str> for CacheError {
    fn from(s: &str) -> Self {
        CacheError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization(e.to_string())
    }
}
