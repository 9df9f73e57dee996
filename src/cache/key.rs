//! Deterministic, content-addressed cache keys
//!
//! Inputs are canonicalized with RFC 8785 (JSON Canonicalization Scheme):
//! object members are sorted recursively, so two structurally equal values
//! hash identically regardless of member order. The four components are
//! framed as a JSON array before hashing, which keeps
//! `("ab", "c")` and `("a", "bc")` apart.

use crate::cache::types::{CacheKey, Category};
use crate::error::{CacheError, Result};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

/// Bumped whenever the key layout changes, so old keys stop matching
const KEY_SCHEME_VERSION: u32 = 1;

/// Length of every generated key (hex-encoded SHA-256)
pub const KEY_LENGTH: usize = 64;

/// Produces cache keys from (payload, settings, schema version, category)
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheKeyGenerator;

impl CacheKeyGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Generate the key for a payload under the given settings
    ///
    /// `settings: None` is hashed as `null`, which differs from an empty
    /// settings object.
    pub fn generate_key<P>(
        &self,
        payload: &P,
        settings: Option<&Value>,
        schema_version: &str,
        category: Category,
    ) -> Result<CacheKey>
    where
        P: Serialize + ?Sized,
    {
        let payload = to_json(payload, "payload")?;

        let framed = json!([
            KEY_SCHEME_VERSION,
            payload,
            settings.cloned().unwrap_or(Value::Null),
            schema_version,
            category.as_str(),
        ]);

        digest(&framed)
    }

    /// Key for a definition identified by its canonical URL (profiles, terminology)
    pub fn canonical_url_key(
        &self,
        canonical_url: &str,
        schema_version: &str,
        category: Category,
    ) -> Result<CacheKey> {
        self.generate_key(
            &json!({ "canonicalUrl": canonical_url }),
            None,
            schema_version,
            category,
        )
    }

    /// Content hash of a single value, used for resource and settings hashes
    pub fn hash_value<T>(&self, value: &T) -> Result<String>
    where
        T: Serialize + ?Sized,
    {
        let value = to_json(value, "value")?;
        digest(&value)
    }
}

/// Convert through canonical JSON text
///
/// `serde_json::to_value` maps NaN and infinities to `null`; the
/// canonicalizer rejects them, so such payloads fail instead of colliding.
fn to_json<T>(value: &T, what: &str) -> Result<Value>
where
    T: Serialize + ?Sized,
{
    let canonical = serde_json_canonicalizer::to_vec(&value)
        .map_err(|e| CacheError::KeyGeneration(format!("{}: {}", what, e)))?;
    serde_json::from_slice(&canonical)
        .map_err(|e| CacheError::KeyGeneration(format!("{}: {}", what, e)))
}

fn digest(value: &Value) -> Result<String> {
    let canonical = serde_json_canonicalizer::to_vec(value)
        .map_err(|e| CacheError::KeyGeneration(format!("canonicalization failed: {}", e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(hex::encode(hasher.finalize()))
}
