//! L3: on-disk object store for large artifacts such as IG packages
//!
//! Layout: `<root>/<first two chars of file name>/<file name>.json`, where the
//! file name is the key itself when it is a lowercase hex digest (which every
//! generated key is) and the SHA-256 of the key otherwise. Each file holds one
//! JSON-encoded `CacheEntry`.
//!
//! The byte budget is soft: it is enforced after each write by evicting the
//! least recently accessed objects, never the one just written.

use crate::cache::{
    entry::CacheEntry,
    types::{CacheKey, CacheLayer, Category, StoreUsage},
};
use crate::error::{CacheError, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const OBJECT_EXTENSION: &str = "json";
const MAX_DIRECT_NAME_LEN: usize = 128;

/// What the store remembers about an object without reading it
#[derive(Debug, Clone)]
struct IndexedObject {
    key: CacheKey,
    category: Category,
    settings_hash: Option<String>,
    expires_at: DateTime<Utc>,
    size_bytes: u64,
    last_accessed: DateTime<Utc>,
}

impl IndexedObject {
    fn from_entry(entry: &CacheEntry, size_bytes: u64, last_accessed: DateTime<Utc>) -> Self {
        Self {
            key: entry.key.clone(),
            category: entry.category,
            settings_hash: entry.settings_hash().map(str::to_string),
            expires_at: entry.expires_at,
            size_bytes,
            last_accessed,
        }
    }
}

#[derive(Debug, Default)]
struct ObjectIndex {
    /// file name -> object
    objects: HashMap<String, IndexedObject>,
    total_bytes: u64,
}

impl ObjectIndex {
    fn insert(&mut self, name: String, object: IndexedObject) {
        self.total_bytes += object.size_bytes;
        if let Some(previous) = self.objects.insert(name, object) {
            self.total_bytes = self.total_bytes.saturating_sub(previous.size_bytes);
        }
    }

    fn remove(&mut self, name: &str) -> Option<IndexedObject> {
        let object = self.objects.remove(name)?;
        self.total_bytes = self.total_bytes.saturating_sub(object.size_bytes);
        Some(object)
    }

    fn take_matching<F>(&mut self, predicate: F) -> Vec<String>
    where
        F: Fn(&IndexedObject) -> bool,
    {
        let names: Vec<String> = self
            .objects
            .iter()
            .filter(|(_, object)| predicate(object))
            .map(|(name, _)| name.clone())
            .collect();
        for name in &names {
            self.remove(name);
        }
        names
    }

    /// Pick least recently accessed objects until the total fits `max_bytes`
    fn take_over_budget(&mut self, max_bytes: u64, keep: &str) -> Vec<String> {
        let mut candidates: Vec<(DateTime<Utc>, String)> = self
            .objects
            .iter()
            .filter(|(name, _)| name.as_str() != keep)
            .map(|(name, object)| (object.last_accessed, name.clone()))
            .collect();
        candidates.sort();

        let mut evicted = Vec::new();
        for (_, name) in candidates {
            if self.total_bytes <= max_bytes {
                break;
            }
            self.remove(&name);
            evicted.push(name);
        }
        evicted
    }
}

/// File-backed cache layer
pub struct ObjectStore {
    root: PathBuf,
    max_bytes: AtomicU64,
    /// Lazily built from a directory scan on first use
    index: Mutex<Option<ObjectIndex>>,
}

impl ObjectStore {
    /// Store rooted at `root`; nothing touches the filesystem until first use
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        let root = root.into();
        info!(
            "Configuring L3 object store at {} (budget: {} bytes)",
            root.display(),
            max_bytes
        );

        Self {
            root,
            max_bytes: AtomicU64::new(max_bytes),
            index: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get a live entry, updating its last-access time
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        self.ensure_index().await?;
        let name = file_name(key);
        let path = self.object_path(&name);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.with_index(|index| index.remove(&name)).await;
                return Ok(None);
            }
            Err(e) => return Err(io_error("read", &path, e)),
        };

        let entry = match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.key == key => entry,
            Ok(entry) => {
                warn!("L3 object {} holds key {}, expected {}", name, entry.key, key);
                return Ok(None);
            }
            Err(e) => {
                warn!("Dropping undecodable L3 object {}: {}", path.display(), e);
                self.remove_files(vec![name]).await?;
                return Ok(None);
            }
        };

        if entry.is_expired() {
            debug!("L3 entry expired: {}", key);
            self.remove_files(vec![name]).await?;
            return Ok(None);
        }

        let size_bytes = bytes.len() as u64;
        self.with_index(|index| match index.objects.get_mut(&name) {
            Some(object) => object.last_accessed = Utc::now(),
            None => index.insert(
                name.clone(),
                IndexedObject::from_entry(&entry, size_bytes, Utc::now()),
            ),
        })
        .await;

        Ok(Some(entry))
    }

    /// Whether a live entry exists, according to the index
    pub async fn contains_key(&self, key: &str) -> Result<bool> {
        self.ensure_index().await?;
        let name = file_name(key);
        let now = Utc::now();
        Ok(self
            .with_index(|index| {
                index
                    .objects
                    .get(&name)
                    .is_some_and(|object| object.expires_at >= now)
            })
            .await)
    }

    /// Write an entry atomically, then enforce the byte budget
    pub async fn set(&self, entry: &CacheEntry) -> Result<()> {
        self.ensure_index().await?;
        let name = file_name(&entry.key);
        let path = self.object_path(&name);
        let bytes = serde_json::to_vec(entry)?;

        let shard_dir = self.root.join(&name[..2]);
        fs::create_dir_all(&shard_dir)
            .await
            .map_err(|e| io_error("create shard", &shard_dir, e))?;

        let tmp_path = shard_dir.join(format!(".{}.tmp", uuid::Uuid::new_v4()));
        fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| io_error("write", &tmp_path, e))?;
        if let Err(e) = fs::rename(&tmp_path, &path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(io_error("rename", &path, e));
        }

        let max_bytes = self.max_bytes.load(Ordering::Relaxed);
        let object = IndexedObject::from_entry(entry, bytes.len() as u64, Utc::now());
        let evicted = self
            .with_index(|index| {
                index.insert(name.clone(), object);
                index.take_over_budget(max_bytes, &name)
            })
            .await;

        debug!("Stored L3 object {} ({} bytes)", name, bytes.len());
        if !evicted.is_empty() {
            debug!("Evicting {} L3 objects over budget", evicted.len());
            self.remove_files(evicted).await?;
        }

        Ok(())
    }

    /// Remove a specific entry, returning whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_index().await?;
        let name = file_name(key);
        let indexed = self.with_index(|index| index.remove(&name)).await.is_some();
        let removed = self.remove_file(&name).await?;
        Ok(indexed || removed)
    }

    /// Remove every object
    pub async fn clear(&self) -> Result<usize> {
        self.ensure_index().await?;
        let names = self.with_index(|index| index.take_matching(|_| true)).await;
        let count = names.len();
        self.remove_files(names).await?;
        info!("Cleared {} objects from L3", count);
        Ok(count)
    }

    /// Keys of all live objects
    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        self.ensure_index().await?;
        let now = Utc::now();
        Ok(self
            .with_index(|index| {
                index
                    .objects
                    .values()
                    .filter(|object| object.expires_at >= now)
                    .map(|object| object.key.clone())
                    .collect()
            })
            .await)
    }

    /// Remove every object of a category
    pub async fn remove_category(&self, category: Category) -> Result<usize> {
        self.ensure_index().await?;
        let names = self
            .with_index(|index| index.take_matching(|object| object.category == category))
            .await;
        let count = names.len();
        self.remove_files(names).await?;
        Ok(count)
    }

    /// Remove every object produced under the given settings hash
    pub async fn remove_by_settings_hash(&self, settings_hash: &str) -> Result<usize> {
        self.ensure_index().await?;
        let names = self
            .with_index(|index| {
                index.take_matching(|object| object.settings_hash.as_deref() == Some(settings_hash))
            })
            .await;
        let count = names.len();
        self.remove_files(names).await?;
        Ok(count)
    }

    /// Remove every expired object
    pub async fn cleanup_expired(&self) -> Result<usize> {
        self.ensure_index().await?;
        let now = Utc::now();
        let names = self
            .with_index(|index| index.take_matching(|object| now > object.expires_at))
            .await;
        let count = names.len();
        self.remove_files(names).await?;
        if count > 0 {
            debug!("Cleaned up {} expired L3 objects", count);
        }
        Ok(count)
    }

    /// Count and byte usage of live objects
    pub async fn usage(&self) -> Result<StoreUsage> {
        self.ensure_index().await?;
        let now = Utc::now();
        Ok(self
            .with_index(|index| {
                index
                    .objects
                    .values()
                    .filter(|object| object.expires_at >= now)
                    .fold(StoreUsage::default(), |mut usage, object| {
                        usage.entries += 1;
                        usage.size_bytes += object.size_bytes;
                        usage
                    })
            })
            .await)
    }

    /// Change the soft budget, evicting as needed to fit
    pub async fn set_max_bytes(&self, max_bytes: u64) -> Result<usize> {
        self.max_bytes.store(max_bytes, Ordering::Relaxed);
        self.ensure_index().await?;
        let evicted = self
            .with_index(|index| index.take_over_budget(max_bytes, ""))
            .await;
        let count = evicted.len();
        self.remove_files(evicted).await?;
        Ok(count)
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.root
            .join(&name[..2])
            .join(format!("{}.{}", name, OBJECT_EXTENSION))
    }

    async fn with_index<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&mut ObjectIndex) -> T,
    {
        let mut guard = self.index.lock().await;
        f(guard.get_or_insert_with(ObjectIndex::default))
    }

    async fn remove_file(&self, name: &str) -> Result<bool> {
        let path = self.object_path(name);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }

    async fn remove_files(&self, names: Vec<String>) -> Result<()> {
        self.with_index(|index| {
            for name in &names {
                index.remove(name);
            }
        })
        .await;

        for name in &names {
            self.remove_file(name).await?;
        }
        Ok(())
    }

    /// Create the root and build the index from disk if not done yet
    async fn ensure_index(&self) -> Result<()> {
        let mut guard = self.index.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error("create root", &self.root, e))?;

        let index = self.scan().await?;
        info!(
            "Indexed {} L3 objects ({} bytes) under {}",
            index.objects.len(),
            index.total_bytes,
            self.root.display()
        );
        *guard = Some(index);
        Ok(())
    }

    async fn scan(&self) -> Result<ObjectIndex> {
        let mut index = ObjectIndex::default();
        let mut shards = fs::read_dir(&self.root)
            .await
            .map_err(|e| io_error("list", &self.root, e))?;

        while let Some(shard) = shards
            .next_entry()
            .await
            .map_err(|e| io_error("list", &self.root, e))?
        {
            let shard_path = shard.path();
            if !shard_path.is_dir() {
                continue;
            }

            let mut files = fs::read_dir(&shard_path)
                .await
                .map_err(|e| io_error("list", &shard_path, e))?;
            while let Some(file) = files
                .next_entry()
                .await
                .map_err(|e| io_error("list", &shard_path, e))?
            {
                let path = file.path();
                if path.extension().and_then(|ext| ext.to_str()) != Some(OBJECT_EXTENSION) {
                    continue;
                }
                let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                else {
                    continue;
                };

                match load_indexed(&path).await {
                    Ok(object) => index.insert(name, object),
                    Err(e) => {
                        warn!("Skipping unreadable L3 object {}: {}", path.display(), e);
                    }
                }
            }
        }

        Ok(index)
    }
}

async fn load_indexed(path: &Path) -> Result<IndexedObject> {
    let bytes = fs::read(path).await.map_err(|e| io_error("read", path, e))?;
    let entry: CacheEntry = serde_json::from_slice(&bytes)?;
    let last_accessed = fs::metadata(path)
        .await
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or(entry.created_at);

    Ok(IndexedObject::from_entry(
        &entry,
        bytes.len() as u64,
        last_accessed,
    ))
}

/// File name for a key: the key itself when it is a short lowercase hex digest
fn file_name(key: &str) -> String {
    let is_digest = key.len() >= 2
        && key.len() <= MAX_DIRECT_NAME_LEN
        && key
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));

    if is_digest {
        key.to_string()
    } else {
        hex::encode(Sha256::digest(key.as_bytes()))
    }
}

fn io_error(op: &str, path: &Path, e: std::io::Error) -> CacheError {
    CacheError::unavailable(CacheLayer::L3, format!("{} {}: {}", op, path.display(), e))
}
