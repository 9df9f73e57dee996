//! L2: durable cache backed by SQLite
//!
//! The database survives restarts and can be shared by several processes
//! on the same host. Writes are last-write-wins (`INSERT OR REPLACE`); WAL
//! mode plus a busy timeout lets concurrent writers queue instead of failing.
//! Calls draw from a small pool of connections, so a write waiting on the
//! busy timeout does not hold up every other L2 call in the process.
//!
//! Every failure to reach or query the database surfaces as
//! `CacheError::LayerUnavailable`. Deciding what to do about it is left to
//! the caller.

use crate::cache::{
    entry::{CacheEntry, EntryMetadata},
    types::{CacheKey, CacheLayer, Category, StoreUsage},
};
use crate::error::{CacheError, Result};
use chrono::{TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS cache_entries (
        key            TEXT PRIMARY KEY,
        value          TEXT NOT NULL,
        category       TEXT NOT NULL,
        created_at     INTEGER NOT NULL,
        expires_at     INTEGER NOT NULL,
        size_bytes     INTEGER NOT NULL,
        resource_hash  TEXT,
        settings_hash  TEXT,
        schema_version TEXT,
        metadata       TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_cache_entries_resource_hash ON cache_entries(resource_hash);
    CREATE INDEX IF NOT EXISTS idx_cache_entries_settings_hash ON cache_entries(settings_hash);
    CREATE INDEX IF NOT EXISTS idx_cache_entries_category ON cache_entries(category);
    CREATE INDEX IF NOT EXISTS idx_cache_entries_expires_at ON cache_entries(expires_at);
";

const SELECT_COLUMNS: &str =
    "key, value, category, created_at, expires_at, size_bytes, metadata";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Concurrent connections to a database file
const FILE_POOL_SIZE: usize = 4;

/// Where the database lives
#[derive(Debug, Clone)]
enum Location {
    File(PathBuf),
    Memory,
}

/// Row as stored, decoded outside the blocking section
struct StoredRow {
    key: String,
    value: String,
    category: String,
    created_at: i64,
    expires_at: i64,
    size_bytes: i64,
    metadata: Option<String>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            key: row.get(0)?,
            value: row.get(1)?,
            category: row.get(2)?,
            created_at: row.get(3)?,
            expires_at: row.get(4)?,
            size_bytes: row.get(5)?,
            metadata: row.get(6)?,
        })
    }

    fn decode(self) -> Result<CacheEntry> {
        let category = Category::parse(&self.category).ok_or_else(|| {
            CacheError::Serialization(format!("unknown category {:?}", self.category))
        })?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str::<EntryMetadata>)
            .transpose()?;

        Ok(CacheEntry {
            value: serde_json::from_str(&self.value)?,
            category,
            created_at: from_millis(self.created_at)?,
            expires_at: from_millis(self.expires_at)?,
            size_bytes: usize::try_from(self.size_bytes).unwrap_or(0),
            metadata,
            key: self.key,
        })
    }
}

/// Idle connections plus a permit per connection that may be in use
///
/// An in-memory database exists only inside its one connection, so that
/// location gets a single permit.
struct ConnectionPool {
    location: Location,
    idle: Mutex<Vec<Connection>>,
    permits: Arc<Semaphore>,
}

impl ConnectionPool {
    fn new(location: Location) -> Self {
        let size = match location {
            Location::File(_) => FILE_POOL_SIZE,
            Location::Memory => 1,
        };
        Self {
            location,
            idle: Mutex::new(Vec::with_capacity(size)),
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    fn checkout(&self) -> Result<Connection> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => connect(&self.location),
        }
    }

    fn checkin(&self, conn: Connection) {
        self.idle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(conn);
    }
}

/// Durable cache layer over a SQLite database
///
/// Connections are opened lazily and re-attempted on the next call if
/// opening fails, so a database that comes back is picked up again.
#[derive(Clone)]
pub struct PersistentCache {
    pool: Arc<ConnectionPool>,
}

impl PersistentCache {
    /// Cache backed by a database file (created on first use)
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        info!("Configuring L2 persistent cache at {}", path.display());

        Self {
            pool: Arc::new(ConnectionPool::new(Location::File(path))),
        }
    }

    /// Cache backed by a private in-memory database, for tests and single-process use
    pub fn in_memory() -> Self {
        Self {
            pool: Arc::new(ConnectionPool::new(Location::Memory)),
        }
    }

    /// Get a live entry; an expired one is deleted and reported as absent
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let lookup = key.to_string();
        let row = self
            .run(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM cache_entries WHERE key = ?1", SELECT_COLUMNS),
                    params![lookup],
                    StoredRow::from_row,
                )
                .optional()
            })
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        match row.decode() {
            Ok(entry) if entry.is_expired() => {
                debug!("L2 entry expired: {}", key);
                self.delete(key).await?;
                Ok(None)
            }
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!("Dropping undecodable L2 entry {}: {}", key, e);
                self.delete(key).await?;
                Ok(None)
            }
        }
    }

    /// Whether a live entry exists
    pub async fn contains_key(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        let now = Utc::now().timestamp_millis();
        self.run(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM cache_entries WHERE key = ?1 AND expires_at >= ?2)",
                params![key, now],
                |row| row.get::<_, bool>(0),
            )
        })
        .await
    }

    /// Insert or overwrite an entry
    pub async fn set(&self, entry: &CacheEntry) -> Result<()> {
        let value = serde_json::to_string(&entry.value)?;
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let key = entry.key.clone();
        let category = entry.category.as_str();
        let created_at = entry.created_at.timestamp_millis();
        let expires_at = entry.expires_at.timestamp_millis();
        let size_bytes = entry.size_bytes as i64;
        let resource_hash = entry.resource_hash().map(str::to_string);
        let settings_hash = entry.settings_hash().map(str::to_string);
        let schema_version = entry
            .metadata
            .as_ref()
            .and_then(EntryMetadata::schema_version)
            .map(str::to_string);

        self.run(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO cache_entries
                    (key, value, category, created_at, expires_at, size_bytes,
                     resource_hash, settings_hash, schema_version, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    key,
                    value,
                    category,
                    created_at,
                    expires_at,
                    size_bytes,
                    resource_hash,
                    settings_hash,
                    schema_version,
                    metadata
                ],
            )
        })
        .await?;

        debug!("Stored L2 entry: {}", entry.key);
        Ok(())
    }

    /// Remove a specific entry, returning whether it existed
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        let removed = self
            .run(move |conn| conn.execute("DELETE FROM cache_entries WHERE key = ?1", params![key]))
            .await?;
        Ok(removed > 0)
    }

    /// Remove every entry
    pub async fn clear(&self) -> Result<usize> {
        let removed = self
            .run(|conn| conn.execute("DELETE FROM cache_entries", []))
            .await?;
        info!("Cleared {} entries from L2", removed);
        Ok(removed)
    }

    /// Most recent live validation entry for a resource, whatever settings produced it
    pub async fn get_by_resource_hash(&self, resource_hash: &str) -> Result<Option<CacheEntry>> {
        let hash = resource_hash.to_string();
        let now = Utc::now().timestamp_millis();
        let row = self
            .run(move |conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM cache_entries
                         WHERE resource_hash = ?1 AND expires_at >= ?2
                         ORDER BY created_at DESC LIMIT 1",
                        SELECT_COLUMNS
                    ),
                    params![hash, now],
                    StoredRow::from_row,
                )
                .optional()
            })
            .await?;

        row.map(StoredRow::decode).transpose()
    }

    /// Delete every entry computed under the given settings hash
    pub async fn invalidate_by_settings_hash(&self, settings_hash: &str) -> Result<usize> {
        let hash = settings_hash.to_string();
        let removed = self
            .run(move |conn| {
                conn.execute(
                    "DELETE FROM cache_entries WHERE settings_hash = ?1",
                    params![hash],
                )
            })
            .await?;
        info!(
            "Invalidated {} L2 entries for settings hash {}",
            removed, settings_hash
        );
        Ok(removed)
    }

    /// Delete every entry whose expiry is in the past
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        let removed = self
            .run(move |conn| {
                conn.execute("DELETE FROM cache_entries WHERE expires_at < ?1", params![now])
            })
            .await?;
        if removed > 0 {
            debug!("Cleaned up {} expired L2 entries", removed);
        }
        Ok(removed)
    }

    /// Live entries of one category
    pub async fn get_entries_by_category(&self, category: Category) -> Result<Vec<CacheEntry>> {
        let category = category.as_str();
        let now = Utc::now().timestamp_millis();
        let rows = self
            .run(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM cache_entries
                     WHERE category = ?1 AND expires_at >= ?2
                     ORDER BY created_at",
                    SELECT_COLUMNS
                ))?;
                let rows = stmt.query_map(params![category, now], StoredRow::from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            match row.decode() {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping undecodable L2 row: {}", e),
            }
        }
        Ok(entries)
    }

    /// Delete every entry of a category
    pub async fn remove_category(&self, category: Category) -> Result<usize> {
        let category = category.as_str();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM cache_entries WHERE category = ?1",
                params![category],
            )
        })
        .await
    }

    /// Keys of all live entries
    pub async fn keys(&self) -> Result<Vec<CacheKey>> {
        let now = Utc::now().timestamp_millis();
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT key FROM cache_entries WHERE expires_at >= ?1 ORDER BY key")?;
            let keys = stmt.query_map(params![now], |row| row.get::<_, String>(0))?;
            keys.collect()
        })
        .await
    }

    /// Count and byte usage of live entries
    pub async fn usage(&self) -> Result<StoreUsage> {
        let now = Utc::now().timestamp_millis();
        let (entries, size_bytes) = self
            .run(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0)
                     FROM cache_entries WHERE expires_at >= ?1",
                    params![now],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )
            })
            .await?;

        Ok(StoreUsage {
            entries: usize::try_from(entries).unwrap_or(0),
            size_bytes: u64::try_from(size_bytes).unwrap_or(0),
        })
    }

    /// Run a statement on the blocking pool, opening the database if needed
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let permit = Arc::clone(&self.pool.permits)
            .acquire_owned()
            .await
            .map_err(|e| CacheError::unavailable(CacheLayer::L2, e))?;
        let pool = Arc::clone(&self.pool);

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let conn = pool.checkout()?;
            let result = op(&conn).map_err(|e| CacheError::unavailable(CacheLayer::L2, e));
            pool.checkin(conn);
            result
        })
        .await
        .map_err(|e| CacheError::unavailable(CacheLayer::L2, format!("task failed: {}", e)))?
    }
}

fn connect(location: &Location) -> Result<Connection> {
    let conn = match location {
        Location::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(open_failed)?;
            }
            Connection::open(path).map_err(open_failed)?
        }
        Location::Memory => Connection::open_in_memory().map_err(open_failed)?,
    };

    conn.busy_timeout(BUSY_TIMEOUT).map_err(open_failed)?;
    if let Location::File(path) = location {
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(open_failed)?;
        debug!("Opened L2 database {} (journal mode {})", path.display(), mode);
    }
    conn.execute_batch(SCHEMA).map_err(open_failed)?;

    Ok(conn)
}

fn open_failed(e: impl std::fmt::Display) -> CacheError {
    CacheError::unavailable(CacheLayer::L2, format!("open failed: {}", e))
}

fn from_millis(millis: i64) -> Result<chrono::DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| CacheError::Serialization(format!("invalid timestamp {}", millis)))
}
