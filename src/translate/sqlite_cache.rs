//! Persistent translation cache backed by SQLite.
//! Lives at `<cache_dir>/translations.sqlite3`, keyed by the same blake3
//! digest as the memory tier, so translations survive across runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::cache::{CacheError, CacheKey, CacheStats, CacheStore};

pub const DB_FILE_NAME: &str = "translations.sqlite3";

/// SQLite-backed translation cache.
pub struct SqliteCache {
    conn: Mutex<Connection>,
    ttl: Option<Duration>,
    path: PathBuf,
}

impl SqliteCache {
    /// Open (or create) the cache database inside `cache_dir`.
    pub fn open_dir(cache_dir: &Path, ttl: Option<Duration>) -> Result<Self, CacheError> {
        std::fs::create_dir_all(cache_dir)?;
        Self::open(&cache_dir.join(DB_FILE_NAME), ttl)
    }

    /// Open (or create) the cache database at the given path.
    pub fn open(db_path: &Path, ttl: Option<Duration>) -> Result<Self, CacheError> {
        let conn = Connection::open(db_path)?;

        // WAL lets a second process read while this one writes
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS translation_cache (
                cache_key BLOB PRIMARY KEY,
                translated_text TEXT NOT NULL,
                created_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_created
                ON translation_cache(created_at_ms);",
        )?;

        info!(path = %db_path.display(), ttl_secs = ttl.map(|t| t.as_secs()), "SQLite cache opened");

        Ok(Self {
            conn: Mutex::new(conn),
            ttl,
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rows created before this instant (unix ms) are expired. `None` when
    /// nothing can expire, including a TTL reaching back before the epoch.
    fn cutoff_ms(&self) -> Option<i64> {
        let ttl_ms = i64::try_from(self.ttl?.as_millis()).ok()?;
        now_unix_ms().checked_sub(ttl_ms).filter(|cutoff| *cutoff > 0)
    }

    pub(crate) fn put_at(&self, key: &CacheKey, value: &str, created_at_ms: i64) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO translation_cache
             (cache_key, translated_text, created_at_ms)
             VALUES (?1, ?2, ?3)",
            params![key.as_bytes().as_slice(), value, created_at_ms],
        )?;
        Ok(())
    }
}

impl CacheStore for SqliteCache {
    fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        Ok(self.get_with_age(key)?.map(|(text, _)| text))
    }

    fn get_with_age(&self, key: &CacheKey) -> Result<Option<(String, Duration)>, CacheError> {
        let conn = self.conn.lock();
        let row: Option<(String, i64)> = conn
            .query_row(
                "SELECT translated_text, created_at_ms FROM translation_cache
                 WHERE cache_key = ?1",
                params![key.as_bytes().as_slice()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match (row, self.cutoff_ms()) {
            (Some((_, created_at)), Some(cutoff)) if created_at < cutoff => {
                conn.execute(
                    "DELETE FROM translation_cache WHERE cache_key = ?1",
                    params![key.as_bytes().as_slice()],
                )?;
                debug!(%key, "SQLite cache entry expired");
                Ok(None)
            }
            (Some((text, created_at)), _) => {
                let age_ms = u64::try_from(now_unix_ms().saturating_sub(created_at)).unwrap_or(0);
                Ok(Some((text, Duration::from_millis(age_ms))))
            }
            (None, _) => Ok(None),
        }
    }

    fn put(&self, key: &CacheKey, value: &str) -> Result<(), CacheError> {
        self.put_at(key, value, now_unix_ms())
    }

    fn evict_expired(&self) -> Result<usize, CacheError> {
        let Some(cutoff) = self.cutoff_ms() else {
            return Ok(0);
        };
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM translation_cache WHERE created_at_ms < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            info!(removed, "SQLite cache cleanup");
        }
        Ok(removed)
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.conn.lock().execute("DELETE FROM translation_cache", [])?;
        Ok(())
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        let conn = self.conn.lock();
        let entries: i64 =
            conn.query_row("SELECT COUNT(*) FROM translation_cache", [], |row| row.get(0))?;
        Ok(CacheStats {
            entries: entries as usize,
        })
    }

    fn flush(&self) -> Result<(), CacheError> {
        let conn = self.conn.lock();
        conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        Ok(())
    }
}

/// Current time as Unix timestamp (milliseconds).
pub(crate) fn now_unix_ms() -> i64 {
    let since_epoch = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(since_epoch.as_millis()).unwrap_or(i64::MAX)
}
