//! Translation cache: content-addressed keys, the store interface, an
//! in-memory LRU tier with TTL, and a two-tier store (memory over SQLite).
//! Key: blake3 of (commentary | target language | example set id), each
//! field length-prefixed.
//!
//! Concurrent writers: last write wins for a key in every store.

use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

use super::fewshot::ExampleSetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Compute the key for one translation request.
    pub fn compute(commentary: &str, target_language: &str, example_set: &ExampleSetId) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"commentary/v1");
        for field in [commentary.as_bytes(), target_language.as_bytes()] {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field);
        }
        hasher.update(example_set.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
}

/// Storage behind the engine's cache lookups. Implementations must be safe
/// to share between workers.
pub trait CacheStore: Send + Sync {
    /// Returns `None` for absent or expired entries.
    fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError>;

    /// Like [`get`](CacheStore::get), also returning how long ago the entry
    /// was written. Stores that do not track age report zero.
    fn get_with_age(&self, key: &CacheKey) -> Result<Option<(String, Duration)>, CacheError> {
        Ok(self.get(key)?.map(|text| (text, Duration::ZERO)))
    }

    fn put(&self, key: &CacheKey, value: &str) -> Result<(), CacheError>;

    /// Drop expired entries, returning how many were removed.
    fn evict_expired(&self) -> Result<usize, CacheError>;

    fn clear(&self) -> Result<(), CacheError>;

    fn stats(&self) -> Result<CacheStats, CacheError>;

    /// Persist anything buffered. Called at the end of every batch.
    fn flush(&self) -> Result<(), CacheError> {
        Ok(())
    }
}

struct CacheEntry {
    translated_text: String,
    inserted_at: Instant,
    /// Age the entry already had when it was inserted here.
    prior_age: Duration,
}

impl CacheEntry {
    fn age(&self) -> Duration {
        self.prior_age.saturating_add(self.inserted_at.elapsed())
    }
}

/// In-memory LRU translation cache with optional TTL.
pub struct MemoryCache {
    inner: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: Option<Duration>,
}

impl MemoryCache {
    /// `ttl = None` keeps entries until they are pushed out by capacity.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
            )),
            ttl,
        }
    }

    fn is_expired(&self, entry: &CacheEntry) -> bool {
        self.ttl.map(|ttl| entry.age() > ttl).unwrap_or(false)
    }

    /// Insert an entry that was written `age` ago elsewhere. It expires
    /// `ttl - age` from now.
    pub fn put_with_age(&self, key: &CacheKey, value: &str, age: Duration) {
        self.inner.lock().put(
            *key,
            CacheEntry {
                translated_text: value.to_string(),
                inserted_at: Instant::now(),
                prior_age: age,
            },
        );
    }
}

impl CacheStore for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        Ok(self.get_with_age(key)?.map(|(text, _)| text))
    }

    fn get_with_age(&self, key: &CacheKey) -> Result<Option<(String, Duration)>, CacheError> {
        let mut cache = self.inner.lock();
        let expired = match cache.get(key) {
            Some(entry) if !self.is_expired(entry) => {
                return Ok(Some((entry.translated_text.clone(), entry.age())));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
        }
        Ok(None)
    }

    fn put(&self, key: &CacheKey, value: &str) -> Result<(), CacheError> {
        self.put_with_age(key, value, Duration::ZERO);
        Ok(())
    }

    fn evict_expired(&self) -> Result<usize, CacheError> {
        let mut cache = self.inner.lock();
        let expired: Vec<CacheKey> = cache
            .iter()
            .filter(|(_, entry)| self.is_expired(entry))
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        Ok(expired.len())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.inner.lock().clear();
        Ok(())
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        Ok(CacheStats {
            entries: self.inner.lock().len(),
        })
    }
}

/// Memory tier in front of a persistent tier. Reads that miss in memory and
/// hit the persistent tier are promoted with the age they already have, so
/// promotion never extends an entry's lifetime.
pub struct TieredCache {
    l1: MemoryCache,
    l2: Box<dyn CacheStore>,
}

impl TieredCache {
    pub fn new(l1: MemoryCache, l2: Box<dyn CacheStore>) -> Self {
        Self { l1, l2 }
    }
}

impl CacheStore for TieredCache {
    fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        Ok(self.get_with_age(key)?.map(|(text, _)| text))
    }

    fn get_with_age(&self, key: &CacheKey) -> Result<Option<(String, Duration)>, CacheError> {
        if let Some(hit) = self.l1.get_with_age(key)? {
            return Ok(Some(hit));
        }
        let hit = self.l2.get_with_age(key)?;
        if let Some((text, age)) = &hit {
            self.l1.put_with_age(key, text, *age);
        }
        Ok(hit)
    }

    fn put(&self, key: &CacheKey, value: &str) -> Result<(), CacheError> {
        self.l1.put(key, value)?;
        self.l2.put(key, value)
    }

    /// Returns the persistent tier's count. Memory entries mirror rows, so
    /// the persistent tier is the record of what expired.
    fn evict_expired(&self) -> Result<usize, CacheError> {
        self.l1.evict_expired()?;
        self.l2.evict_expired()
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.l1.clear()?;
        self.l2.clear()
    }

    fn stats(&self) -> Result<CacheStats, CacheError> {
        self.l2.stats()
    }

    fn flush(&self) -> Result<(), CacheError> {
        self.l2.flush()
    }
}
