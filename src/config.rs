//! Runtime configuration from the environment (and `.env`).
//! Every setting has a default except the API key, which only the HTTP
//! client needs.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::retry::{BackoffSchedule, RetryPolicy};
use crate::translate::anthropic::{AnthropicSettings, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::translate::cache::{CacheError, CacheStore, MemoryCache, TieredCache};
use crate::translate::sqlite_cache::SqliteCache;

pub const ENV_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ENV_NUM_THREADS: &str = "TRANSLATOR_NUM_THREADS";
pub const ENV_USE_CACHE: &str = "TRANSLATOR_USE_CACHE";
pub const ENV_CACHE_DIR: &str = "TRANSLATOR_CACHE_DIR";
pub const ENV_CACHE_TTL_SECS: &str = "TRANSLATOR_CACHE_TTL_SECS";
pub const ENV_CACHE_CAPACITY: &str = "TRANSLATOR_CACHE_CAPACITY";
pub const ENV_MAX_ATTEMPTS: &str = "TRANSLATOR_MAX_ATTEMPTS";
pub const ENV_RETRY_BASE_MS: &str = "TRANSLATOR_RETRY_BASE_MS";
pub const ENV_RETRY_MAX_MS: &str = "TRANSLATOR_RETRY_MAX_MS";
pub const ENV_REQUEST_TIMEOUT_SECS: &str = "TRANSLATOR_REQUEST_TIMEOUT_SECS";
pub const ENV_MODEL: &str = "TRANSLATOR_MODEL";
pub const ENV_BASE_URL: &str = "TRANSLATOR_BASE_URL";

pub const DEFAULT_CACHE_DIR: &str = "./translation_cache";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ANTHROPIC_API_KEY is not set")]
    MissingApiKey,
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub use_cache: bool,
    pub cache_dir: PathBuf,
    /// `None` keeps entries forever.
    pub cache_ttl: Option<Duration>,
    /// Entries held by the in-memory tier.
    pub memory_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            use_cache: true,
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            cache_ttl: None,
            memory_capacity: 1024,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        Self {
            use_cache: false,
            ..Self::default()
        }
    }

    /// Open the memory-over-SQLite store, or `None` when caching is off.
    pub fn open(&self) -> Result<Option<Arc<dyn CacheStore>>, CacheError> {
        if !self.use_cache {
            debug!("translation cache disabled");
            return Ok(None);
        }
        let l2 = SqliteCache::open_dir(&self.cache_dir, self.cache_ttl)?;
        let l1 = MemoryCache::new(self.memory_capacity, self.cache_ttl);
        Ok(Some(Arc::new(TieredCache::new(l1, Box::new(l2)))))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySettings {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            BackoffSchedule::exponential(self.base_delay, self.max_delay),
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranslatorConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub num_threads: usize,
    pub request_timeout: Duration,
    pub cache: CacheConfig,
    pub retry: RetrySettings,
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            num_threads: 4,
            request_timeout: Duration::from_secs(120),
            cache: CacheConfig::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl TranslatorConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        match dotenv::dotenv() {
            Ok(path) => info!(path = %path.display(), "loaded .env"),
            Err(e) => debug!(error = %e, "no .env loaded"),
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let num_threads = parse_or(&get, ENV_NUM_THREADS, defaults.num_threads)?;
        if num_threads == 0 {
            return Err(invalid(ENV_NUM_THREADS, "0"));
        }
        let max_attempts = parse_or(&get, ENV_MAX_ATTEMPTS, defaults.retry.max_attempts)?;
        if max_attempts == 0 {
            return Err(invalid(ENV_MAX_ATTEMPTS, "0"));
        }

        let use_cache = match get(ENV_USE_CACHE) {
            Some(raw) => parse_bool(&raw).ok_or_else(|| invalid(ENV_USE_CACHE, &raw))?,
            None => defaults.cache.use_cache,
        };
        let cache_ttl = match get(ENV_CACHE_TTL_SECS) {
            Some(raw) => Some(Duration::from_secs(
                raw.parse::<u64>().map_err(|_| invalid(ENV_CACHE_TTL_SECS, &raw))?,
            )),
            None => None,
        };

        let base_ms = parse_or(&get, ENV_RETRY_BASE_MS, defaults.retry.base_delay.as_millis() as u64)?;
        let max_ms = parse_or(&get, ENV_RETRY_MAX_MS, defaults.retry.max_delay.as_millis() as u64)?;
        let timeout_secs = parse_or(
            &get,
            ENV_REQUEST_TIMEOUT_SECS,
            defaults.request_timeout.as_secs(),
        )?;

        Ok(Self {
            api_key: get(ENV_API_KEY),
            model: get(ENV_MODEL).unwrap_or(defaults.model),
            base_url: get(ENV_BASE_URL)
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            num_threads,
            request_timeout: Duration::from_secs(timeout_secs),
            cache: CacheConfig {
                use_cache,
                cache_dir: get(ENV_CACHE_DIR)
                    .map(PathBuf::from)
                    .unwrap_or(defaults.cache.cache_dir),
                cache_ttl,
                memory_capacity: parse_or(&get, ENV_CACHE_CAPACITY, defaults.cache.memory_capacity)?,
            },
            retry: RetrySettings {
                max_attempts,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(max_ms),
            },
        })
    }

    /// Client settings; fails when no API key is configured.
    pub fn anthropic_settings(&self) -> Result<AnthropicSettings, ConfigError> {
        let api_key = self.api_key.clone().ok_or(ConfigError::MissingApiKey)?;
        let mut settings = AnthropicSettings::new(api_key);
        settings.model = self.model.clone();
        settings.base_url = self.base_url.clone();
        settings.timeout = self.request_timeout;
        Ok(settings)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse::<T>().map_err(|_| invalid(key, &raw)),
        None => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
