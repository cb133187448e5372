//! Concurrent, cached commentary translation.
//!
//! Records of `{root, commentary}` go in; the same records come out with a
//! `commentary_translation`, in the same order. See [`engine`] for the
//! dispatch pipeline.

pub mod cancellation;
pub mod config;
pub mod engine;
pub mod metrics;
pub mod record;
pub mod retry;
pub mod scheduler;
pub mod translate;

pub use config::{CacheConfig, ConfigError, RetrySettings, TranslatorConfig};
pub use engine::{translate_commentaries, BatchReport, EngineBuilder, EngineError, TranslationEngine};
pub use record::{Record, TranslatedRecord};
pub use retry::{BackoffSchedule, Classify, ErrorClass, RetryError, RetryPolicy};
pub use scheduler::{SchedulerError, WorkScheduler};
pub use translate::cache::{CacheError, CacheKey, CacheStore, MemoryCache, TieredCache};
pub use translate::fewshot::ExampleSet;
pub use translate::sqlite_cache::SqliteCache;
pub use translate::{Prompt, ServiceError, StubClient, TranslationClient};

const DEFAULT_LOG_FILTER: &str = "commentary_translator=info";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Returns false if a subscriber was already installed.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);

    let installed = match format {
        LogFormat::Plain => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    };
    if installed {
        tracing::info!(?format, "commentary-translator logging initialised");
    }
    installed
}
