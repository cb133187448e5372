//! Translation dispatch engine.
//!
//! One batch goes through four stages:
//! 1. records with an empty commentary are answered with an empty translation;
//! 2. every other record is keyed and probed in the cache, and misses sharing
//!    a key are folded into one job;
//! 3. jobs run on the [`WorkScheduler`], each through the [`RetryPolicy`] and
//!    the client, writing its translation to the cache as soon as it arrives;
//! 4. empty, cached and fresh translations are merged back by index.
//!
//! Any job that fails for good fails the whole batch; no partial output is
//! returned.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{CacheConfig, ConfigError, TranslatorConfig};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::record::{Record, TranslatedRecord};
use crate::retry::{RetryError, RetryPolicy};
use crate::scheduler::{SchedulerError, WorkScheduler};
use crate::translate::anthropic::AnthropicClient;
use crate::translate::cache::{CacheError, CacheKey, CacheStore};
use crate::translate::fewshot::ExampleSet;
use crate::translate::{Prompt, ServiceError, TranslationClient};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("target language must not be empty")]
    EmptyTargetLanguage,

    #[error("translation of record {index} failed: {source}")]
    TranslationFailed {
        index: usize,
        #[source]
        source: RetryError<ServiceError>,
    },

    #[error("translation worker panicked: {0}")]
    WorkerPanicked(String),

    #[error("batch cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("could not build translation client: {0}")]
    Client(ServiceError),
}

/// Where each record's translation came from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    /// Records with an empty commentary.
    pub empty: usize,
    pub cache_hits: usize,
    /// Records answered by another record's job in the same batch.
    pub coalesced: usize,
    /// Jobs sent to the client.
    pub dispatched: usize,
    pub elapsed: Duration,
}

/// One unit of work for the scheduler. `positions` lists every record index
/// that asked for this key.
struct Job {
    positions: Vec<usize>,
    root: String,
    commentary: String,
    key: CacheKey,
}

pub struct EngineBuilder {
    client: Arc<dyn TranslationClient>,
    cache: Option<Arc<dyn CacheStore>>,
    retry: RetryPolicy,
    request_timeout: Duration,
    cancel: Option<CancellationToken>,
}

impl EngineBuilder {
    pub fn new(client: Arc<dyn TranslationClient>) -> Self {
        Self {
            client,
            cache: None,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(120),
            cancel: None,
        }
    }

    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(store);
        self
    }

    /// Open the configured cache. A cache that cannot be opened is logged
    /// and the engine runs uncached.
    pub fn cache_config(mut self, config: &CacheConfig) -> Self {
        self.cache = match config.open() {
            Ok(store) => store,
            Err(e) => {
                warn!(error = %e, dir = %config.cache_dir.display(), "cache unavailable, continuing without it");
                None
            }
        };
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Upper bound for a single client call.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Cancelling `token` stops dispatch of new jobs.
    pub fn cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn build(self) -> TranslationEngine {
        TranslationEngine {
            client: self.client,
            cache: self.cache,
            retry: self.retry,
            request_timeout: self.request_timeout,
            cancel: self.cancel,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }
}

pub struct TranslationEngine {
    client: Arc<dyn TranslationClient>,
    cache: Option<Arc<dyn CacheStore>>,
    retry: RetryPolicy,
    request_timeout: Duration,
    cancel: Option<CancellationToken>,
    metrics: Arc<MetricsRegistry>,
}

impl TranslationEngine {
    pub fn builder(client: Arc<dyn TranslationClient>) -> EngineBuilder {
        EngineBuilder::new(client)
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn cache(&self) -> Option<&Arc<dyn CacheStore>> {
        self.cache.as_ref()
    }

    /// Translate the commentary of every record into `target_language`.
    /// Output has one entry per input record, in input order.
    pub async fn translate_batch(
        &self,
        records: &[Record],
        target_language: &str,
        examples: &ExampleSet,
        concurrency: usize,
    ) -> Result<Vec<TranslatedRecord>, EngineError> {
        self.translate_batch_with_report(records, target_language, examples, concurrency)
            .await
            .map(|(translated, _)| translated)
    }

    pub async fn translate_batch_with_report(
        &self,
        records: &[Record],
        target_language: &str,
        examples: &ExampleSet,
        concurrency: usize,
    ) -> Result<(Vec<TranslatedRecord>, BatchReport), EngineError> {
        if concurrency == 0 {
            return Err(EngineError::InvalidConcurrency);
        }
        if target_language.trim().is_empty() {
            return Err(EngineError::EmptyTargetLanguage);
        }
        if records.is_empty() {
            return Ok((Vec::new(), BatchReport::default()));
        }

        let batch_id = Uuid::new_v4();
        let span = info_span!(
            "translate_batch",
            %batch_id,
            records = records.len(),
            target_language,
            concurrency,
            examples = %examples.id(),
        );
        self.run_batch(records, target_language, examples, concurrency)
            .instrument(span)
            .await
    }

    async fn run_batch(
        &self,
        records: &[Record],
        target_language: &str,
        examples: &ExampleSet,
        concurrency: usize,
    ) -> Result<(Vec<TranslatedRecord>, BatchReport), EngineError> {
        let batch_timer = self.metrics.timer(metric_names::BATCH);
        let example_id = examples.id();

        let mut report = BatchReport {
            total: records.len(),
            ..BatchReport::default()
        };
        let mut translations: Vec<Option<String>> = vec![None; records.len()];
        let mut jobs: Vec<Job> = Vec::new();
        let mut job_for_key: HashMap<CacheKey, usize> = HashMap::new();

        for (index, record) in records.iter().enumerate() {
            if !record.has_commentary() {
                translations[index] = Some(String::new());
                report.empty += 1;
                continue;
            }

            let key = CacheKey::compute(&record.commentary, target_language, &example_id);
            if let Some(&job) = job_for_key.get(&key) {
                jobs[job].positions.push(index);
                report.coalesced += 1;
                continue;
            }
            if let Some(hit) = self.cache_get(key).await {
                translations[index] = Some(hit);
                report.cache_hits += 1;
                continue;
            }

            job_for_key.insert(key, jobs.len());
            jobs.push(Job {
                positions: vec![index],
                root: record.root.clone(),
                commentary: record.commentary.clone(),
                key,
            });
        }
        report.dispatched = jobs.len();

        self.metrics.incr(metric_names::EMPTY_SKIPPED, report.empty as u64);
        self.metrics.incr(metric_names::COALESCED, report.coalesced as u64);
        if self.cache.is_some() {
            self.metrics.incr(metric_names::CACHE_HIT, report.cache_hits as u64);
            self.metrics.incr(metric_names::CACHE_MISS, report.dispatched as u64);
        }
        debug!(
            empty = report.empty,
            cache_hits = report.cache_hits,
            coalesced = report.coalesced,
            dispatched = report.dispatched,
            "batch partitioned"
        );

        let outcome = if jobs.is_empty() {
            Ok(Vec::new())
        } else {
            let worker_ctx = Arc::new(JobContext {
                client: Arc::clone(&self.client),
                cache: self.cache.clone(),
                retry: self.retry.clone(),
                request_timeout: self.request_timeout,
                metrics: Arc::clone(&self.metrics),
                examples: examples.clone(),
                target_language: target_language.to_string(),
            });

            let mut scheduler = WorkScheduler::new(concurrency);
            if let Some(token) = &self.cancel {
                scheduler = scheduler.with_parent(token.clone());
            }
            scheduler
                .run(jobs, move |_, job| {
                    let ctx = Arc::clone(&worker_ctx);
                    async move { ctx.run(job).await }
                })
                .await
        };

        self.maintain_cache().await;

        let finished = outcome.map_err(|e| match e {
            SchedulerError::JobFailed {
                source: (index, source),
                ..
            } => EngineError::TranslationFailed { index, source },
            SchedulerError::WorkerPanicked(message) => EngineError::WorkerPanicked(message),
            SchedulerError::Cancelled => EngineError::Cancelled,
        })?;

        for (positions, text) in finished {
            for position in positions {
                translations[position] = Some(text.clone());
            }
        }

        let translated: Vec<TranslatedRecord> = records
            .iter()
            .zip(translations)
            .map(|(record, translation)| {
                debug_assert!(translation.is_some(), "every index is filled by one stage");
                TranslatedRecord::from_record(record.clone(), translation.unwrap_or_default())
            })
            .collect();

        report.elapsed = batch_timer.finish();
        info!(
            total = report.total,
            empty = report.empty,
            cache_hits = report.cache_hits,
            coalesced = report.coalesced,
            dispatched = report.dispatched,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "batch translated"
        );

        Ok((translated, report))
    }

    /// Cache errors read as a miss.
    async fn cache_get(&self, key: CacheKey) -> Option<String> {
        let cache = self.cache.as_ref()?;
        match on_blocking_pool(cache, move |store| store.get(&key)).await {
            Ok(hit) => hit,
            Err(e) => {
                self.metrics.incr(metric_names::CACHE_ERROR, 1);
                warn!(error = %e, %key, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn maintain_cache(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        match on_blocking_pool(cache, |store| store.evict_expired()).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "expired cache entries evicted"),
            Err(e) => {
                self.metrics.incr(metric_names::CACHE_ERROR, 1);
                warn!(error = %e, "cache eviction failed");
            }
        }
        if let Err(e) = on_blocking_pool(cache, |store| store.flush()).await {
            self.metrics.incr(metric_names::CACHE_ERROR, 1);
            warn!(error = %e, "cache flush failed");
        }
    }
}

/// Everything a worker needs, shared by all jobs of one batch.
struct JobContext {
    client: Arc<dyn TranslationClient>,
    cache: Option<Arc<dyn CacheStore>>,
    retry: RetryPolicy,
    request_timeout: Duration,
    metrics: Arc<MetricsRegistry>,
    examples: ExampleSet,
    target_language: String,
}

impl JobContext {
    /// Translate one job. Errors carry the first record index of the job.
    async fn run(&self, job: Job) -> Result<(Vec<usize>, String), (usize, RetryError<ServiceError>)> {
        let index = job.positions[0];
        let prompt = Prompt::for_record(
            self.examples.turns(),
            &job.root,
            &job.commentary,
            &self.target_language,
        );

        let attempts = AtomicU32::new(0);
        let result = self
            .retry
            .execute(|| {
                attempts.fetch_add(1, Ordering::Relaxed);
                self.call_once(&prompt)
            })
            .await;

        let attempts = attempts.load(Ordering::Relaxed);
        self.metrics
            .incr(metric_names::RETRIES, u64::from(attempts.saturating_sub(1)));

        match result {
            Ok(text) => {
                self.cache_put(job.key, &text).await;
                debug!(index, attempts, shared_with = job.positions.len() - 1, "record translated");
                Ok((job.positions, text))
            }
            Err(e) => Err((index, e)),
        }
    }

    async fn call_once(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        self.metrics.incr(metric_names::SERVICE_CALLS, 1);
        let timer = self.metrics.timer(metric_names::SERVICE_CALL);

        let result = match tokio::time::timeout(self.request_timeout, self.client.translate(prompt)).await {
            Ok(result) => result,
            Err(_) => Err(ServiceError::Timeout(self.request_timeout)),
        };
        timer.finish();

        match result {
            Ok(text) if text.trim().is_empty() => Err(ServiceError::MalformedResponse(format!(
                "{} returned an empty translation",
                self.client.name()
            ))),
            other => other,
        }
    }

    /// Write failures are logged and skipped.
    async fn cache_put(&self, key: CacheKey, text: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        let value = text.to_string();
        if let Err(e) = on_blocking_pool(cache, move |store| store.put(&key, &value)).await {
            self.metrics.incr(metric_names::CACHE_ERROR, 1);
            warn!(error = %e, %key, "cache write failed");
        }
    }
}

/// Run a store operation on Tokio's blocking pool. Stores do disk I/O and
/// hold locks, which must not stall the workers' executor threads.
async fn on_blocking_pool<T, F>(cache: &Arc<dyn CacheStore>, op: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce(&dyn CacheStore) -> Result<T, CacheError> + Send + 'static,
{
    let store = Arc::clone(cache);
    match tokio::task::spawn_blocking(move || op(store.as_ref())).await {
        Ok(result) => result,
        Err(e) => Err(CacheError::Task(e.to_string())),
    }
}

/// Translate with the Anthropic client built from `config`.
/// `examples = None` uses the bundled examples for `target_language`.
pub async fn translate_commentaries(
    records: &[Record],
    target_language: &str,
    examples: Option<&ExampleSet>,
    config: &TranslatorConfig,
) -> Result<Vec<TranslatedRecord>, EngineError> {
    let client = AnthropicClient::new(config.anthropic_settings()?).map_err(EngineError::Client)?;
    let engine = TranslationEngine::builder(Arc::new(client))
        .cache_config(&config.cache)
        .retry_policy(config.retry.policy())
        .request_timeout(config.request_timeout)
        .build();

    let defaults;
    let examples = match examples {
        Some(examples) => examples,
        None => {
            defaults = ExampleSet::defaults_for(target_language);
            &defaults
        }
    };
    engine
        .translate_batch(records, target_language, examples, config.num_threads)
        .await
}
