//! Translation backend interface.
//! A client turns one prompt into translated text or a classified failure;
//! retry, caching and scheduling live above this layer.

pub mod anthropic;
pub mod cache;
pub mod fewshot;
pub mod prompt;
pub mod sqlite_cache;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::retry::{Classify, ErrorClass};
pub use prompt::{Prompt, PromptTurn, Role};

/// Translator trait (adapter for different backends).
#[async_trait]
pub trait TranslationClient: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &str;

    async fn translate(&self, prompt: &Prompt) -> Result<String, ServiceError>;
}

/// Failure reported by a translation backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("rate limited{}", fmt_retry_after(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
}

fn fmt_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

impl Classify for ServiceError {
    fn class(&self) -> ErrorClass {
        match self {
            ServiceError::RateLimited { .. }
            | ServiceError::Network(_)
            | ServiceError::Timeout(_)
            | ServiceError::Server { .. }
            | ServiceError::MalformedResponse(_) => ErrorClass::Retryable,
            ServiceError::Authentication(_)
            | ServiceError::InvalidRequest(_)
            | ServiceError::QuotaExceeded(_) => ErrorClass::Fatal,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ServiceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Offline client answering from a fixed commentary → translation table.
/// Commentaries missing from the table come back as `[stub] <commentary>`.
pub struct StubClient {
    table: HashMap<String, String>,
}

impl StubClient {
    pub fn new() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn with_entry(mut self, commentary: impl Into<String>, translation: impl Into<String>) -> Self {
        self.table.insert(commentary.into(), translation.into());
        self
    }
}

impl Default for StubClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TranslationClient for StubClient {
    fn name(&self) -> &str {
        "stub"
    }

    async fn translate(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        let commentary = prompt.commentary();
        Ok(self
            .table
            .get(commentary)
            .cloned()
            .unwrap_or_else(|| format!("[stub] {commentary}")))
    }
}
