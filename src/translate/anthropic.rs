//! Anthropic Messages API client.
//! Connection pooling via reqwest and a simple token-bucket rate limiter.
//! Retries happen one layer up; this client only classifies each failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use super::{Prompt, ServiceError, TranslationClient};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-opus-20240229";
pub const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct AnthropicSettings {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Transport timeout for one request.
    pub timeout: Duration,
    /// Minimum interval between requests (e.g. 100ms = 10 req/s).
    pub min_interval: Duration,
}

impl AnthropicSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: 4096,
            temperature: 0.2,
            timeout: Duration::from_secs(120),
            min_interval: Duration::from_millis(100),
        }
    }
}

pub struct AnthropicClient {
    http: reqwest::Client,
    settings: AnthropicSettings,
    /// Simple token-bucket: tracks the next allowed request time.
    next_allowed: Arc<tokio::sync::Mutex<Instant>>,
}

impl AnthropicClient {
    pub fn new(settings: AnthropicSettings) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(settings.timeout)
            .build()
            .map_err(|e| ServiceError::InvalidRequest(format!("http client: {e}")))?;

        Ok(Self {
            http,
            settings,
            next_allowed: Arc::new(tokio::sync::Mutex::new(Instant::now())),
        })
    }

    pub fn settings(&self) -> &AnthropicSettings {
        &self.settings
    }

    /// Wait until the rate limiter allows a request.
    async fn rate_limit_wait(&self) {
        let mut next = self.next_allowed.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep(*next - now).await;
        }
        *next = Instant::now() + self.settings.min_interval;
    }

    fn request_body(&self, prompt: &Prompt) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = prompt
            .turns
            .iter()
            .map(|turn| serde_json::json!({ "role": turn.role, "content": turn.text }))
            .collect();

        serde_json::json!({
            "model": self.settings.model,
            "system": prompt.system,
            "messages": messages,
            "max_tokens": self.settings.max_tokens,
            "temperature": self.settings.temperature,
        })
    }
}

#[async_trait]
impl TranslationClient for AnthropicClient {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn translate(&self, prompt: &Prompt) -> Result<String, ServiceError> {
        self.rate_limit_wait().await;

        let body = self.request_body(prompt);
        let result = self
            .http
            .post(format!("{}/v1/messages", self.settings.base_url))
            .header("x-api-key", &self.settings.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await;

        let response = match result {
            Ok(resp) => resp,
            Err(e) if e.is_timeout() => return Err(ServiceError::Timeout(self.settings.timeout)),
            Err(e) => return Err(ServiceError::Network(e.to_string())),
        };

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if e.is_timeout() => return Err(ServiceError::Timeout(self.settings.timeout)),
            Err(e) => return Err(ServiceError::Network(e.to_string())),
        };

        if (200..300).contains(&status) {
            debug!(status, bytes = text.len(), "anthropic response");
            parse_response(&text)
        } else {
            Err(classify_status(status, retry_after, &text))
        }
    }
}

/// `retry-after` in whole seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Map a non-2xx response to a classified error.
pub fn classify_status(status: u16, retry_after: Option<Duration>, body: &str) -> ServiceError {
    let message = error_message(body);
    match status {
        429 => ServiceError::RateLimited { retry_after },
        401 | 403 => ServiceError::Authentication(message),
        402 => ServiceError::QuotaExceeded(message),
        400 if message.to_ascii_lowercase().contains("credit balance") => {
            ServiceError::QuotaExceeded(message)
        }
        500..=599 => ServiceError::Server { status, message },
        _ => ServiceError::InvalidRequest(format!("status {status}: {message}")),
    }
}

/// Text of the first text block of a Messages API reply.
pub fn parse_response(body: &str) -> Result<String, ServiceError> {
    let parsed: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| ServiceError::MalformedResponse(format!("undecodable body: {e}")))?;

    parsed
        .content
        .into_iter()
        .find(|block| block.kind == "text")
        .and_then(|block| block.text)
        .ok_or_else(|| ServiceError::MalformedResponse("no text block in response".into()))
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) => body.chars().take(200).collect(),
    }
}

// --- Response types ---

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}
