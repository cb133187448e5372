//! Retry policy: bounded attempts with a non-decreasing backoff for
//! retryable failures. Fatal failures return on the attempt they occur.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// How the policy treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Fatal,
}

/// Error types the policy can classify without an explicit classifier.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Server-provided lower bound for the next delay.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Clone)]
enum ScheduleKind {
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
    Fixed(Duration),
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

/// Delay before the n-th retry (n starts at 0).
#[derive(Clone)]
pub struct BackoffSchedule {
    kind: ScheduleKind,
}

impl BackoffSchedule {
    /// `base * 2^n` with up to 50% multiplicative jitter, capped at `max`.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            kind: ScheduleKind::Exponential {
                base,
                max: max.max(base),
                jitter: true,
            },
        }
    }

    pub fn without_jitter(self) -> Self {
        match self.kind {
            ScheduleKind::Exponential { base, max, .. } => Self {
                kind: ScheduleKind::Exponential {
                    base,
                    max,
                    jitter: false,
                },
            },
            other => Self { kind: other },
        }
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: ScheduleKind::Fixed(delay),
        }
    }

    /// Caller-supplied schedule. The policy still never lets the delay drop
    /// below the previous one.
    pub fn custom(f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self {
            kind: ScheduleKind::Custom(Arc::new(f)),
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        let jitter_factor = match self.kind {
            ScheduleKind::Exponential { jitter: true, .. } => rand::thread_rng().gen_range(0.0..1.0),
            _ => 0.0,
        };
        self.delay_with_jitter(retry, jitter_factor)
    }

    /// Deterministic form of [`delay`](Self::delay); `jitter_factor` is
    /// clamped to `[0, 1)`.
    pub fn delay_with_jitter(&self, retry: u32, jitter_factor: f64) -> Duration {
        match &self.kind {
            ScheduleKind::Exponential { base, max, jitter } => {
                let base_ms = base.as_millis() as f64;
                let max_ms = max.as_millis() as f64;
                let exponential = base_ms * 2_f64.powi(retry.min(62) as i32);
                let factor = if *jitter {
                    1.0 + 0.5 * jitter_factor.clamp(0.0, 0.999_999)
                } else {
                    1.0
                };
                Duration::from_millis((exponential * factor).min(max_ms) as u64)
            }
            ScheduleKind::Fixed(delay) => *delay,
            ScheduleKind::Custom(f) => f(retry),
        }
    }
}

impl fmt::Debug for BackoffSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ScheduleKind::Exponential { base, max, jitter } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            ScheduleKind::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            ScheduleKind::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: E,
    },
    #[error("fatal error on attempt {attempt}: {error}")]
    Fatal {
        attempt: u32,
        #[source]
        error: E,
    },
}

impl<E> RetryError<E> {
    /// The error from the final attempt.
    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }

    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RetryError::Fatal { .. })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    schedule: BackoffSchedule,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            BackoffSchedule::exponential(Duration::from_secs(2), Duration::from_secs(60)),
        )
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first call; values below 1 are raised to 1.
    pub fn new(max_attempts: u32, schedule: BackoffSchedule) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            schedule,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(1, BackoffSchedule::fixed(Duration::ZERO))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn schedule(&self) -> &BackoffSchedule {
        &self.schedule
    }

    /// Run `op` until it succeeds, fails fatally, or attempts run out,
    /// classifying errors through [`Classify`].
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        E: Classify + fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(op, |e: &E| (e.class(), e.retry_after())).await
    }

    /// Like [`execute`](Self::execute) with an explicit classifier.
    pub async fn execute_with<T, E, F, Fut, C>(&self, op: F, classify: C) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        self.run(op, |e: &E| (classify(e), None)).await
    }

    async fn run<T, E, F, Fut, C>(&self, mut op: F, classify: C) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> (ErrorClass, Option<Duration>),
    {
        let mut attempt: u32 = 0;
        let mut last_delay = Duration::ZERO;

        loop {
            attempt += 1;
            let error = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            let (class, hint) = classify(&error);
            if class == ErrorClass::Fatal {
                warn!(attempt, error = %error, "fatal error, not retrying");
                return Err(RetryError::Fatal { attempt, error });
            }
            if attempt >= self.max_attempts {
                warn!(attempts = attempt, error = %error, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: error,
                });
            }

            let mut delay = self.schedule.delay(attempt - 1).max(last_delay);
            if let Some(hint) = hint {
                delay = delay.max(hint);
            }
            last_delay = delay;

            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "retryable error, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
