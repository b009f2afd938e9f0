//! Bounded retry with a fixed backoff.
//!
//! Every failed attempt is logged at `warn` with the elapsed time. After
//! [`RetryConfig::max_retries`] extra attempts the last failure is returned
//! (or, for the fallback variants, replaced by the fallback value and logged
//! at `error`). The async variants accept a [`CancellationToken`] which is
//! honoured before each attempt and during the backoff sleep.
//!
//! The blocking variants share the same policy for synchronous callers.

use std::{
    fmt::Display,
    future::Future,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default fixed delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Retry policy: `max_retries` extra attempts separated by a fixed `delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Number of attempts after the first one.
    #[serde(default = "default_max_retries")]
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Pause between attempts.
    #[serde(with = "humantime_serde", default = "default_delay")]
    #[builder(default = DEFAULT_RETRY_DELAY)]
    pub delay: Duration,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_delay() -> Duration {
    DEFAULT_RETRY_DELAY
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: DEFAULT_MAX_RETRIES, delay: DEFAULT_RETRY_DELAY }
    }
}

impl RetryConfig {
    /// Total attempts including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Outcome of a retried operation that did not succeed.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The cancellation token fired before or between attempts.
    #[error("operation cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Attempts made before cancellation.
        attempts: u32,
    },

    /// Every attempt failed; `source` is the last failure.
    #[error("operation failed after {attempts} attempt(s): {source}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The final error.
        #[source]
        source: E,
    },

    /// The retry predicate refused to retry this failure.
    #[error("operation failed with a non-retryable error: {source}")]
    Rejected {
        /// Attempts made.
        attempts: u32,
        /// The error that was not retried.
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// Number of attempts made before giving up.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Cancelled { attempts }
            | Self::Exhausted { attempts, .. }
            | Self::Rejected { attempts, .. } => *attempts,
        }
    }

    /// The underlying operation error, if there is one.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Cancelled { .. } => None,
            Self::Exhausted { source, .. } | Self::Rejected { source, .. } => Some(source),
        }
    }
}

impl From<RetryError<StorageError>> for StorageError {
    fn from(err: RetryError<StorageError>) -> Self {
        match err {
            RetryError::Cancelled { .. } => StorageError::Cancelled,
            RetryError::Exhausted { source, .. } | RetryError::Rejected { source, .. } => source,
        }
    }
}

/// Runs `operation`, retrying every failure.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last failure when all attempts
/// fail, or [`RetryError::Cancelled`] when `cancel` fires.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: Option<&CancellationToken>,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    with_retry_if(config, operation_name, cancel, |_| true, operation).await
}

/// Runs `operation`, retrying only failures accepted by `should_retry`.
///
/// # Errors
///
/// As [`with_retry`], plus [`RetryError::Rejected`] for a failure the
/// predicate refused.
#[tracing::instrument(
    skip(config, cancel, should_retry, operation),
    fields(max_attempts = config.max_attempts())
)]
pub async fn with_retry_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: Option<&CancellationToken>,
    should_retry: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(RetryError::Cancelled { attempts: attempt });
        }

        attempt += 1;
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        "operation succeeded after retry"
                    );
                }
                return Ok(value);
            },
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(RetryError::Rejected { attempts: attempt, source: err });
        }

        tracing::warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %err,
            "execution failed",
        );

        if attempt >= config.max_attempts() {
            return Err(RetryError::Exhausted { attempts: attempt, source: err });
        }

        match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        return Err(RetryError::Cancelled { attempts: attempt });
                    },
                    () = tokio::time::sleep(config.delay) => {},
                }
            },
            None => tokio::time::sleep(config.delay).await,
        }
    }
}

/// Runs `operation` under the retry policy and returns `fallback` instead of
/// failing once attempts are exhausted or cancelled.
pub async fn with_fallback<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: Option<&CancellationToken>,
    fallback: T,
    operation: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    match with_retry(config, operation_name, cancel, operation).await {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(operation = operation_name, error = %err, "returning fallback value");
            fallback
        },
    }
}

/// Blocking counterpart of [`with_retry`]. Sleeps the current thread between
/// attempts.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] with the last failure when all attempts
/// fail.
pub fn with_retry_blocking<F, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
{
    with_retry_blocking_if(config, operation_name, |_| true, operation)
}

/// Blocking counterpart of [`with_retry_if`].
///
/// # Errors
///
/// As [`with_retry_blocking`], plus [`RetryError::Rejected`] for a failure
/// the predicate refused.
pub fn with_retry_blocking_if<F, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Result<T, E>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match operation() {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !should_retry(&err) {
            return Err(RetryError::Rejected { attempts: attempt, source: err });
        }

        tracing::warn!(
            operation = operation_name,
            attempt,
            max_attempts = config.max_attempts(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            error = %err,
            "execution failed",
        );

        if attempt >= config.max_attempts() {
            return Err(RetryError::Exhausted { attempts: attempt, source: err });
        }

        std::thread::sleep(config.delay);
    }
}

/// Blocking counterpart of [`with_fallback`].
pub fn with_fallback_blocking<F, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    fallback: T,
    operation: F,
) -> T
where
    F: FnMut() -> Result<T, E>,
    E: Display,
{
    match with_retry_blocking(config, operation_name, operation) {
        Ok(value) => value,
        Err(err) => {
            tracing::error!(operation = operation_name, error = %err, "returning fallback value");
            fallback
        },
    }
}
