//! Retry logic with exponential backoff
//!
//! This module provides the retry half of the resilience layer: a
//! [`RetryPolicy`] (attempt cap, base delay, backoff multiplier, jitter range
//! and a classifier deciding which errors are retryable) and [`with_retry`],
//! which drives an async operation under that policy independent of call site.
//!
//! # Example
//!
//! ```no_run
//! use usenet_idx::retry::{IsRetryable, RetryPolicy, with_retry};
//! use usenet_idx::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{:?}", self)
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() -> Result<(), MyError> {
//! let policy = RetryPolicy::new(RetryConfig::default());
//! with_retry(&policy, || async {
//!     // Your operation here
//!     Ok::<_, MyError>(())
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{DatabaseError, Error};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, connection reset, server busy, locked database)
/// should return `true`. Permanent failures (authentication, missing group,
/// constraint violations) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;

    /// Returns true if the error says the dependency itself is unhealthy
    ///
    /// Used by the circuit breaker. Defaults to [`IsRetryable::is_retryable`].
    fn trips_breaker(&self) -> bool {
        self.is_retryable()
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Protocol(e) => e.is_transient(),
            Error::Timeout { .. } => true,
            // SQLite reports contention as "database is locked" / "busy"
            Error::Database(DatabaseError::QueryFailed(msg))
            | Error::Database(DatabaseError::ConnectionFailed(msg)) => {
                msg.contains("locked") || msg.contains("busy")
            }
            Error::Sqlx(sqlx::Error::PoolTimedOut) | Error::Sqlx(sqlx::Error::Io(_)) => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // Short-circuits must not be retried; the caller backs off instead
            Error::BreakerOpen { .. } => false,
            Error::Config { .. }
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Ingest(_)
            | Error::InconsistentState { .. }
            | Error::ServiceUnavailable(_)
            | Error::NotFound(_)
            | Error::ShuttingDown
            | Error::Serialization(_)
            | Error::Other(_) => false,
        }
    }

    fn trips_breaker(&self) -> bool {
        match self {
            // The peer answered; a missing article says nothing about its health
            Error::Protocol(e) => !matches!(e, crate::error::ProtocolError::NotFound(_)),
            Error::Timeout { .. } => true,
            Error::Database(DatabaseError::ConnectionFailed(_))
            | Error::Database(DatabaseError::QueryFailed(_))
            | Error::Sqlx(_)
            | Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Explicit retry policy consumed by the resilience layer
///
/// Bundles the [`RetryConfig`] bounds with a classifier deciding which errors
/// are worth another attempt.
#[derive(Debug)]
pub struct RetryPolicy<E = Error> {
    /// Attempt cap, delays and jitter range
    pub config: RetryConfig,
    classifier: fn(&E) -> bool,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            classifier: self.classifier,
        }
    }
}

impl<E: IsRetryable> RetryPolicy<E> {
    /// Create a policy that classifies errors via [`IsRetryable::is_retryable`]
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classifier: <E as IsRetryable>::is_retryable,
        }
    }
}

impl<E> RetryPolicy<E> {
    /// Replace the classifier
    pub fn with_classifier(mut self, classifier: fn(&E) -> bool) -> Self {
        self.classifier = classifier;
        self
    }

    /// Whether `error` should be retried after `retries_done` retries
    pub fn should_retry(&self, error: &E, retries_done: u32) -> bool {
        retries_done < self.config.max_retries && (self.classifier)(error)
    }

    /// Un-jittered delay before retry number `retry` (1-based)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let secs = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.config.max_delay.as_secs_f64() {
            return self.config.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Execute an async operation under a retry policy
///
/// Retries while the policy's classifier accepts the error and the retry cap
/// is not exhausted, sleeping an exponentially growing, jittered delay between
/// attempts.
///
/// # Returns
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy<E>, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut retries = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if retries > 0 {
                    tracing::info!(attempts = retries + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if policy.should_retry(&e, retries) => {
                retries += 1;
                let delay = add_jitter(policy.backoff_delay(retries), policy.config.jitter);

                tracing::warn!(
                    error = %e,
                    attempt = retries,
                    max_retries = policy.config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if retries > 0 {
                    tracing::error!(
                        error = %e,
                        attempts = retries + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::debug!(error = %e, "Operation failed without retry");
                }
                return Err(e);
            }
        }
    }
}

/// Add a uniformly distributed jitter in `[0, max_jitter]` to `delay`
fn add_jitter(delay: Duration, max_jitter: Duration) -> Duration {
    if max_jitter.is_zero() {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let extra_ms: u64 = rng.gen_range(0..=max_jitter.as_millis() as u64);
    delay + Duration::from_millis(extra_ms)
}
