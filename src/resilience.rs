//! Resilience wrapper for every outbound call
//!
//! [`Resilience::call`] guards an async operation against a named dependency:
//! the dependency's circuit breaker is consulted before each attempt, every
//! attempt is bounded by a timeout, and transient failures are retried under
//! the [`RetryPolicy`] with jittered exponential backoff.

use crate::breaker::{BreakerRegistry, BreakerSettings};
use crate::config::ResilienceConfig;
use crate::error::{Error, Result};
use crate::retry::{IsRetryable, RetryPolicy, with_retry};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Dependency name for the NNTP peer
pub const NNTP: &str = "nntp";
/// Dependency name for the persistent store
pub const STORE: &str = "store";
/// Dependency name for the search index
pub const INDEX: &str = "index";

/// Breaker + retry + timeout decorator shared by ingest and reconciliation
#[derive(Debug, Clone)]
pub struct Resilience {
    breakers: Arc<BreakerRegistry>,
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl Resilience {
    /// Build a wrapper with its own breaker registry
    pub fn new(config: &ResilienceConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings {
            failure_threshold: config.failure_threshold,
            reset_interval: config.reset_interval,
        }));
        Self::with_breakers(config, breakers)
    }

    /// Build a wrapper around an existing breaker registry
    pub fn with_breakers(config: &ResilienceConfig, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            breakers,
            policy: RetryPolicy::new(config.retry.clone()),
            call_timeout: config.call_timeout,
        }
    }

    /// Breaker registry backing this wrapper
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Whether `dependency` currently short-circuits
    pub fn is_open(&self, dependency: &str) -> bool {
        self.breakers.is_open(dependency)
    }

    /// Run `operation` against `dependency` under breaker, timeout and retry
    ///
    /// # Errors
    ///
    /// - [`Error::BreakerOpen`] if the breaker rejects the call (no I/O attempted)
    /// - [`Error::Timeout`] if the last attempt exceeded the call timeout
    /// - the operation's last error once retries are exhausted or it is not retryable
    pub async fn call<F, Fut, T>(&self, dependency: &str, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retry(&self.policy, || self.attempt(dependency, &operation)).await
    }

    async fn attempt<F, Fut, T>(&self, dependency: &str, operation: &F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.breakers.try_acquire(dependency)?;

        let outcome = match tokio::time::timeout(self.call_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout {
                dependency: dependency.to_string(),
                after: self.call_timeout,
            }),
        };

        match &outcome {
            Err(e) if e.trips_breaker() => {
                self.breakers.record_failure(dependency);
            }
            _ => self.breakers.record_success(dependency),
        }

        outcome
    }
}
