//! Per-dependency circuit breakers
//!
//! Each guarded dependency ("nntp", "store", "index") has its own
//! [`BreakerRecord`] kept in a [`BreakerRegistry`]. The registry is an
//! injected value, not a process-wide singleton, so tests get isolated state.
//!
//! State machine:
//!
//! ```text
//! closed --failures >= threshold--> open --reset interval elapsed--> half_open
//! half_open --probe success--> closed
//! half_open --probe failure--> open
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Breaker state for one dependency
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls flow normally
    Closed,
    /// Calls short-circuit without I/O
    Open,
    /// A single probe call is deciding the outcome
    HalfOpen,
}

/// Breaker record for one dependency
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakerRecord {
    /// Current state
    pub state: BreakerState,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// When the breaker last opened
    pub opened_at: Option<Instant>,
    /// When the in-flight half-open probe was admitted
    probe_started_at: Option<Instant>,
}

impl Default for BreakerRecord {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_started_at: None,
        }
    }
}

/// How a call was admitted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Normal call through a closed breaker
    Normal,
    /// The single half-open probe
    Probe,
}

/// Breaker thresholds shared by every dependency in a registry
#[derive(Clone, Copy, Debug)]
pub struct BreakerSettings {
    /// Consecutive failures that open the breaker
    pub failure_threshold: u32,
    /// Wait before an open breaker admits a probe
    pub reset_interval: Duration,
}

/// Keyed store of breaker records
#[derive(Debug)]
pub struct BreakerRegistry {
    settings: BreakerSettings,
    records: Mutex<HashMap<String, BreakerRecord>>,
}

impl BreakerRegistry {
    /// Create an empty registry; every dependency starts closed
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Thresholds in effect
    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, BreakerRecord>> {
        // A panic while holding the lock cannot leave a record half-written
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admit or reject a call to `dependency`
    ///
    /// Returns [`Error::BreakerOpen`] without side effects when the breaker is
    /// open and the reset interval has not elapsed, or when a probe is already
    /// in flight.
    pub fn try_acquire(&self, dependency: &str) -> Result<Admission> {
        let now = Instant::now();
        let reset = self.settings.reset_interval;
        let mut records = self.records();
        let record = records.entry(dependency.to_string()).or_default();

        match record.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                let elapsed = record
                    .opened_at
                    .map(|at| now.duration_since(at) >= reset)
                    .unwrap_or(true);
                if elapsed {
                    record.state = BreakerState::HalfOpen;
                    record.probe_started_at = Some(now);
                    tracing::info!(dependency, "Circuit breaker half-open, admitting probe");
                    Ok(Admission::Probe)
                } else {
                    Err(open_error(dependency))
                }
            }
            BreakerState::HalfOpen => {
                // A probe that never reported back (cancelled) must not wedge the breaker
                let stale = record
                    .probe_started_at
                    .map(|at| now.duration_since(at) >= reset)
                    .unwrap_or(true);
                if stale {
                    record.probe_started_at = Some(now);
                    Ok(Admission::Probe)
                } else {
                    Err(open_error(dependency))
                }
            }
        }
    }

    /// Record a successful call (or a failure that says nothing about health)
    pub fn record_success(&self, dependency: &str) {
        let mut records = self.records();
        let record = records.entry(dependency.to_string()).or_default();
        if record.state != BreakerState::Closed {
            tracing::info!(dependency, "Circuit breaker closed");
        }
        *record = BreakerRecord::default();
    }

    /// Record a failed call; returns the resulting state
    pub fn record_failure(&self, dependency: &str) -> BreakerState {
        let now = Instant::now();
        let threshold = self.settings.failure_threshold;
        let mut records = self.records();
        let record = records.entry(dependency.to_string()).or_default();
        record.consecutive_failures = record.consecutive_failures.saturating_add(1);

        match record.state {
            BreakerState::HalfOpen => {
                record.state = BreakerState::Open;
                record.opened_at = Some(now);
                record.probe_started_at = None;
                tracing::warn!(dependency, "Circuit breaker probe failed, re-opening");
            }
            BreakerState::Closed if record.consecutive_failures >= threshold => {
                record.state = BreakerState::Open;
                record.opened_at = Some(now);
                tracing::warn!(
                    dependency,
                    failures = record.consecutive_failures,
                    reset_secs = self.settings.reset_interval.as_secs(),
                    "Circuit breaker opened"
                );
            }
            // Late failures from calls admitted before the breaker opened
            BreakerState::Closed | BreakerState::Open => {}
        }

        record.state
    }

    /// Current state of `dependency` (closed if never seen)
    pub fn state(&self, dependency: &str) -> BreakerState {
        self.records()
            .get(dependency)
            .map(|r| r.state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Whether calls to `dependency` would short-circuit right now
    pub fn is_open(&self, dependency: &str) -> bool {
        let now = Instant::now();
        match self.records().get(dependency) {
            Some(record) if record.state == BreakerState::Open => record
                .opened_at
                .map(|at| now.duration_since(at) < self.settings.reset_interval)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Copy of the record for `dependency`
    pub fn snapshot(&self, dependency: &str) -> BreakerRecord {
        self.records().get(dependency).cloned().unwrap_or_default()
    }
}

fn open_error(dependency: &str) -> Error {
    Error::BreakerOpen {
        dependency: dependency.to_string(),
    }
}
