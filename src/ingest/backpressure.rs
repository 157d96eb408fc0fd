//! Adaptive batch size and poll interval
//!
//! One [`AdaptiveController`] per group. After each cycle it is fed the
//! observed latency, the remaining backlog and whether the cycle failed, and
//! moves the batch size and poll interval within the configured bounds.

use crate::config::IngestConfig;
use std::time::Duration;

/// What the last cycle looked like
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleObservation {
    /// Wall time of the store write
    pub latency: Duration,
    /// Articles left on the server after the cycle
    pub backlog: u64,
    /// The batch was skipped
    pub failed: bool,
}

/// Per-group backpressure state
#[derive(Clone, Debug)]
pub struct AdaptiveController {
    batch: u64,
    poll: Duration,
    batch_min: u64,
    batch_max: u64,
    poll_min: Duration,
    poll_max: Duration,
    latency_target: Duration,
}

impl AdaptiveController {
    /// Start at the smallest batch and the shortest poll interval
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            batch: config.batch_min,
            poll: config.poll_min,
            batch_min: config.batch_min,
            batch_max: config.batch_max,
            poll_min: config.poll_min,
            poll_max: config.poll_max,
            latency_target: config.latency_target,
        }
    }

    /// Headers to request next cycle
    pub fn batch_size(&self) -> u64 {
        self.batch
    }

    /// Sleep before the next cycle
    pub fn poll_interval(&self) -> Duration {
        self.poll
    }

    fn slower_poll(&self) -> Duration {
        self.poll.saturating_mul(2).min(self.poll_max)
    }

    /// Adjust after a cycle
    pub fn observe(&mut self, observation: CycleObservation) {
        if observation.failed || observation.latency > self.latency_target {
            self.batch = (self.batch / 2).max(self.batch_min);
            self.poll = self.slower_poll();
        } else if observation.backlog == 0 {
            self.poll = self.slower_poll();
        } else if observation.latency < self.latency_target / 2 && observation.backlog > self.batch
        {
            self.batch = self.batch.saturating_mul(2).min(self.batch_max);
            self.poll = (self.poll / 2).max(self.poll_min);
        }

        tracing::trace!(
            batch = self.batch,
            poll_ms = self.poll.as_millis() as u64,
            latency_ms = observation.latency.as_millis() as u64,
            backlog = observation.backlog,
            failed = observation.failed,
            "Backpressure adjusted"
        );
    }
}
