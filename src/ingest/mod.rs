//! Header ingest loop
//!
//! One [`IngestLoop`] per deployment polls every discovered group. Each group
//! keeps its own cursor (in the store), backpressure controller and failure
//! counter. A cycle for one group:
//!
//! 1. read the server watermarks and the stored cursor
//! 2. fetch overview entries for `cursor+1 ..= cursor+batch`
//! 3. parse, normalize and group the headers into releases and segments
//! 4. persist releases, segments and the advanced cursor in one transaction
//! 5. refresh the search documents of releases that gained segments
//! 6. feed latency and backlog to the controller and schedule the next cycle
//!
//! A failed cycle leaves the cursor where it was. Other groups keep going.
//! Cancellation is only observed between rounds, so an in-flight batch is
//! always persisted (or rolled back) as a whole.

pub mod backpressure;

pub use backpressure::{AdaptiveController, CycleObservation};

use crate::category::infer_category;
use crate::config::Config;
use crate::db::{BatchWrite, Database, NewRelease, NewSegment};
use crate::discovery::{self, DiscoveredGroups};
use crate::error::IngestError;
use crate::identity;
use crate::index::{ReleaseDocument, SearchIndex};
use crate::normalize::{detect_language, extract_tags};
use crate::protocol::{ProtocolClient, parse_header};
use crate::resilience::{INDEX, NNTP, Resilience, STORE};
use crate::types::{Event, OverviewEntry, ParsedHeader, ReleaseId};
use crate::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Stand-in for "never" when a configured wait does not fit in an [`Instant`]
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline_after(now: Instant, wait: Duration) -> Instant {
    now.checked_add(wait).unwrap_or_else(|| now + FAR_FUTURE)
}

/// Releases and segments derived from one batch of overview entries
#[derive(Clone, Debug, Default)]
pub struct BatchPlan {
    /// Writes for the store, cursor included
    pub write: BatchWrite,
    /// Headers that produced a segment write
    pub processed: u64,
    /// Headers skipped as malformed
    pub malformed: u64,
}

/// Group a batch of overview entries into release and segment writes
///
/// Entries are processed in ascending article order. `last` becomes the new
/// cursor even when the server returned fewer entries than requested.
pub fn plan_batch(
    group: &str,
    entries: &[OverviewEntry],
    observed_at: DateTime<Utc>,
    last: u64,
) -> BatchPlan {
    let mut ordered: Vec<&OverviewEntry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.article_number);

    let mut plan = BatchPlan {
        write: BatchWrite {
            group: group.to_string(),
            last_article: last,
            ..BatchWrite::default()
        },
        ..BatchPlan::default()
    };
    let mut positions: HashMap<ReleaseId, usize> = HashMap::new();

    for entry in ordered {
        let header = match parse_header(entry, group, observed_at) {
            ParsedHeader::Valid(header) => header,
            ParsedHeader::Malformed {
                article_number,
                reason,
            } => {
                tracing::debug!(group, article_number, reason = %reason, "Skipping malformed header");
                plan.malformed += 1;
                continue;
            }
        };

        let Some((release_id, normalized)) = identity::identify(&header.subject, header.posted_at)
        else {
            plan.malformed += 1;
            continue;
        };

        match positions.get(&release_id) {
            Some(&pos) => {
                let release = &mut plan.write.releases[pos];
                release.posted_at = release.posted_at.min(header.posted_at);
                release.expected_parts = release.expected_parts.max(normalized.part_total);
                release.article_low = release.article_low.min(header.article_number);
                release.article_high = release.article_high.max(header.article_number);
            }
            None => {
                positions.insert(release_id.clone(), plan.write.releases.len());
                plan.write.releases.push(NewRelease {
                    release_id: release_id.clone(),
                    canonical_title: normalized.title.clone(),
                    category_id: infer_category(&header.subject, group),
                    source_group: group.to_string(),
                    posted_at: header.posted_at,
                    expected_parts: normalized.part_total,
                    language: detect_language(&header.subject).to_string(),
                    tags: extract_tags(&header.subject),
                    article_low: header.article_number,
                    article_high: header.article_number,
                });
            }
        }

        plan.write.segments.push(NewSegment {
            release_id,
            segment_number: normalized.part_index.max(1),
            message_id: header.message_id,
            group_name: group.to_string(),
            size_bytes: header.size_bytes,
        });
        plan.processed += 1;
    }

    plan
}

/// Summary of one persisted batch
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchReport {
    /// Group name
    pub group: String,
    /// First article requested
    pub first: u64,
    /// Last article requested (the new cursor)
    pub last: u64,
    /// Headers that produced a segment write
    pub processed: u64,
    /// Segments that were new
    pub inserted: u64,
    /// Segments already on file
    pub duplicates: u64,
    /// Headers skipped as malformed
    pub malformed: u64,
    /// Articles left on the server
    pub backlog: u64,
    /// Releases whose counters changed
    pub changed: Vec<ReleaseId>,
}

/// What a single group cycle did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The cursor is already at the high-water mark
    Idle,
    /// A batch was persisted and the cursor advanced
    Ingested(BatchReport),
}

/// Per-group scheduling state
#[derive(Clone, Debug)]
pub struct GroupState {
    controller: AdaptiveController,
    next_due: Instant,
    consecutive_failures: u32,
}

impl GroupState {
    fn new(config: &Config, now: Instant) -> Self {
        Self {
            controller: AdaptiveController::new(&config.ingest),
            next_due: now,
            consecutive_failures: 0,
        }
    }

    /// Backpressure controller for this group
    pub fn controller(&self) -> &AdaptiveController {
        &self.controller
    }

    /// Cycles skipped in a row
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Collaborators shared by every group cycle
#[derive(Clone)]
pub struct IngestWorker {
    config: Arc<Config>,
    db: Arc<Database>,
    protocol: Arc<dyn ProtocolClient>,
    index: Arc<dyn SearchIndex>,
    resilience: Resilience,
    event_tx: broadcast::Sender<Event>,
}

impl IngestWorker {
    /// Bundle the collaborators a cycle needs
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        protocol: Arc<dyn ProtocolClient>,
        index: Arc<dyn SearchIndex>,
        resilience: Resilience,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            db,
            protocol,
            index,
            resilience,
            event_tx,
        }
    }

    fn emit_event(&self, event: Event) {
        // send() returns Err if there are no receivers, which is fine
        self.event_tx.send(event).ok();
    }

    /// Run one cycle for `group` and update its state
    async fn cycle(&self, group: &str, state: &mut GroupState) -> Result<CycleOutcome> {
        let result = self.ingest_batch(group, state.controller.batch_size()).await;

        let observation = match &result {
            Ok((_, latency, CycleOutcome::Idle)) => CycleObservation {
                latency: *latency,
                backlog: 0,
                failed: false,
            },
            Ok((_, latency, CycleOutcome::Ingested(report))) => CycleObservation {
                latency: *latency,
                backlog: report.backlog,
                failed: false,
            },
            Err(_) => CycleObservation {
                latency: Duration::ZERO,
                backlog: 0,
                failed: true,
            },
        };
        state.controller.observe(observation);
        state.next_due = deadline_after(Instant::now(), state.controller.poll_interval());

        match result {
            Ok((batch, _, outcome)) => {
                state.consecutive_failures = 0;
                if let CycleOutcome::Ingested(report) = &outcome {
                    let poll = state.controller.poll_interval();
                    let eta_secs = report
                        .backlog
                        .div_ceil(batch.max(1))
                        .saturating_mul(poll.as_secs());
                    tracing::info!(
                        group,
                        first = report.first,
                        last = report.last,
                        processed = report.processed,
                        inserted = report.inserted,
                        malformed = report.malformed,
                        backlog = report.backlog,
                        batch = state.controller.batch_size(),
                        poll_ms = poll.as_millis() as u64,
                        eta_secs,
                        "Ingested batch"
                    );
                    self.emit_event(Event::BatchIngested {
                        group: group.to_string(),
                        first: report.first,
                        last: report.last,
                        processed: report.processed,
                        inserted: report.inserted,
                        malformed: report.malformed,
                        backlog: report.backlog,
                    });
                } else {
                    tracing::debug!(group, "Group is caught up");
                }
                Ok(outcome)
            }
            Err(e) => {
                state.consecutive_failures += 1;
                tracing::warn!(
                    group,
                    error = %e,
                    consecutive_failures = state.consecutive_failures,
                    "Batch skipped, cursor not advanced"
                );
                if state.consecutive_failures >= self.config.ingest.failure_warn_threshold {
                    tracing::warn!(
                        group,
                        consecutive_failures = state.consecutive_failures,
                        "Group keeps failing"
                    );
                }
                self.emit_event(Event::BatchSkipped {
                    group: group.to_string(),
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Fetch, plan and persist one batch
    ///
    /// Returns the batch size used, the store-write latency and the outcome.
    async fn ingest_batch(&self, group: &str, batch: u64) -> Result<(u64, Duration, CycleOutcome)> {
        let protocol = &*self.protocol;
        let watermarks = self
            .resilience
            .call(NNTP, || protocol.group_watermarks(group))
            .await?;
        let cursor = self
            .resilience
            .call(STORE, || self.db.get_cursor(group))
            .await?;

        let first = match cursor {
            Some(c) => c.saturating_add(1).max(watermarks.low),
            None => watermarks.low,
        };
        if first > watermarks.high || watermarks.high == 0 {
            return Ok((batch, Duration::ZERO, CycleOutcome::Idle));
        }
        let last = watermarks
            .high
            .min(first.saturating_add(batch.saturating_sub(1)));

        let batch_failed = |e: crate::Error| IngestError::BatchFailed {
            group: group.to_string(),
            first,
            last,
            reason: e.to_string(),
        };

        let entries = self
            .resilience
            .call(NNTP, || protocol.fetch_headers(group, first, last))
            .await
            .map_err(batch_failed)?;

        let plan = plan_batch(group, &entries, Utc::now(), last);

        let started = Instant::now();
        let outcome = self
            .resilience
            .call(STORE, || self.db.persist_batch(&plan.write))
            .await
            .map_err(batch_failed)?;
        let latency = started.elapsed();

        self.refresh_documents(&outcome.changed).await;

        let report = BatchReport {
            group: group.to_string(),
            first,
            last,
            processed: plan.processed,
            inserted: outcome.inserted,
            duplicates: outcome.duplicates,
            malformed: plan.malformed,
            backlog: watermarks.high - last,
            changed: outcome.changed,
        };
        Ok((batch, latency, CycleOutcome::Ingested(report)))
    }

    /// Push the current state of `changed` releases into the search index
    ///
    /// Index failures are logged; the segments are already durable and the
    /// next change (or reconciliation) refreshes the document.
    async fn refresh_documents(&self, changed: &[ReleaseId]) {
        for release_id in changed {
            let release = match self
                .resilience
                .call(STORE, || self.db.get_release(release_id))
                .await
            {
                Ok(Some(release)) => release,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(release_id = %release_id, error = %e, "Failed to load release for indexing");
                    continue;
                }
            };

            let doc = ReleaseDocument::from(&release);
            let index = &*self.index;
            if let Err(e) = self.resilience.call(INDEX, || index.upsert(&doc)).await {
                tracing::warn!(release_id = %release_id, error = %e, "Failed to update search document");
            }
        }
    }
}

/// Long-running ingest scheduler over every discovered group
pub struct IngestLoop {
    worker: IngestWorker,
    states: HashMap<String, GroupState>,
    next_discovery: Instant,
}

impl IngestLoop {
    /// New loop; groups are discovered on the first round
    pub fn new(worker: IngestWorker) -> Self {
        Self {
            worker,
            states: HashMap::new(),
            next_discovery: Instant::now(),
        }
    }

    /// Groups currently scheduled, sorted
    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.states.keys().cloned().collect();
        groups.sort();
        groups
    }

    /// Scheduling state of `group`, if it is being ingested
    pub fn state(&self, group: &str) -> Option<&GroupState> {
        self.states.get(group)
    }

    /// Re-expand the configured patterns and update the group set
    ///
    /// New groups are due immediately. Groups that disappeared are dropped,
    /// unless a pattern failed to list this round (its groups are kept).
    pub async fn refresh_groups(&mut self) -> DiscoveredGroups {
        let config = &self.worker.config;
        let found =
            discovery::resolve_all(&*self.worker.protocol, &self.worker.resilience, &config.groups)
                .await;

        let now = Instant::now();
        for group in &found.groups {
            self.states
                .entry(group.clone())
                .or_insert_with(|| GroupState::new(config, now));
        }

        let interval = if found.failed_patterns.is_empty() {
            self.states.retain(|group, _| found.groups.contains(group));
            config.groups.discovery_interval
        } else {
            config
                .groups
                .discovery_interval
                .min(config.ingest.poll_max)
        };
        self.next_discovery = deadline_after(now, interval);

        tracing::info!(
            groups = self.states.len(),
            failed_patterns = found.failed_patterns.len(),
            "Group discovery finished"
        );
        self.worker.emit_event(Event::GroupsDiscovered {
            groups: self.states.len(),
            failed_patterns: found.failed_patterns.clone(),
        });
        found
    }

    /// Run one cycle for `group` right away, regardless of its schedule
    pub async fn poll_group(&mut self, group: &str) -> Result<CycleOutcome> {
        let config = &self.worker.config;
        let state = self
            .states
            .entry(group.to_string())
            .or_insert_with(|| GroupState::new(config, Instant::now()));
        self.worker.cycle(group, state).await
    }

    /// Run every group that is due, at most `concurrency` at a time
    async fn run_due_groups(&mut self, now: Instant) {
        let due: Vec<String> = self
            .states
            .iter()
            .filter(|(_, state)| state.next_due <= now)
            .map(|(group, _)| group.clone())
            .collect();
        if due.is_empty() {
            return;
        }

        let taken: Vec<(String, GroupState)> = due
            .into_iter()
            .filter_map(|group| self.states.remove_entry(&group))
            .collect();

        let worker = &self.worker;
        let done: Vec<(String, GroupState)> = stream::iter(taken)
            .map(|(group, mut state)| async move {
                // Failures are logged and reported as events inside cycle()
                let _ = worker.cycle(&group, &mut state).await;
                (group, state)
            })
            .buffer_unordered(self.worker.config.ingest.concurrency.max(1))
            .collect()
            .await;

        self.states.extend(done);
    }

    fn next_wakeup(&self) -> Instant {
        self.states
            .values()
            .map(|state| state.next_due)
            .fold(self.next_discovery, Instant::min)
    }

    /// Poll until `cancel` fires
    ///
    /// Cancellation is checked between rounds; a round that has started
    /// finishes its batches first.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!("Ingest loop started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let now = Instant::now();
            if now >= self.next_discovery {
                self.refresh_groups().await;
            }
            self.run_due_groups(Instant::now()).await;

            let wakeup = self.next_wakeup();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(wakeup) => {}
            }
        }

        tracing::info!("Ingest loop stopped");
    }
}
