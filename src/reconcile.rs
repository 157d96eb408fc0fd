//! Reconciliation (backfill)
//!
//! Repairs releases whose stored counters disagree with their segments, whose
//! segments have unknown sizes, or that lost every segment.
//!
//! - [`Reconciler::reconcile_release`] is the targeted procedure for one
//!   release: look up zero-size segments by message id, re-query the
//!   release's article window when parts are missing, recompute counters,
//!   then either re-enable the release or flag it unavailable.
//! - [`Reconciler::scan`] walks every release that needs attention and applies
//!   the targeted procedure to each one. A failing release is logged and
//!   counted; the scan moves on. Cancellation stops it between releases.
//! - [`Reconciler::prune_stale`] deletes unavailable releases older than the
//!   staleness threshold.
//!
//! Every segment change goes through the same transactional store calls the
//! ingest loop uses, so both can run at the same time without double counting.

use crate::aggregate::{self, SegmentChange};
use crate::config::Config;
use crate::db::{Database, NewSegment, Release};
use crate::error::ProtocolError;
use crate::identity;
use crate::index::{ReleaseDocument, SearchIndex};
use crate::protocol::{ProtocolClient, parse_header};
use crate::resilience::{INDEX, NNTP, Resilience, STORE};
use crate::types::{Event, ParsedHeader, ReconcileOutcome, ReleaseId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Tally of one scan
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Releases examined
    pub scanned: u64,
    /// Already consistent
    pub consistent: u64,
    /// Repaired and available
    pub repaired: u64,
    /// Flagged unavailable
    pub unavailable: u64,
    /// Deleted (targeted pruning plus the stale sweep)
    pub pruned: u64,
    /// Failed; left for the next scan
    pub failed: u64,
    /// Cancelled before every release was examined
    pub interrupted: bool,
}

impl ScanReport {
    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::AlreadyConsistent => self.consistent += 1,
            ReconcileOutcome::Repaired { .. } => self.repaired += 1,
            ReconcileOutcome::MarkedUnavailable => self.unavailable += 1,
            ReconcileOutcome::Pruned => self.pruned += 1,
        }
    }
}

/// Targeted and scan reconciliation over the shared store
#[derive(Clone)]
pub struct Reconciler {
    config: Arc<Config>,
    db: Arc<Database>,
    protocol: Arc<dyn ProtocolClient>,
    index: Arc<dyn SearchIndex>,
    resilience: Resilience,
    event_tx: broadcast::Sender<Event>,
}

impl Reconciler {
    /// Bundle the collaborators reconciliation needs
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

    /// Repair one release
    ///
    /// Running it again on a consistent release writes nothing and returns
    /// [`ReconcileOutcome::AlreadyConsistent`]. Releases taken down by an
    /// operator are left alone.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the release does not exist
    /// - the protocol error that interrupted recovery. Counters are still
    ///   recomputed first, so the release never claims parts it does not have.
    pub async fn reconcile_release(&self, release_id: &ReleaseId) -> Result<ReconcileOutcome> {
        let release = self
            .resilience
            .call(STORE, || self.db.get_release(release_id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("release {}", release_id)))?;

        if release.taken_down {
            tracing::debug!(release_id = %release_id, "Release was taken down, skipping");
            return Ok(ReconcileOutcome::AlreadyConsistent);
        }

        let segments = self
            .resilience
            .call(STORE, || self.db.get_segments(release_id))
            .await?;
        let sizes: Vec<u64> = segments.iter().map(|s| s.size_bytes as u64).collect();
        let unchecked = segments
            .iter()
            .filter(|s| s.size_bytes == 0 && !s.size_checked)
            .count() as u32;

        let issues = aggregate::check(&release.counters(), release.available, &sizes, unchecked);
        if issues.is_empty() {
            tracing::debug!(release_id = %release_id, "Release already consistent");
            return Ok(self.finish(release_id, ReconcileOutcome::AlreadyConsistent));
        }
        tracing::info!(
            release_id = %release_id,
            issues = %issues.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "Reconciling release"
        );

        let mut recovered = 0u32;
        let mut removed = 0u32;
        let mut interrupted: Option<Error> = None;

        let protocol = &*self.protocol;
        for segment in segments.iter().filter(|s| s.size_bytes == 0 && !s.size_checked) {
            let segment_number = segment.segment_number as u32;
            let lookup = self
                .resilience
                .call(NNTP, || {
                    protocol.fetch_by_message_id(&segment.group_name, &segment.message_id)
                })
                .await;

            match lookup {
                Ok(info) if info.size_bytes > 0 => {
                    self.resilience
                        .call(STORE, || {
                            self.db
                                .update_segment_size(release_id, segment_number, info.size_bytes)
                        })
                        .await?;
                    recovered += 1;
                }
                Ok(_) => {
                    tracing::debug!(release_id = %release_id, segment_number, "Peer does not know the size either");
                    self.resilience
                        .call(STORE, || self.db.mark_size_checked(release_id, segment_number))
                        .await?;
                }
                Err(Error::Protocol(ProtocolError::NotFound(_))) => {
                    let change = self
                        .resilience
                        .call(STORE, || self.db.remove_segment(release_id, segment_number))
                        .await?;
                    if change == SegmentChange::Removed {
                        removed += 1;
                    }
                }
                Err(e) => {
                    interrupted = Some(e);
                    break;
                }
            }
        }

        // Parts went missing: re-read the window, add_segment skips what is on file
        let remaining = i64::from(segments.len() as u32 - removed);
        let parts_missing = remaining == 0
            || remaining < release.part_count
            || remaining < release.expected_parts;
        if interrupted.is_none() && parts_missing {
            match self.requery_window(&release).await {
                Ok(n) => recovered += n,
                Err(e) => interrupted = Some(e),
            }
        }

        let counters = self
            .resilience
            .call(STORE, || self.db.recompute_release_counters(release_id))
            .await?;

        if let Some(e) = interrupted {
            tracing::warn!(release_id = %release_id, error = %e, "Reconciliation interrupted");
            return Err(e);
        }

        let outcome = if counters.part_count > 0 {
            if !release.available {
                self.resilience
                    .call(STORE, || self.db.mark_available(release_id))
                    .await?;
            }
            self.refresh_document(release_id).await;
            ReconcileOutcome::Repaired {
                recovered,
                removed,
                part_count: counters.part_count,
            }
        } else {
            self.resilience
                .call(STORE, || self.db.mark_unavailable(release_id))
                .await?;
            self.remove_document(release_id).await;

            if release.posted_at() < self.stale_cutoff() {
                self.resilience
                    .call(STORE, || self.db.delete_release(release_id))
                    .await?;
                self.emit_event(Event::ReleasePruned {
                    release_id: release_id.clone(),
                });
                ReconcileOutcome::Pruned
            } else {
                ReconcileOutcome::MarkedUnavailable
            }
        };

        tracing::info!(release_id = %release_id, outcome = ?outcome, "Release reconciled");
        Ok(self.finish(release_id, outcome))
    }

    fn finish(&self, release_id: &ReleaseId, outcome: ReconcileOutcome) -> ReconcileOutcome {
        self.emit_event(Event::ReleaseReconciled {
            release_id: release_id.clone(),
            outcome,
        });
        outcome
    }

    /// Releases posted before this are stale
    fn stale_cutoff(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.config.reconcile.staleness)
            .ok()
            .and_then(|staleness| Utc::now().checked_sub_signed(staleness))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Re-read the release's article window and re-add matching articles
    ///
    /// Returns the number of segments inserted.
    async fn requery_window(&self, release: &Release) -> Result<u32> {
        let group = release.source_group.as_str();
        let low = release.article_low.max(0) as u64;
        let mut high = release.article_high.max(0) as u64;
        if low == 0 || high < low {
            tracing::debug!(release_id = %release.release_id, "No article window recorded");
            return Ok(0);
        }

        let max_window = self.config.reconcile.max_window.max(1);
        if high - low + 1 > max_window {
            tracing::warn!(
                release_id = %release.release_id,
                low,
                high,
                max_window,
                "Article window too wide, truncating"
            );
            high = low + max_window - 1;
        }

        let chunk = self.config.ingest.batch_max.max(1);
        let protocol = &*self.protocol;
        let mut recovered = 0u32;
        let mut first = low;

        while first <= high {
            let last = high.min(first + chunk - 1);
            let entries = self
                .resilience
                .call(NNTP, || protocol.fetch_headers(group, first, last))
                .await?;

            for entry in &entries {
                let ParsedHeader::Valid(header) = parse_header(entry, group, release.posted_at())
                else {
                    continue;
                };
                let Some((id, normalized)) = identity::identify(&header.subject, header.posted_at)
                else {
                    continue;
                };
                if id != release.release_id {
                    continue;
                }

                let segment = NewSegment {
                    release_id: id,
                    segment_number: normalized.part_index.max(1),
                    message_id: header.message_id,
                    group_name: group.to_string(),
                    size_bytes: header.size_bytes,
                };
                let change = self
                    .resilience
                    .call(STORE, || self.db.add_segment(&segment))
                    .await?;
                if change == SegmentChange::Inserted {
                    recovered += 1;
                }
            }
            first = last + 1;
        }

        tracing::debug!(
            release_id = %release.release_id,
            low,
            high,
            recovered,
            "Re-queried article window"
        );
        Ok(recovered)
    }

    async fn refresh_document(&self, release_id: &ReleaseId) {
        let release = match self
            .resilience
            .call(STORE, || self.db.get_release(release_id))
            .await
        {
            Ok(Some(release)) => release,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(release_id = %release_id, error = %e, "Failed to load release for indexing");
                return;
            }
        };
        let doc = ReleaseDocument::from(&release);
        let index = &*self.index;
        if let Err(e) = self.resilience.call(INDEX, || index.upsert(&doc)).await {
            tracing::warn!(release_id = %release_id, error = %e, "Failed to update search document");
        }
    }

    async fn remove_document(&self, release_id: &ReleaseId) {
        let index = &*self.index;
        if let Err(e) = self.resilience.call(INDEX, || index.delete(release_id)).await {
            tracing::warn!(release_id = %release_id, error = %e, "Failed to remove search document");
        }
    }

    /// Reconcile every release that needs it, then sweep stale ones
    ///
    /// `cancel` is checked between releases: the release in hand is finished,
    /// the rest are left for the next scan and the stale sweep is skipped.
    pub async fn scan(&self, cancel: &CancellationToken) -> ScanReport {
        let mut report = ScanReport::default();
        let page_size = self.config.reconcile.scan_batch.max(1);
        let mut after: Option<ReleaseId> = None;

        'pages: loop {
            if cancel.is_cancelled() {
                report.interrupted = true;
                break;
            }
            let page = match self
                .resilience
                .call(STORE, || {
                    self.db
                        .list_releases_needing_reconciliation(page_size, after.as_ref())
                })
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to list releases for reconciliation");
                    break;
                }
            };
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.release_id.clone());

            for release in &page {
                if cancel.is_cancelled() {
                    report.interrupted = true;
                    break 'pages;
                }
                report.scanned += 1;
                match self.reconcile_release(&release.release_id).await {
                    Ok(outcome) => report.record(outcome),
                    Err(e) => {
                        tracing::warn!(release_id = %release.release_id, error = %e, "Reconciliation failed, will retry next scan");
                        report.failed += 1;
                    }
                }
            }

            if page.len() < page_size as usize {
                break;
            }
        }

        if report.interrupted {
            tracing::info!(scanned = report.scanned, "Reconciliation scan cancelled");
            return report;
        }

        match self.prune_stale().await {
            Ok(pruned) => report.pruned += pruned,
            Err(e) => tracing::warn!(error = %e, "Stale release sweep failed"),
        }

        tracing::info!(
            scanned = report.scanned,
            consistent = report.consistent,
            repaired = report.repaired,
            unavailable = report.unavailable,
            pruned = report.pruned,
            failed = report.failed,
            "Reconciliation scan complete"
        );
        report
    }

    /// Delete unavailable releases posted before the staleness threshold
    ///
    /// Returns the number of releases deleted.
    pub async fn prune_stale(&self) -> Result<u64> {
        let cutoff = self.stale_cutoff();
        let page_size = self.config.reconcile.scan_batch.max(1);
        let mut pruned = 0u64;

        loop {
            let stale = self
                .resilience
                .call(STORE, || self.db.list_stale_unavailable(cutoff, page_size))
                .await?;
            if stale.is_empty() {
                break;
            }

            let mut deleted_any = false;
            for release_id in &stale {
                if self
                    .resilience
                    .call(STORE, || self.db.delete_release(release_id))
                    .await?
                {
                    deleted_any = true;
                    pruned += 1;
                    self.remove_document(release_id).await;
                    self.emit_event(Event::ReleasePruned {
                        release_id: release_id.clone(),
                    });
                }
            }

            if !deleted_any || stale.len() < page_size as usize {
                break;
            }
        }

        if pruned > 0 {
            tracing::info!(pruned, "Pruned stale unavailable releases");
        }
        Ok(pruned)
    }

    /// Scan every `reconcile.interval` until `cancel` fires
    ///
    /// A scan in progress finishes the release it is working on, then stops.
    pub async fn run(self, cancel: CancellationToken) {
        let interval = self.config.reconcile.interval;
        tracing::info!(interval_secs = interval.as_secs(), "Reconciliation scheduler started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.scan(&cancel).await;
        }

        tracing::info!("Reconciliation scheduler stopped");
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::category::CategoryPolicy;
    use crate::db::NewRelease;
    use crate::index::SearchQuery;
    use crate::test_helpers::{Harness, TEST_GROUP, harness, harness_with, test_config};
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    fn reconciler(h: &Harness) -> (Reconciler, broadcast::Receiver<Event>) {
        let (event_tx, event_rx) = broadcast::channel(100);
        let reconciler = Reconciler::new(
            h.config.clone(),
            h.db.clone(),
            h.nntp.clone(),
            h.index.clone(),
            h.resilience.clone(),
            event_tx,
        );
        (reconciler, event_rx)
    }

    fn subject(part: u32, total: u32) -> String {
        format!("[{:02}/{:02}] - \"Some.Release.part{:02}.rar\" yEnc", part, total, part)
    }

    fn release_id() -> ReleaseId {
        "some.release:2025-08-17".parse().unwrap()
    }

    /// Store a release for articles `low..=high` without any segments
    async fn bare_release(h: &Harness, low: u64, high: u64, posted_day: u32) -> ReleaseId {
        let posted_at = Utc.with_ymd_and_hms(2025, 8, posted_day, 14, 3, 0).unwrap();
        let release = NewRelease {
            release_id: ReleaseId::new("some.release", posted_at.date_naive()),
            canonical_title: "some.release".to_string(),
            category_id: 7000,
            source_group: TEST_GROUP.to_string(),
            posted_at,
            expected_parts: 3,
            language: "und".to_string(),
            tags: Vec::new(),
            article_low: low,
            article_high: high,
        };
        h.db.upsert_release(&release).await.unwrap();
        // Claims parts it does not have
        sqlx::query("UPDATE releases SET has_parts = 1, part_count = 3, size_bytes = 3000 WHERE release_id = ?")
            .bind(&release.release_id)
            .execute(h.db.pool())
            .await
            .unwrap();
        release.release_id
    }

    async fn add_segment(h: &Harness, n: u32, message_id: &str, size: u64) {
        h.db.add_segment(&NewSegment {
            release_id: release_id(),
            segment_number: n,
            message_id: message_id.to_string(),
            group_name: TEST_GROUP.to_string(),
            size_bytes: size,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn consistent_release_is_a_no_op() {
        let h = harness().await;
        bare_release(&h, 1, 1, 17).await;
        sqlx::query("UPDATE releases SET has_parts = 0, part_count = 0, size_bytes = 0")
            .execute(h.db.pool())
            .await
            .unwrap();
        add_segment(&h, 1, "a@x", 1000).await;
        let (reconciler, mut events) = reconciler(&h);

        let before = h.db.get_release(&release_id()).await.unwrap().unwrap();
        let outcome = reconciler.reconcile_release(&release_id()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AlreadyConsistent);

        let after = h.db.get_release(&release_id()).await.unwrap().unwrap();
        assert_eq!(before.updated_at, after.updated_at);
        assert_eq!(h.nntp.lookup_calls.load(Ordering::SeqCst), 0);
        assert!(matches!(
            events.try_recv().unwrap(),
            Event::ReleaseReconciled {
                outcome: ReconcileOutcome::AlreadyConsistent,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_release_is_rebuilt_from_its_window() {
        let h = harness().await;
        for part in 1..=3 {
            h.nntp
                .post(TEST_GROUP, &subject(part, 3), &format!("p{}@x", part), 700);
        }
        h.nntp.post(TEST_GROUP, "Unrelated.Post.nfo", "other@x", 50);
        let id = bare_release(&h, 1, 4, 17).await;
        let (reconciler, _events) = reconciler(&h);

        let outcome = reconciler.reconcile_release(&id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Repaired {
                recovered: 3,
                removed: 0,
                part_count: 3
            }
        );

        let release = h.db.get_release(&id).await.unwrap().unwrap();
        assert_eq!(release.part_count, 3);
        assert_eq!(release.size_bytes, 2100);
        assert!(release.has_parts && release.available);

        let hits = h
            .index
            .search(&SearchQuery::text("some release"), CategoryPolicy::default())
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        // Second run has nothing left to do
        assert_eq!(
            reconciler.reconcile_release(&id).await.unwrap(),
            ReconcileOutcome::AlreadyConsistent
        );
    }

    #[tokio::test]
    async fn unrecoverable_release_is_flagged_unavailable() {
        let h = harness().await;
        h.nntp.post(TEST_GROUP, "Unrelated.Post.nfo", "other@x", 50);
        let id = bare_release(&h, 1, 1, 17).await;

        // Recent enough not to be pruned
        let mut config = test_config();
        config.reconcile.staleness = std::time::Duration::from_secs(100 * 365 * 86_400);
        let h = Harness {
            config: Arc::new(config),
            ..h
        };
        let (reconciler, _events) = reconciler(&h);

        let outcome = reconciler.reconcile_release(&id).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::MarkedUnavailable);

        let release = h.db.get_release(&id).await.unwrap().unwrap();
        assert!(!release.available);
        assert!(!release.has_parts);
        assert_eq!(release.part_count, 0);
        assert_eq!(release.size_bytes, 0);
    }

    #[tokio::test]
    async fn stale_unrecoverable_release_is_pruned() {
        let h = harness().await;
        let id = bare_release(&h, 1, 1, 17).await;
        let (reconciler, mut events) = reconciler(&h);

        let outcome = reconciler.reconcile_release(&id).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Pruned);
        assert!(h.db.get_release(&id).await.unwrap().is_none());
        assert!(matches!(events.try_recv().unwrap(), Event::ReleasePruned { .. }));
    }

    #[tokio::test]
    async fn unknown_sizes_are_looked_up_and_missing_parts_dropped() {
        let h = harness().await;
        h.nntp.post(TEST_GROUP, &subject(1, 2), "p1@x", 900);
        let id = bare_release(&h, 1, 2, 17).await;
        add_segment(&h, 1, "p1@x", 0).await;
        add_segment(&h, 2, "p2@x", 0).await;
        let (reconciler, _events) = reconciler(&h);

        let outcome = reconciler.reconcile_release(&id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Repaired {
                recovered: 1,
                removed: 1,
                part_count: 1
            }
        );
        let release = h.db.get_release(&id).await.unwrap().unwrap();
        assert_eq!(release.size_bytes, 900);
        assert_eq!(h.db.get_segments(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_lookup_keeps_segments_for_next_run() {
        let h = harness().await;
        h.nntp.post(TEST_GROUP, &subject(1, 2), "p1@x", 0);
        h.nntp.post(TEST_GROUP, &subject(2, 2), "p2@x", 0);
        let id = bare_release(&h, 1, 2, 17).await;
        add_segment(&h, 1, "p1@x", 0).await;
        add_segment(&h, 2, "p2@x", 0).await;
        let (reconciler, _events) = reconciler(&h);

        h.nntp.fail_lookups.store(true, Ordering::SeqCst);
        assert!(reconciler.reconcile_release(&id).await.is_err());
        // One attempt plus two retries, then the run stops
        assert_eq!(h.nntp.lookup_calls.load(Ordering::SeqCst), 3);
        assert_eq!(h.db.get_segments(&id).await.unwrap().len(), 2);

        h.nntp.fail_lookups.store(false, Ordering::SeqCst);
        h.nntp.set_size("p1@x", 640);
        h.nntp.cancel("p2@x");
        let outcome = reconciler.reconcile_release(&id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Repaired {
                recovered: 1,
                removed: 1,
                part_count: 1
            }
        );
        let release = h.db.get_release(&id).await.unwrap().unwrap();
        assert_eq!(release.size_bytes, 640);
        assert!(release.available);
    }

    #[tokio::test]
    async fn partially_lost_release_is_refilled_from_its_window() {
        let h = harness().await;
        for part in 1..=3 {
            h.nntp
                .post(TEST_GROUP, &subject(part, 3), &format!("p{}@x", part), 700);
        }
        let id = bare_release(&h, 1, 3, 17).await;
        add_segment(&h, 1, "p1@x", 700).await;
        let (reconciler, _events) = reconciler(&h);

        let outcome = reconciler.reconcile_release(&id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Repaired {
                recovered: 2,
                removed: 0,
                part_count: 3
            }
        );
        assert_eq!(h.nntp.header_calls.load(Ordering::SeqCst), 1);

        let release = h.db.get_release(&id).await.unwrap().unwrap();
        assert_eq!(release.part_count, 3);
        assert_eq!(release.size_bytes, 2100);
        assert_eq!(h.db.get_segments(&id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn size_the_peer_cannot_supply_is_asked_for_once() {
        let h = harness().await;
        h.nntp.post(TEST_GROUP, &subject(1, 3), "p1@x", 0);
        let id = bare_release(&h, 1, 1, 17).await;
        add_segment(&h, 1, "p1@x", 0).await;
        let (reconciler, _events) = reconciler(&h);

        let outcome = reconciler.reconcile_release(&id).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Repaired {
                recovered: 0,
                removed: 0,
                part_count: 1
            }
        );
        assert_eq!(h.nntp.lookup_calls.load(Ordering::SeqCst), 1);
        assert!(h.db.get_segments(&id).await.unwrap()[0].size_checked);

        assert_eq!(
            reconciler.reconcile_release(&id).await.unwrap(),
            ReconcileOutcome::AlreadyConsistent
        );
        assert_eq!(h.nntp.lookup_calls.load(Ordering::SeqCst), 1);
        assert!(
            h.db.list_releases_needing_reconciliation(10, None)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn protocol_failure_still_recomputes_counters() {
        let h = harness().await;
        let id = bare_release(&h, 1, 1, 17).await;
        h.nntp.fail_headers.store(true, Ordering::SeqCst);
        let (reconciler, _events) = reconciler(&h);

        assert!(reconciler.reconcile_release(&id).await.is_err());

        let release = h.db.get_release(&id).await.unwrap().unwrap();
        assert!(!release.has_parts);
        assert_eq!(release.part_count, 0);
    }

    #[tokio::test]
    async fn missing_release_is_not_found() {
        let h = harness().await;
        let (reconciler, _events) = reconciler(&h);
        assert!(matches!(
            reconciler.reconcile_release(&release_id()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn scan_isolates_failures_and_pages() {
        let mut config = test_config();
        config.reconcile.scan_batch = 1;
        config.reconcile.staleness = std::time::Duration::from_secs(100 * 365 * 86_400);
        let h = harness_with(config).await;

        for part in 1..=2 {
            h.nntp
                .post(TEST_GROUP, &subject(part, 2), &format!("p{}@x", part), 100);
        }
        // Repairable from the window
        bare_release(&h, 1, 2, 17).await;
        // Source group no longer exists on the server
        let broken = NewRelease {
            release_id: "broken.release:2025-08-18".parse().unwrap(),
            canonical_title: "broken.release".to_string(),
            category_id: 7000,
            source_group: "alt.binaries.gone".to_string(),
            posted_at: Utc.with_ymd_and_hms(2025, 8, 18, 0, 0, 0).unwrap(),
            expected_parts: 1,
            language: "und".to_string(),
            tags: Vec::new(),
            article_low: 1,
            article_high: 1,
        };
        h.db.upsert_release(&broken).await.unwrap();
        // Nothing anywhere
        bare_release(&h, 50, 60, 19).await;

        let (reconciler, _events) = reconciler(&h);
        let report = reconciler.scan(&CancellationToken::new()).await;
        assert_eq!(report.scanned, 3);
        assert_eq!(report.repaired, 1);
        assert_eq!(report.unavailable, 1);
        assert_eq!(report.failed, 1);

        // The repaired release is consistent now and drops out of the scan
        let report = reconciler.scan(&CancellationToken::new()).await;
        assert_eq!(report.repaired, 0);
        assert_eq!(report.scanned, 2);
    }

    /// Five releases that need work; only the first one is repairable
    async fn scan_backlog(h: &Harness) -> Vec<ReleaseId> {
        for part in 1..=3 {
            h.nntp
                .post(TEST_GROUP, &subject(part, 3), &format!("p{}@x", part), 700);
        }
        let mut ids = Vec::new();
        for day in 17..=21 {
            ids.push(bare_release(h, 1, 3, day).await);
        }
        ids
    }

    fn long_staleness() -> Config {
        let mut config = test_config();
        config.reconcile.staleness = std::time::Duration::from_secs(100 * 365 * 86_400);
        config
    }

    #[tokio::test]
    async fn cancelled_scan_stops_after_the_release_in_hand() {
        let h = harness_with(long_staleness()).await;
        let ids = scan_backlog(&h).await;
        let (reconciler, _events) = reconciler(&h);

        let cancel = CancellationToken::new();
        h.nntp.cancel_during_headers(cancel.clone());
        let report = reconciler.scan(&cancel).await;

        assert!(report.interrupted);
        assert_eq!(report.scanned, 1);
        assert_eq!(report.repaired, 1);
        assert_eq!(h.nntp.header_calls.load(Ordering::SeqCst), 1);

        // The release in hand was finished
        let first = h.db.get_release(&ids[0]).await.unwrap().unwrap();
        let segments = h.db.get_segments(&ids[0]).await.unwrap();
        assert_eq!(first.part_count, segments.len() as i64);
        assert_eq!(first.part_count, 3);

        // The rest are untouched and still queued
        for id in &ids[1..] {
            assert_eq!(h.db.get_release(id).await.unwrap().unwrap().part_count, 3);
        }
        let queued = h
            .db
            .list_releases_needing_reconciliation(10, None)
            .await
            .unwrap();
        assert_eq!(queued.len(), 4);
    }

    #[tokio::test]
    async fn run_exits_once_the_current_release_is_done() {
        let mut config = long_staleness();
        config.reconcile.interval = std::time::Duration::from_millis(10);
        let h = harness_with(config).await;
        let ids = scan_backlog(&h).await;
        let (reconciler, _events) = reconciler(&h);

        let cancel = CancellationToken::new();
        h.nntp.cancel_during_headers(cancel.clone());
        tokio::time::timeout(std::time::Duration::from_secs(10), reconciler.run(cancel))
            .await
            .unwrap();

        assert_eq!(h.nntp.header_calls.load(Ordering::SeqCst), 1);
        let first = h.db.get_release(&ids[0]).await.unwrap().unwrap();
        assert_eq!(
            first.part_count,
            h.db.get_segments(&ids[0]).await.unwrap().len() as i64
        );
        assert_eq!(h.db.get_release(&ids[4]).await.unwrap().unwrap().part_count, 3);
    }

    #[tokio::test]
    async fn prune_stale_removes_old_unavailable_releases() {
        let h = harness().await;
        let id = bare_release(&h, 1, 1, 17).await;
        h.db.mark_unavailable(&id).await.unwrap();
        let (reconciler, _events) = reconciler(&h);

        assert_eq!(reconciler.prune_stale().await.unwrap(), 1);
        assert!(h.db.get_release(&id).await.unwrap().is_none());
        assert_eq!(reconciler.prune_stale().await.unwrap(), 0);
    }
}
