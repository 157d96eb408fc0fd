//! Top-level indexer handle
//!
//! [`Indexer`] owns the store, the NNTP client, the search index and the
//! shared breaker registry, and runs the ingest loop and the reconciliation
//! scheduler as background tasks. It also carries the read-side calls an
//! HTTP layer would sit on: search, manifest lookup and takedown.

use crate::breaker::BreakerState;
use crate::category::{CategoryPolicy, Taxonomy};
use crate::config::Config;
use crate::db::{Database, Release, Segment};
use crate::discovery::is_ignored;
use crate::index::{SearchHit, SearchIndex, SearchQuery, SqliteSearchIndex};
use crate::ingest::{IngestLoop, IngestWorker};
use crate::protocol::{NntpProtocolClient, ProtocolClient};
use crate::reconcile::{Reconciler, ScanReport};
use crate::resilience::{INDEX, NNTP, Resilience, STORE};
use crate::types::{Event, ReconcileOutcome, ReleaseId};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A release together with its segments in part order
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    /// Release id
    pub release_id: ReleaseId,
    /// Canonical title
    pub title: String,
    /// Newznab category id
    pub category_id: u32,
    /// Total size of all segments
    pub size_bytes: u64,
    /// Segments in part order
    pub segments: Vec<ManifestSegment>,
}

/// One entry of a [`Manifest`]
#[derive(Debug, Clone, Serialize)]
pub struct ManifestSegment {
    /// Part number
    pub number: u32,
    /// Message id without angle brackets
    pub message_id: String,
    /// Group the article was seen in
    pub group: String,
    /// Article size
    pub size_bytes: u64,
}

impl Manifest {
    fn new(release: &Release, segments: Vec<Segment>) -> Self {
        Self {
            release_id: release.release_id.clone(),
            title: release.canonical_title.clone(),
            category_id: release.category_id as u32,
            size_bytes: release.size_bytes as u64,
            segments: segments
                .into_iter()
                .map(|s| ManifestSegment {
                    number: s.segment_number as u32,
                    message_id: s.message_id,
                    group: s.group_name,
                    size_bytes: s.size_bytes as u64,
                })
                .collect(),
        }
    }
}

/// Main indexer instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Indexer {
    /// Release store
    /// Public for integration tests to inspect persisted state
    pub db: Arc<Database>,
    config: Arc<Config>,
    protocol: Arc<dyn ProtocolClient>,
    index: Arc<dyn SearchIndex>,
    resilience: Resilience,
    taxonomy: Arc<Taxonomy>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Indexer {
    /// Create a new Indexer instance
    ///
    /// Validates the configuration, opens (and migrates) the database and
    /// connects the NNTP pool. Background tasks start with [`Indexer::start`].
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::new(&config.persistence.database_path).await?;
        let protocol = NntpProtocolClient::connect(&config.server).await?;
        let index = SqliteSearchIndex::new(&db, &config.search);

        Ok(Self::with_components(
            config,
            Arc::new(db),
            Arc::new(protocol),
            Arc::new(index),
        ))
    }

    /// Wire an indexer from already-built collaborators
    pub fn with_components(
        config: Config,
        db: Arc<Database>,
        protocol: Arc<dyn ProtocolClient>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        // Buffer size of 1000 events per subscriber
        let (event_tx, _rx) = broadcast::channel(1000);
        let resilience = Resilience::new(&config.resilience);

        Self {
            db,
            config: Arc::new(config),
            protocol,
            index,
            resilience,
            taxonomy: Arc::new(Taxonomy::default()),
            event_tx,
            cancel: CancellationToken::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Category id to name map
    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    /// Adult-content gating from the search configuration
    pub fn category_policy(&self) -> CategoryPolicy {
        CategoryPolicy {
            safesearch: self.config.search.safesearch,
            allow_xxx: self.config.search.allow_xxx,
        }
    }

    /// Breaker state of `dependency` (`"nntp"`, `"store"` or `"index"`)
    pub fn breaker_state(&self, dependency: &str) -> BreakerState {
        self.resilience.breakers().state(dependency)
    }

    /// Subscribe to indexer events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.config.clone(),
            self.db.clone(),
            self.protocol.clone(),
            self.index.clone(),
            self.resilience.clone(),
            self.event_tx.clone(),
        )
    }

    /// Prune ignored groups, then spawn the ingest loop and the reconciler
    ///
    /// # Errors
    ///
    /// [`Error::ShuttingDown`] after [`Indexer::shutdown`]; store errors from
    /// the pruning step.
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        self.prune_ignored_groups().await?;

        let mut tasks = self.tasks.lock().await;

        let worker = IngestWorker::new(
            self.config.clone(),
            self.db.clone(),
            self.protocol.clone(),
            self.index.clone(),
            self.resilience.clone(),
            self.event_tx.clone(),
        );
        tasks.push(tokio::spawn(
            IngestLoop::new(worker).run(self.cancel.child_token()),
        ));

        if self.config.reconcile.enabled {
            tasks.push(tokio::spawn(
                self.reconciler().run(self.cancel.child_token()),
            ));
        }

        tracing::info!(
            patterns = ?self.config.groups.patterns(),
            reconcile = self.config.reconcile.enabled,
            "Indexer started"
        );
        Ok(())
    }

    /// Delete releases (and cursors) of groups now in the ignore set
    ///
    /// Returns the number of releases deleted.
    pub async fn prune_ignored_groups(&self) -> Result<usize> {
        let ignore = &self.config.groups.ignore;
        if ignore.is_empty() {
            return Ok(0);
        }

        let groups = self
            .resilience
            .call(STORE, || self.db.list_known_groups())
            .await?;

        let mut pruned = 0;
        for group in groups {
            if !is_ignored(&group, ignore) {
                continue;
            }
            let ids = self
                .resilience
                .call(STORE, || self.db.delete_group(&group))
                .await?;
            for release_id in &ids {
                let index = &*self.index;
                if let Err(e) = self.resilience.call(INDEX, || index.delete(release_id)).await {
                    tracing::warn!(release_id = %release_id, error = %e, "Failed to remove search document");
                }
            }
            tracing::info!(group = %group, releases = ids.len(), "Pruned ignored group");
            pruned += ids.len();
        }
        Ok(pruned)
    }

    /// Full-text search under the configured category policy
    ///
    /// Returns an empty result set while the index breaker is open.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        if self.resilience.is_open(INDEX) {
            tracing::debug!("Index breaker open, returning empty search result");
            return Ok(Vec::new());
        }

        let policy = self.category_policy();
        let index = &*self.index;
        match self.resilience.call(INDEX, || index.search(query, policy)).await {
            Ok(hits) => Ok(hits),
            Err(Error::BreakerOpen { .. }) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Release and its ordered segments for download clients
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceUnavailable`] while the store or NNTP breaker is open
    /// - [`Error::NotFound`] for unknown, unavailable or not-yet-complete releases
    /// - [`Error::InconsistentState`] when the release claims parts it does not have
    pub async fn manifest(&self, release_id: &ReleaseId) -> Result<Manifest> {
        for dependency in [STORE, NNTP] {
            if self.resilience.is_open(dependency) {
                return Err(Error::ServiceUnavailable(format!(
                    "{} circuit breaker is open",
                    dependency
                )));
            }
        }

        let unavailable = |e: Error| match e {
            Error::BreakerOpen { dependency } => {
                Error::ServiceUnavailable(format!("{} circuit breaker is open", dependency))
            }
            other => other,
        };

        let release = self
            .resilience
            .call(STORE, || self.db.get_release(release_id))
            .await
            .map_err(unavailable)?
            .ok_or_else(|| Error::NotFound(format!("release {}", release_id)))?;

        if !release.available {
            return Err(Error::NotFound(format!(
                "release {} is unavailable",
                release_id
            )));
        }

        let segments = self
            .resilience
            .call(STORE, || self.db.get_segments(release_id))
            .await
            .map_err(unavailable)?;

        match (release.has_parts, segments.is_empty()) {
            (true, true) => Err(Error::InconsistentState {
                release_id: release_id.to_string(),
                reason: "has_parts is set but no segments are stored".to_string(),
            }),
            (false, _) => Err(Error::NotFound(format!(
                "release {} has no parts yet",
                release_id
            ))),
            (true, false) => Ok(Manifest::new(&release, segments)),
        }
    }

    /// Remove a release from search and flag it unavailable
    ///
    /// The release stays down: reconciliation and ingest never re-enable it.
    pub async fn takedown(&self, release_id: &ReleaseId) -> Result<()> {
        let index = &*self.index;
        self.resilience
            .call(INDEX, || index.delete(release_id))
            .await?;

        let existed = self
            .resilience
            .call(STORE, || self.db.take_down(release_id))
            .await?;
        if !existed {
            return Err(Error::NotFound(format!("release {}", release_id)));
        }

        tracing::info!(release_id = %release_id, "Release taken down");
        Ok(())
    }

    /// Targeted reconciliation of one release
    pub async fn reconcile_release(&self, release_id: &ReleaseId) -> Result<ReconcileOutcome> {
        self.reconciler().reconcile_release(release_id).await
    }

    /// Reconcile every release that needs it, then prune stale ones
    ///
    /// Stops between releases once shutdown begins.
    pub async fn reconcile_all(&self) -> ScanReport {
        self.reconciler().scan(&self.cancel).await
    }

    /// Gracefully shut down the indexer
    ///
    /// 1. Cancels the background tasks (an in-flight batch or scan finishes)
    /// 2. Waits for them with a timeout (30 seconds)
    /// 3. Emits [`Event::Shutdown`]
    /// 4. Closes the database pool
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let shutdown_timeout = std::time::Duration::from_secs(30);
        let wait_result =
            tokio::time::timeout(shutdown_timeout, futures::future::join_all(handles)).await;

        match wait_result {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Background task ended abnormally");
                    }
                }
                tracing::info!("Background tasks stopped");
            }
            Err(_) => {
                tracing::warn!("Timeout waiting for background tasks, proceeding with shutdown");
            }
        }

        // send() returns Err if there are no receivers, which is fine
        self.event_tx.send(Event::Shutdown).ok();

        self.db.pool().close().await;
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
