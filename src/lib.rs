//! # usenet-idx
//!
//! Ingest and resolution engine for a Newznab-style Usenet metadata indexer.
//!
//! The crate walks configured newsgroups batch by batch, turns article
//! overview headers into releases and segments, keeps a full-text index in
//! step with the store, and periodically reconciles releases against the
//! news server. Every external call goes through a per-dependency circuit
//! breaker with bounded retries.
//!
//! ## Quick Start
//!
//! ```no_run
//! use usenet_idx::{Config, Indexer};
//! use usenet_idx::index::SearchQuery;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.server.host = "news.example.com".to_string();
//!     config.groups.groups = vec!["alt.binaries.*".to_string()];
//!
//!     let indexer = Indexer::new(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = indexer.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     indexer.start().await?;
//!     let hits = indexer.search(&SearchQuery::text("some release")).await?;
//!     println!("{} hits", hits.len());
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Segment accounting and consistency checks
pub mod aggregate;
/// Per-dependency circuit breakers
pub mod breaker;
/// Newznab category taxonomy and inference
pub mod category;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Group pattern expansion
pub mod discovery;
/// Error types
pub mod error;
/// Release identity and part markers
pub mod identity;
/// Full-text search index
pub mod index;
/// Top-level indexer handle
pub mod indexer;
/// Header ingest loop
pub mod ingest;
/// Subject normalization, language and tag extraction
pub mod normalize;
/// NNTP client seam
pub mod protocol;
/// Release reconciliation and pruning
pub mod reconcile;
/// Breaker, timeout and retry wrapper for external calls
pub mod resilience;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{DatabaseError, Error, IngestError, ProtocolError, Result, ToHttpStatus};
pub use indexer::{Indexer, Manifest, ManifestSegment};
pub use types::{Event, ReconcileOutcome, ReleaseId};

/// Helper function to run the indexer with graceful signal handling.
///
/// Waits for a termination signal and then calls the indexer's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use usenet_idx::{Config, Indexer, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let indexer = Indexer::new(Config::from_env()?).await?;
///     indexer.start().await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(indexer).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(indexer: Indexer) -> Result<()> {
    wait_for_signal().await;
    indexer.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
