#![cfg(feature = "live-tests")]
//! Tests against a real NNTP provider
//!
//! Gated behind the `live-tests` feature flag. Credentials come from .env
//! (see [`usenet_idx::Config::from_env`] for the variable names); tests skip
//! when `NNTP_HOST` is unset.
//!
//! ```bash
//! cargo test --test live_nntp --features live-tests -- --ignored --nocapture
//! ```

mod common;

use common::load_live_config;
use serial_test::serial;
use std::time::Duration;
use usenet_idx::index::SearchQuery;
use usenet_idx::{Event, Indexer};

/// Connect, ingest one batch from the configured groups and search it
#[tokio::test]
#[ignore]
#[serial]
async fn test_live_ingest_batch() {
    let temp_dir = tempfile::tempdir().unwrap();
    let Some(mut config) = load_live_config(&temp_dir) else {
        eprintln!("Skipping: NNTP credentials not found in .env");
        return;
    };
    config.ingest.batch_min = 100;
    config.reconcile.enabled = false;

    let indexer = Indexer::new(config).await.expect("connect to provider");
    let mut events = indexer.subscribe();
    indexer.start().await.unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            match events.recv().await {
                Ok(Event::BatchIngested {
                    group,
                    first,
                    last,
                    processed,
                    ..
                }) => return Some((group, first, last, processed)),
                Ok(Event::BatchSkipped { group, reason }) => {
                    println!("Batch skipped for {}: {}", group, reason);
                }
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    let (group, first, last, processed) = batch.expect("no batch ingested within 2 minutes");
    println!("Ingested {} headers from {} ({}-{})", processed, group, first, last);
    assert!(last >= first);

    let hits = indexer.search(&SearchQuery::default()).await.unwrap();
    println!("{} releases searchable", hits.len());
    if let Some(hit) = hits.first() {
        let manifest = indexer.manifest(&hit.release_id).await;
        println!("Manifest for {}: {:?}", hit.release_id, manifest.map(|m| m.segments.len()));
    }

    indexer.shutdown().await.unwrap();
}

/// Bad credentials surface as a connection error, not a panic
#[tokio::test]
#[ignore]
#[serial]
async fn test_live_bad_password() {
    let temp_dir = tempfile::tempdir().unwrap();
    let Some(mut config) = load_live_config(&temp_dir) else {
        eprintln!("Skipping: NNTP credentials not found in .env");
        return;
    };
    config.server.password = Some("invalid_password_12345".to_string());

    match Indexer::new(config).await {
        Err(e) => println!("Rejected as expected: {}", e),
        Ok(indexer) => {
            // Pools may connect lazily; the first group call must then fail
            let mut events = indexer.subscribe();
            indexer.start().await.unwrap();
            let skipped = tokio::time::timeout(Duration::from_secs(60), async {
                loop {
                    if let Ok(Event::BatchSkipped { .. }) = events.recv().await {
                        return true;
                    }
                }
            })
            .await
            .unwrap_or(false);
            assert!(skipped, "expected the batch to be skipped with bad credentials");
            indexer.shutdown().await.unwrap();
        }
    }
}
