//! Common test utilities for usenet-idx integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use usenet_idx::config::RetryConfig;
use usenet_idx::index::SqliteSearchIndex;
use usenet_idx::protocol::{ProtocolClient, strip_angle_brackets};
use usenet_idx::types::{ArticleInfo, GroupWatermarks, OverviewEntry};
use usenet_idx::{Config, Database, Error, Indexer, ProtocolError, Result};

pub const GROUP: &str = "alt.binaries.teevee";

/// News server held in memory
#[derive(Default)]
pub struct MemoryServer {
    groups: Mutex<BTreeMap<String, Vec<OverviewEntry>>>,
}

impl MemoryServer {
    pub fn with_group(group: &str) -> Self {
        let server = Self::default();
        server
            .groups
            .lock()
            .unwrap()
            .insert(group.to_string(), Vec::new());
        server
    }

    /// Post every part of a multi-part upload
    pub fn post_upload(&self, group: &str, file: &str, parts: u32, bytes: u64) {
        for part in 1..=parts {
            self.post(
                group,
                &format!("[{:02}/{:02}] - \"{}.part{:02}.rar\" yEnc", part, parts, file, part),
                &format!("{}.{}@uploader", file.to_lowercase(), part),
                bytes,
            );
        }
    }

    pub fn post(&self, group: &str, subject: &str, message_id: &str, bytes: u64) {
        let mut groups = self.groups.lock().unwrap();
        let articles = groups.entry(group.to_string()).or_default();
        let article_number = articles.last().map(|a| a.article_number + 1).unwrap_or(1);
        articles.push(OverviewEntry {
            article_number,
            subject: subject.to_string(),
            date: "Mon, 18 Aug 2025 09:30:00 +0000".to_string(),
            message_id: format!("<{}>", message_id),
            bytes,
        });
    }

    /// Remove one article, as a cancel or DMCA notice would
    pub fn remove(&self, message_id: &str) {
        for articles in self.groups.lock().unwrap().values_mut() {
            articles.retain(|a| strip_angle_brackets(&a.message_id) != message_id);
        }
    }
}

#[async_trait]
impl ProtocolClient for MemoryServer {
    async fn list_groups(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .groups
            .lock()
            .unwrap()
            .keys()
            .filter(|g| usenet_idx::discovery::wildmat_matches(pattern, g))
            .cloned()
            .collect())
    }

    async fn group_watermarks(&self, group: &str) -> Result<GroupWatermarks> {
        let groups = self.groups.lock().unwrap();
        let articles = groups
            .get(group)
            .ok_or_else(|| Error::Protocol(ProtocolError::NotFound(group.to_string())))?;
        Ok(GroupWatermarks {
            low: articles.first().map(|a| a.article_number).unwrap_or(0),
            high: articles.last().map(|a| a.article_number).unwrap_or(0),
        })
    }

    async fn fetch_headers(&self, group: &str, first: u64, last: u64) -> Result<Vec<OverviewEntry>> {
        let groups = self.groups.lock().unwrap();
        Ok(groups
            .get(group)
            .map(|articles| {
                articles
                    .iter()
                    .filter(|a| (first..=last).contains(&a.article_number))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_by_message_id(&self, group: &str, message_id: &str) -> Result<ArticleInfo> {
        let wanted = strip_angle_brackets(message_id);
        let groups = self.groups.lock().unwrap();
        groups
            .get(group)
            .and_then(|articles| {
                articles
                    .iter()
                    .find(|a| strip_angle_brackets(&a.message_id) == wanted)
            })
            .map(|a| ArticleInfo {
                message_id: wanted.to_string(),
                subject: a.subject.clone(),
                size_bytes: a.bytes,
            })
            .ok_or_else(|| Error::Protocol(ProtocolError::NotFound(wanted.to_string())))
    }
}

/// Config for `GROUP` with a database under `temp_dir`
pub fn test_config(temp_dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.groups.groups = vec![GROUP.to_string()];
    config.ingest.poll_min = Duration::from_millis(50);
    config.ingest.poll_max = Duration::from_millis(500);
    config.resilience.retry = RetryConfig {
        max_retries: 1,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        backoff_multiplier: 2.0,
        jitter: Duration::ZERO,
    };
    config.persistence.database_path = temp_dir.path().join("index.db");
    config
}

/// Indexer wired to an in-memory server
///
/// Returns the indexer and temp directory (keep temp_dir alive for test duration)
pub async fn memory_indexer(server: Arc<MemoryServer>) -> (Indexer, TempDir) {
    let temp_dir = tempfile::tempdir().unwrap();
    let config = test_config(&temp_dir);
    let db = Database::new(&config.persistence.database_path)
        .await
        .unwrap();
    let index = SqliteSearchIndex::new(&db, &config.search);
    let indexer = Indexer::with_components(config, Arc::new(db), server, Arc::new(index));
    (indexer, temp_dir)
}

/// Load server settings from .env / the environment
///
/// Returns `None` unless `NNTP_HOST` is set.
pub fn load_live_config(temp_dir: &TempDir) -> Option<Config> {
    dotenvy::dotenv().ok();
    std::env::var("NNTP_HOST").ok()?;

    let mut config = Config::from_env().ok()?;
    config.persistence.database_path = temp_dir.path().join("live.db");
    Some(config)
}
