//! Shared test helpers: an in-memory news server and a ready-wired store.

use crate::config::{Config, ResilienceConfig, RetryConfig};
use crate::db::Database;
use crate::discovery::wildmat_matches;
use crate::error::ProtocolError;
use crate::index::SqliteSearchIndex;
use crate::protocol::{ProtocolClient, strip_angle_brackets};
use crate::resilience::Resilience;
use crate::types::{ArticleInfo, GroupWatermarks, OverviewEntry};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

pub(crate) const TEST_GROUP: &str = "alt.binaries.test";
pub(crate) const TEST_DATE: &str = "Sun, 17 Aug 2025 14:03:00 +0000";

/// In-memory news server
#[derive(Default)]
pub(crate) struct FakeNntp {
    groups: Mutex<BTreeMap<String, Vec<OverviewEntry>>>,
    pub(crate) fail_listing: AtomicBool,
    pub(crate) fail_headers: AtomicBool,
    pub(crate) fail_lookups: AtomicBool,
    pub(crate) header_calls: AtomicU32,
    pub(crate) lookup_calls: AtomicU32,
    /// Fired by the next header fetch, to stop a caller mid-unit
    pub(crate) cancel_on_headers: Mutex<Option<CancellationToken>>,
}

impl FakeNntp {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Create an empty group
    pub(crate) fn add_group(&self, group: &str) {
        self.groups
            .lock()
            .unwrap()
            .entry(group.to_string())
            .or_default();
    }

    /// Append an article and return its number
    pub(crate) fn post(&self, group: &str, subject: &str, message_id: &str, bytes: u64) -> u64 {
        let mut groups = self.groups.lock().unwrap();
        let articles = groups.entry(group.to_string()).or_default();
        let article_number = articles.last().map(|a| a.article_number + 1).unwrap_or(1);
        articles.push(OverviewEntry {
            article_number,
            subject: subject.to_string(),
            date: TEST_DATE.to_string(),
            message_id: format!("<{}>", message_id),
            bytes,
        });
        article_number
    }

    /// Drop every article numbered below `low`
    pub(crate) fn expire(&self, group: &str, low: u64) {
        if let Some(articles) = self.groups.lock().unwrap().get_mut(group) {
            articles.retain(|a| a.article_number >= low);
        }
    }

    /// Remove one article by message id
    pub(crate) fn cancel(&self, message_id: &str) {
        for articles in self.groups.lock().unwrap().values_mut() {
            articles.retain(|a| strip_angle_brackets(&a.message_id) != message_id);
        }
    }

    /// Cancel `token` as soon as the next header fetch starts
    pub(crate) fn cancel_during_headers(&self, token: CancellationToken) {
        *self.cancel_on_headers.lock().unwrap() = Some(token);
    }

    /// Change the byte count the server reports for an article
    pub(crate) fn set_size(&self, message_id: &str, bytes: u64) {
        for articles in self.groups.lock().unwrap().values_mut() {
            for article in articles.iter_mut() {
                if strip_angle_brackets(&article.message_id) == message_id {
                    article.bytes = bytes;
                }
            }
        }
    }
}

fn transient(what: &str) -> Error {
    Error::Protocol(ProtocolError::Transient(format!("{} failed", what)))
}

#[async_trait]
impl ProtocolClient for FakeNntp {
    async fn list_groups(&self, pattern: &str) -> Result<Vec<String>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(transient("LIST ACTIVE"));
        }
        Ok(self
            .groups
            .lock()
            .unwrap()
            .keys()
            .filter(|g| wildmat_matches(pattern, g))
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
        self.header_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.cancel_on_headers.lock().unwrap().take() {
            token.cancel();
        }
        if self.fail_headers.load(Ordering::SeqCst) {
            return Err(transient("OVER"));
        }
        let groups = self.groups.lock().unwrap();
        let articles = groups
            .get(group)
            .ok_or_else(|| Error::Protocol(ProtocolError::NotFound(group.to_string())))?;
        Ok(articles
            .iter()
            .filter(|a| (first..=last).contains(&a.article_number))
            .cloned()
            .collect())
    }

    async fn fetch_by_message_id(&self, group: &str, message_id: &str) -> Result<ArticleInfo> {
        self.lookup_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(transient("OVER <id>"));
        }
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

/// Config for one literal test group with fast, jitter-free retries
pub(crate) fn test_config() -> Config {
    let mut config = Config::default();
    config.groups.groups = vec![TEST_GROUP.to_string()];
    config.resilience = ResilienceConfig {
        failure_threshold: 5,
        reset_interval: Duration::from_secs(30),
        call_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: Duration::ZERO,
        },
    };
    config
}

/// Everything a pipeline test needs, backed by a temp-file database
pub(crate) struct Harness {
    pub(crate) _db_file: NamedTempFile,
    pub(crate) config: Arc<Config>,
    pub(crate) db: Arc<Database>,
    pub(crate) nntp: Arc<FakeNntp>,
    pub(crate) index: Arc<SqliteSearchIndex>,
    pub(crate) resilience: Resilience,
}

pub(crate) async fn harness_with(config: Config) -> Harness {
    let db_file = NamedTempFile::new().unwrap();
    let db = Database::new(db_file.path()).await.unwrap();
    let index = SqliteSearchIndex::new(&db, &config.search);
    let nntp = FakeNntp::new();
    nntp.add_group(TEST_GROUP);
    Harness {
        _db_file: db_file,
        resilience: Resilience::new(&config.resilience),
        config: Arc::new(config),
        db: Arc::new(db),
        nntp: Arc::new(nntp),
        index: Arc::new(index),
    }
}

pub(crate) async fn harness() -> Harness {
    harness_with(test_config()).await
}
