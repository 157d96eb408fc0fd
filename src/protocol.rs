//! NNTP protocol client
//!
//! [`ProtocolClient`] is the narrow surface the indexer needs from a news
//! server: list groups, read watermarks, fetch overview data for an article
//! range, and look one article up by message id. [`NntpProtocolClient`] is the
//! production implementation on top of an `nntp-rs` connection pool; tests
//! substitute in-memory fakes.
//!
//! [`parse_header`] turns one raw overview entry into a [`ParsedHeader`].

use crate::config::ServerConfig;
use crate::error::ProtocolError;
use crate::identity;
use crate::types::{
    ArticleHeader, ArticleInfo, GroupWatermarks, OverviewEntry, ParsedHeader,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Operations the indexer performs against a news server
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Group names matching a wildmat pattern
    async fn list_groups(&self, pattern: &str) -> Result<Vec<String>>;

    /// Current low/high article numbers for `group`
    async fn group_watermarks(&self, group: &str) -> Result<GroupWatermarks>;

    /// Overview entries for articles `first..=last` in `group`
    async fn fetch_headers(&self, group: &str, first: u64, last: u64)
    -> Result<Vec<OverviewEntry>>;

    /// Look up a single article by message id
    ///
    /// Returns [`ProtocolError::NotFound`] when the server no longer has it.
    async fn fetch_by_message_id(&self, group: &str, message_id: &str) -> Result<ArticleInfo>;
}

/// [`ProtocolClient`] backed by an `nntp-rs` connection pool
pub struct NntpProtocolClient {
    pool: nntp_rs::NntpPool,
}

impl NntpProtocolClient {
    /// Open a pool of `server.connections` connections
    ///
    /// The pool's own retry loop is disabled; retries happen in the
    /// resilience wrapper so they are visible to the circuit breaker.
    pub async fn connect(server: &ServerConfig) -> Result<Self> {
        let retry = nntp_rs::RetryConfig {
            max_retries: 0,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            backoff_multiplier: 1.0,
            jitter: false,
        };
        let pool = nntp_rs::NntpPool::with_retry_config(
            server.clone().into(),
            server.connections as u32,
            retry,
        )
        .await?;

        tracing::info!(
            host = %server.host,
            port = server.port,
            connections = server.connections,
            "NNTP pool ready"
        );
        Ok(Self { pool })
    }
}

#[async_trait]
impl ProtocolClient for NntpProtocolClient {
    async fn list_groups(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.get().await?;
        let groups = conn.list_active(pattern).await?;
        Ok(groups.into_iter().map(|g| g.name).collect())
    }

    async fn group_watermarks(&self, group: &str) -> Result<GroupWatermarks> {
        let mut conn = self.pool.get().await?;
        let info = conn.select_group(group).await?;
        Ok(GroupWatermarks {
            low: info.first,
            high: info.last,
        })
    }

    async fn fetch_headers(
        &self,
        group: &str,
        first: u64,
        last: u64,
    ) -> Result<Vec<OverviewEntry>> {
        if first > last {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await?;
        conn.select_group(group).await?;

        let entries = match conn.over(&format!("{}-{}", first, last)).await {
            Ok(entries) => entries,
            // 423: nothing left in the range (expired or cancelled)
            Err(nntp_rs::NntpError::Protocol { code: 423, .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(group, first, last, count = entries.len(), "Fetched overview");
        Ok(entries
            .into_iter()
            .map(|e| OverviewEntry {
                article_number: e.article_number,
                subject: e.subject,
                date: e.date,
                message_id: e.message_id,
                bytes: e.bytes as u64,
            })
            .collect())
    }

    async fn fetch_by_message_id(&self, group: &str, message_id: &str) -> Result<ArticleInfo> {
        let mut conn = self.pool.get().await?;
        conn.select_group(group).await?;

        let id = format!("<{}>", strip_angle_brackets(message_id));
        let entry = conn
            .over(&id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Protocol(ProtocolError::NotFound(id.clone())))?;

        Ok(ArticleInfo {
            message_id: strip_angle_brackets(&entry.message_id).to_string(),
            subject: entry.subject,
            size_bytes: entry.bytes as u64,
        })
    }
}

/// Message id without surrounding whitespace and angle brackets
pub fn strip_angle_brackets(message_id: &str) -> &str {
    let trimmed = message_id.trim();
    trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
}

/// Parse an RFC 5322 `Date` header, tolerating a trailing zone comment
///
/// ```
/// use usenet_idx::protocol::parse_date;
///
/// let at = parse_date("Sun, 17 Aug 2025 14:03:00 +0000 (UTC)").unwrap();
/// assert_eq!(at.to_rfc3339(), "2025-08-17T14:03:00+00:00");
/// ```
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let mut value = raw.trim();
    if let Some(idx) = value.rfind('(')
        && value.ends_with(')')
    {
        value = value[..idx].trim_end();
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Validate one overview entry
///
/// `observed_at` stands in for the posting time when the `Date` header cannot
/// be parsed.
pub fn parse_header(entry: &OverviewEntry, group: &str, observed_at: DateTime<Utc>) -> ParsedHeader {
    let malformed = |reason: &str| ParsedHeader::Malformed {
        article_number: entry.article_number,
        reason: reason.to_string(),
    };

    let subject = entry.subject.trim();
    if subject.is_empty() {
        return malformed("empty subject");
    }

    let message_id = strip_angle_brackets(&entry.message_id);
    if message_id.is_empty() {
        return malformed("missing message id");
    }

    let posted_at = parse_date(&entry.date).unwrap_or(observed_at);
    if identity::identify(subject, posted_at).is_none() {
        return malformed("subject has no title");
    }

    ParsedHeader::Valid(ArticleHeader {
        group: group.to_string(),
        article_number: entry.article_number,
        subject: subject.to_string(),
        message_id: message_id.to_string(),
        posted_at,
        size_bytes: entry.bytes,
    })
}
