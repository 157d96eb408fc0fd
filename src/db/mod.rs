//! Database layer for usenet-idx
//!
//! Handles SQLite persistence for releases, their segments, and per-group
//! ingest cursors.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`]: Database lifecycle, schema migrations
//! - [`releases`]: Release upserts, availability flags, pruning
//! - [`segments`]: Segment writes with transactional counter aggregation
//! - [`cursors`]: Per-group article cursors
//!
//! Every segment insert or delete updates the owning release's
//! `part_count`/`size_bytes`/`has_parts` in the same transaction, using the
//! pure functions in [`crate::aggregate`].

use crate::aggregate::ReleaseCounters;
use crate::error::DatabaseError;
use crate::types::ReleaseId;
use crate::Error;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};

mod cursors;
mod migrations;
mod releases;
mod segments;

/// Release to be created (or widened) by an ingest batch
#[derive(Debug, Clone)]
pub struct NewRelease {
    /// Stable release key
    pub release_id: ReleaseId,
    /// Canonical title
    pub canonical_title: String,
    /// Newznab category id, fixed at creation
    pub category_id: u32,
    /// Group the first segment was seen in
    pub source_group: String,
    /// Earliest posting time seen for this release
    pub posted_at: DateTime<Utc>,
    /// Largest part total declared by a subject
    pub expected_parts: u32,
    /// ISO 639-1 language code or `und`
    pub language: String,
    /// Lowercased bracket tags
    pub tags: Vec<String>,
    /// Lowest article number seen for this release in `source_group`
    pub article_low: u64,
    /// Highest article number seen for this release in `source_group`
    pub article_high: u64,
}

/// Release record from database
#[derive(Debug, Clone, FromRow)]
pub struct Release {
    /// Stable release key
    pub release_id: ReleaseId,
    /// Canonical title
    pub canonical_title: String,
    /// Newznab category id
    pub category_id: i64,
    /// Group the first segment was seen in
    pub source_group: String,
    /// Unix timestamp of the earliest segment
    pub posted_at: i64,
    /// `YYYY-MM-DD` UTC posting date
    pub posted_date: String,
    /// Sum of known segment sizes
    pub size_bytes: i64,
    /// Segments on file
    pub part_count: i64,
    /// Largest declared part total
    pub expected_parts: i64,
    /// Readiness gate for search visibility
    pub has_parts: bool,
    /// Cleared when reconciliation cannot recover any segment
    pub available: bool,
    /// Unix timestamp when the release was flagged unavailable
    pub unavailable_since: Option<i64>,
    /// Removed by an operator; never re-enabled by reconciliation
    pub taken_down: bool,
    /// ISO 639-1 language code or `und`
    pub language: String,
    /// Space-separated lowercased tags
    pub tags: String,
    /// Lowest article number seen in `source_group`
    pub article_low: i64,
    /// Highest article number seen in `source_group`
    pub article_high: i64,
    /// Unix timestamp when the release was created
    pub created_at: i64,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

impl Release {
    /// Completeness counters as stored
    pub fn counters(&self) -> ReleaseCounters {
        ReleaseCounters {
            part_count: self.part_count as u32,
            size_bytes: self.size_bytes as u64,
            has_parts: self.has_parts,
        }
    }

    /// Posting time as a UTC timestamp
    pub fn posted_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.posted_at, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Tags as a list
    pub fn tag_list(&self) -> Vec<String> {
        self.tags.split_whitespace().map(str::to_string).collect()
    }
}

/// New segment to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewSegment {
    /// Owning release
    pub release_id: ReleaseId,
    /// Position within the release (part index, 1 when undeclared)
    pub segment_number: u32,
    /// Message id without angle brackets
    pub message_id: String,
    /// Group the article was fetched from
    pub group_name: String,
    /// Article size in bytes (0 when unknown)
    pub size_bytes: u64,
}

/// Segment record from database
#[derive(Debug, Clone, FromRow)]
pub struct Segment {
    /// Owning release
    pub release_id: ReleaseId,
    /// Position within the release
    pub segment_number: i64,
    /// Message id without angle brackets
    pub message_id: String,
    /// Group the article was fetched from
    pub group_name: String,
    /// Article size in bytes (0 when unknown)
    pub size_bytes: i64,
    /// The peer was asked for the size and did not know it
    pub size_checked: bool,
    /// Unix timestamp when the segment was stored
    pub created_at: i64,
}

/// Group cursor record from database
#[derive(Debug, Clone, FromRow)]
pub struct Cursor {
    /// Group name
    pub group_name: String,
    /// Highest article number durably processed
    pub last_article_number: i64,
    /// Unix timestamp of the last advance
    pub updated_at: i64,
}

/// Everything one ingest batch writes, committed in a single transaction
#[derive(Debug, Clone, Default)]
pub struct BatchWrite {
    /// Group the batch was fetched from
    pub group: String,
    /// Last article number covered by the batch (new cursor position)
    pub last_article: u64,
    /// Releases referenced by the batch
    pub releases: Vec<NewRelease>,
    /// Segments parsed from the batch
    pub segments: Vec<NewSegment>,
}

/// Result of a committed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Segments that were new
    pub inserted: u64,
    /// Segments already on file
    pub duplicates: u64,
    /// Releases whose counters changed
    pub changed: Vec<ReleaseId>,
}

/// Database handle for usenet-idx
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Map a sqlx error to a query failure with context
fn query_failed(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
