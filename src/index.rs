//! Search index
//!
//! [`SearchIndex`] is the seam between ingest/reconciliation and whatever
//! backend serves keyword search. The bundled [`SqliteSearchIndex`] keeps an
//! FTS5 table (`release_search`) next to the release store and joins against
//! `releases` at query time, so visibility (`has_parts AND available`) and
//! adult gating always reflect the current store state.

use crate::category::{ADULT_MAX, ADULT_MIN, CategoryPolicy};
use crate::config::SearchConfig;
use crate::db::{Database, Release};
use crate::error::DatabaseError;
use crate::types::ReleaseId;
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, QueryBuilder, Sqlite, sqlite::SqlitePool};

/// Searchable fields of one release
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseDocument {
    /// Document key
    pub release_id: ReleaseId,
    /// Canonical title
    pub title: String,
    /// Lowercased tags
    pub tags: Vec<String>,
}

impl From<&Release> for ReleaseDocument {
    fn from(release: &Release) -> Self {
        Self {
            release_id: release.release_id.clone(),
            title: release.canonical_title.clone(),
            tags: release.tag_list(),
        }
    }
}

/// Search request
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Free text matched against title and tags; `None` lists everything
    pub text: Option<String>,
    /// Category filters; a top-level id (`5000`) matches its children
    #[serde(default)]
    pub categories: Vec<u32>,
    /// Page size; 0 means the configured maximum
    #[serde(default)]
    pub limit: u32,
    /// Results to skip
    #[serde(default)]
    pub offset: u32,
}

impl SearchQuery {
    /// Free-text query with default paging
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Copy with limit and offset clamped to `max_limit`/`max_offset`
    #[must_use]
    pub fn clamped(&self, max_limit: u32, max_offset: u32) -> Self {
        let limit = match self.limit {
            0 => max_limit,
            n => n.min(max_limit),
        };
        Self {
            limit,
            offset: self.offset.min(max_offset),
            ..self.clone()
        }
    }
}

/// One search result
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchHit {
    /// Release id
    pub release_id: ReleaseId,
    /// Canonical title
    pub title: String,
    /// Newznab category id
    pub category_id: u32,
    /// Sum of known segment sizes
    pub size_bytes: u64,
    /// Segments on file
    pub part_count: u32,
    /// Earliest posting time
    pub posted_at: DateTime<Utc>,
    /// ISO 639-1 language code or `und`
    pub language: String,
    /// Lowercased tags
    pub tags: Vec<String>,
}

/// Document store used for keyword search
#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Insert or replace the document for `doc.release_id`
    async fn upsert(&self, doc: &ReleaseDocument) -> Result<()>;

    /// Remove the document for `release_id`; missing documents are not an error
    async fn delete(&self, release_id: &ReleaseId) -> Result<()>;

    /// Run a search under the caller's category policy
    async fn search(&self, query: &SearchQuery, policy: CategoryPolicy) -> Result<Vec<SearchHit>>;
}

/// FTS5-backed index sharing the release store's database
#[derive(Debug, Clone)]
pub struct SqliteSearchIndex {
    pool: SqlitePool,
    max_limit: u32,
    max_offset: u32,
}

impl SqliteSearchIndex {
    /// Index over `db`'s `release_search` table
    pub fn new(db: &Database, config: &SearchConfig) -> Self {
        Self {
            pool: db.pool().clone(),
            max_limit: config.max_limit,
            max_offset: config.max_offset,
        }
    }
}

#[derive(FromRow)]
struct HitRow {
    release_id: ReleaseId,
    canonical_title: String,
    category_id: i64,
    size_bytes: i64,
    part_count: i64,
    posted_at: i64,
    language: String,
    tags: String,
}

impl From<HitRow> for SearchHit {
    fn from(row: HitRow) -> Self {
        SearchHit {
            release_id: row.release_id,
            title: row.canonical_title,
            category_id: row.category_id as u32,
            size_bytes: row.size_bytes as u64,
            part_count: row.part_count as u32,
            posted_at: Utc
                .timestamp_opt(row.posted_at, 0)
                .single()
                .unwrap_or(DateTime::UNIX_EPOCH),
            language: row.language,
            tags: row.tags.split_whitespace().map(str::to_string).collect(),
        }
    }
}

fn index_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::QueryFailed(format!("{}: {}", context, e)))
}

#[async_trait]
impl SearchIndex for SqliteSearchIndex {
    async fn upsert(&self, doc: &ReleaseDocument) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(index_error("Failed to begin index transaction"))?;

        // FTS5 has no conflict clause; replace by delete + insert
        sqlx::query("DELETE FROM release_search WHERE release_id = ?")
            .bind(&doc.release_id)
            .execute(&mut *tx)
            .await
            .map_err(index_error("Failed to replace search document"))?;

        sqlx::query("INSERT INTO release_search (release_id, title, tags) VALUES (?, ?, ?)")
            .bind(&doc.release_id)
            .bind(doc.title.replace('.', " "))
            .bind(doc.tags.join(" "))
            .execute(&mut *tx)
            .await
            .map_err(index_error("Failed to insert search document"))?;

        tx.commit()
            .await
            .map_err(index_error("Failed to commit search document"))?;
        Ok(())
    }

    async fn delete(&self, release_id: &ReleaseId) -> Result<()> {
        sqlx::query("DELETE FROM release_search WHERE release_id = ?")
            .bind(release_id)
            .execute(&self.pool)
            .await
            .map_err(index_error("Failed to delete search document"))?;
        Ok(())
    }

    async fn search(&self, query: &SearchQuery, policy: CategoryPolicy) -> Result<Vec<SearchHit>> {
        let query = query.clamped(self.max_limit, self.max_offset);

        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT r.release_id, r.canonical_title, r.category_id, r.size_bytes,
                   r.part_count, r.posted_at, r.language, r.tags
            FROM release_search
            JOIN releases r ON r.release_id = release_search.release_id
            WHERE r.has_parts = 1 AND r.available = 1
            "#,
        );

        if let Some(expr) = query.text.as_deref().and_then(match_expression) {
            builder.push(" AND release_search MATCH ").push_bind(expr);
        }

        if !policy.adult_visible() {
            builder
                .push(" AND r.category_id NOT BETWEEN ")
                .push_bind(i64::from(ADULT_MIN))
                .push(" AND ")
                .push_bind(i64::from(ADULT_MAX));
        }

        if !query.categories.is_empty() {
            builder.push(" AND (");
            for (i, filter) in query.categories.iter().enumerate() {
                if i > 0 {
                    builder.push(" OR ");
                }
                if filter % 1000 == 0 {
                    builder
                        .push("(r.category_id >= ")
                        .push_bind(i64::from(*filter))
                        .push(" AND r.category_id < ")
                        .push_bind(i64::from(*filter) + 1000)
                        .push(")");
                } else {
                    builder
                        .push("r.category_id = ")
                        .push_bind(i64::from(*filter));
                }
            }
            builder.push(")");
        }

        builder
            .push(" ORDER BY r.posted_at DESC, r.release_id LIMIT ")
            .push_bind(i64::from(query.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset));

        let rows: Vec<HitRow> = builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(index_error("Failed to search releases"))?;

        Ok(rows.into_iter().map(SearchHit::from).collect())
    }
}

/// FTS5 expression matching every word of `text`, or `None` if it has none
///
/// Each word is quoted so user input can never inject FTS5 operators.
fn match_expression(text: &str) -> Option<String> {
    let terms: Vec<String> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}
