//! Core types for usenet-idx

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Stable release key: `<canonical_title>:<YYYY-MM-DD>`
///
/// This format is a public contract consumed by the retrieval-manifest
/// endpoint. Identity is immutable once assigned.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReleaseId(String);

impl ReleaseId {
    /// Build an id from a canonical title and a UTC posting date
    pub fn new(canonical_title: &str, posted_date: NaiveDate) -> Self {
        Self(format!(
            "{}:{}",
            canonical_title,
            posted_date.format("%Y-%m-%d")
        ))
    }

    /// The id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The canonical title portion
    pub fn canonical_title(&self) -> &str {
        self.0
            .rsplit_once(':')
            .map(|(title, _)| title)
            .unwrap_or(&self.0)
    }

    /// The posting date portion, if well formed
    pub fn posted_date(&self) -> Option<NaiveDate> {
        let (_, date) = self.0.rsplit_once(':')?;
        NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
    }
}

impl std::fmt::Display for ReleaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Error returned when a string is not a valid release id
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid release id '{0}': expected <title>:<YYYY-MM-DD>")]
pub struct InvalidReleaseId(pub String);

impl std::str::FromStr for ReleaseId {
    type Err = InvalidReleaseId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (title, date) = s
            .rsplit_once(':')
            .ok_or_else(|| InvalidReleaseId(s.to_string()))?;
        if title.is_empty() || NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
            return Err(InvalidReleaseId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

// Implement sqlx Type, Encode, and Decode for database operations
impl sqlx::Type<sqlx::Sqlite> for ReleaseId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <String as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ReleaseId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ReleaseId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Overview data for one article as returned by the protocol client
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverviewEntry {
    /// Article number within the group
    pub article_number: u64,
    /// Raw subject line
    pub subject: String,
    /// Raw `Date` header
    pub date: String,
    /// Message id, with or without angle brackets
    pub message_id: String,
    /// Article size in bytes (0 when the peer does not report it)
    pub bytes: u64,
}

/// A header that passed validation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArticleHeader {
    /// Group the header was fetched from
    pub group: String,
    /// Article number within the group
    pub article_number: u64,
    /// Raw subject line
    pub subject: String,
    /// Message id without angle brackets
    pub message_id: String,
    /// Posting time (observation time when the `Date` header is unusable)
    pub posted_at: DateTime<Utc>,
    /// Article size in bytes
    pub size_bytes: u64,
}

/// Tagged result of header parsing
///
/// Normalization and identity derivation only ever see the `Valid` variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedHeader {
    /// Usable header
    Valid(ArticleHeader),
    /// Header skipped and counted
    Malformed {
        /// Article number of the rejected header
        article_number: u64,
        /// Why it was rejected
        reason: String,
    },
}

/// Article metadata returned by a message-id lookup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArticleInfo {
    /// Message id without angle brackets
    pub message_id: String,
    /// Raw subject line
    pub subject: String,
    /// Article size in bytes
    pub size_bytes: u64,
}

/// Article number range currently held by the peer for a group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupWatermarks {
    /// Lowest available article number
    pub low: u64,
    /// Highest available article number (high-water mark)
    pub high: u64,
}

/// Result of reconciling one release
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Counters and segments already agreed; nothing was written
    AlreadyConsistent,
    /// Counters were recomputed and/or segments recovered
    Repaired {
        /// Segments recovered from the peer
        recovered: u32,
        /// Segments removed as permanently missing
        removed: u32,
        /// Segment count after repair
        part_count: u32,
    },
    /// No segments could be recovered; the release is flagged unavailable
    MarkedUnavailable,
    /// The release was unrecoverable and past the staleness threshold
    Pruned,
}

/// Event emitted by the ingest loop and reconciliation
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Group patterns were (re-)expanded
    GroupsDiscovered {
        /// Number of groups that will be ingested
        groups: usize,
        /// Patterns whose listing call failed this round
        failed_patterns: Vec<String>,
    },

    /// A header batch was persisted and the cursor advanced
    BatchIngested {
        /// Group name
        group: String,
        /// First article number of the batch
        first: u64,
        /// Last article number of the batch (new cursor)
        last: u64,
        /// Headers that produced a segment write
        processed: u64,
        /// Segments that were new
        inserted: u64,
        /// Headers skipped as malformed
        malformed: u64,
        /// Articles remaining on the server after this batch
        backlog: u64,
    },

    /// A batch was skipped; the cursor was not advanced
    BatchSkipped {
        /// Group name
        group: String,
        /// Why the batch was skipped
        reason: String,
    },

    /// A release went through reconciliation
    ReleaseReconciled {
        /// Release id
        release_id: ReleaseId,
        /// What happened
        outcome: ReconcileOutcome,
    },

    /// A release was deleted from the store and the index
    ReleasePruned {
        /// Release id
        release_id: ReleaseId,
    },

    /// Indexer shutting down
    Shutdown,
}
