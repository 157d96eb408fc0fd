//! Error types for usenet-idx
//!
//! This module provides the error taxonomy used across the ingest and
//! resolution engine:
//! - [`ProtocolError`] classifies NNTP failures (timeout, auth, not found, transient)
//! - [`IngestError`] reports per-pattern and per-batch ingest degradation
//! - [`DatabaseError`] wraps store failures with context
//! - [`Error`] is the crate-wide error, with HTTP status mapping via [`ToHttpStatus`]

use std::time::Duration;
use thiserror::Error;

/// Result type alias for usenet-idx operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for usenet-idx
///
/// Each variant carries enough context (dependency name, release id, group)
/// to be logged without the caller re-wrapping it.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "ingest.batch_min")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Ingest degraded for one pattern or batch
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// The breaker guarding a dependency is open; no I/O was attempted
    #[error("circuit breaker open for dependency '{dependency}'")]
    BreakerOpen {
        /// Name of the guarded dependency (e.g., "nntp", "store", "index")
        dependency: String,
    },

    /// A guarded call exceeded its timeout
    #[error("call to '{dependency}' timed out after {}ms", after.as_millis())]
    Timeout {
        /// Name of the guarded dependency
        dependency: String,
        /// The timeout that elapsed
        after: Duration,
    },

    /// A release claims parts that are not on file
    #[error("release {release_id} is inconsistent: {reason}")]
    InconsistentState {
        /// The offending release
        release_id: String,
        /// What did not add up
        reason: String,
    },

    /// A dependency is unavailable (breaker open) for a retrieval call
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Release, group or cursor not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., duplicate key)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Typed failures returned by the protocol client
///
/// The resilience layer uses this classification to decide whether a call is
/// retried and whether it counts against the dependency's breaker.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The peer did not answer in time
    #[error("timeout: {0}")]
    Timeout(String),

    /// Credentials were rejected or encryption is required
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Group or article does not exist on the peer
    #[error("not found: {0}")]
    NotFound(String),

    /// Connection reset, temporary server error, garbled response
    #[error("transient failure: {0}")]
    Transient(String),
}

impl ProtocolError {
    /// Whether the failure may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Timeout(_) | ProtocolError::Transient(_))
    }

    /// Whether the failure is permanent for this request (auth, missing group/article)
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

impl From<nntp_rs::NntpError> for ProtocolError {
    fn from(err: nntp_rs::NntpError) -> Self {
        use nntp_rs::NntpError;

        match err {
            NntpError::Timeout => ProtocolError::Timeout(err.to_string()),
            NntpError::AuthFailed(_) | NntpError::EncryptionRequired(_) => {
                ProtocolError::Auth(err.to_string())
            }
            NntpError::NoSuchGroup(_) | NntpError::NoSuchArticle(_) => {
                ProtocolError::NotFound(err.to_string())
            }
            NntpError::Protocol { code, ref message } => match code {
                // 411 no such group, 423/430 no such article
                411 | 423 | 430 => ProtocolError::NotFound(format!("{code} {message}")),
                // 480 auth required, 481 auth rejected, 502 access denied
                480 | 481 | 502 => ProtocolError::Auth(format!("{code} {message}")),
                _ => ProtocolError::Transient(format!("{code} {message}")),
            },
            other => ProtocolError::Transient(other.to_string()),
        }
    }
}

impl From<nntp_rs::NntpError> for Error {
    fn from(err: nntp_rs::NntpError) -> Self {
        Error::Protocol(err.into())
    }
}

/// Ingest degradation that skips work without stopping the loop
#[derive(Debug, Error)]
pub enum IngestError {
    /// The listing call for a wildcard pattern failed
    #[error("group list unavailable for pattern '{pattern}': {reason}")]
    GroupListUnavailable {
        /// The wildcard pattern that could not be expanded
        pattern: String,
        /// The underlying failure
        reason: String,
    },

    /// A header batch could not be fetched or persisted
    #[error("batch {first}-{last} for group '{group}' skipped: {reason}")]
    BatchFailed {
        /// The group whose batch was skipped
        group: String,
        /// First article number of the batch
        first: u64,
        /// Last article number of the batch
        last: u64,
        /// The underlying failure
        reason: String,
    },
}

/// Convert errors to HTTP status codes for the serving surface
///
/// The request-handling layer lives outside this crate; this trait gives it a
/// stable mapping, including the service-unavailable signal for open breakers.
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,
            Error::NotFound(_) => 404,
            Error::Database(DatabaseError::NotFound(_)) => 404,

            // 409 Conflict - the release exists but cannot be served as-is
            Error::InconsistentState { .. } => 409,

            Error::Database(_) => 500,
            Error::Sqlx(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::Ingest(_) => 500,
            Error::Other(_) => 500,

            // 502 Bad Gateway - upstream NNTP peer failed
            Error::Protocol(_) => 502,

            // 503 Service Unavailable
            Error::BreakerOpen { .. } => 503,
            Error::ServiceUnavailable(_) => 503,
            Error::ShuttingDown => 503,

            // 504 Gateway Timeout
            Error::Timeout { .. } => 504,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) => "database_error",
            Error::Sqlx(_) => "database_error",
            Error::Protocol(e) => match e {
                ProtocolError::Timeout(_) => "nntp_timeout",
                ProtocolError::Auth(_) => "nntp_auth",
                ProtocolError::NotFound(_) => "nntp_not_found",
                ProtocolError::Transient(_) => "nntp_transient",
            },
            Error::Ingest(e) => match e {
                IngestError::GroupListUnavailable { .. } => "group_list_unavailable",
                IngestError::BatchFailed { .. } => "batch_failed",
            },
            Error::BreakerOpen { .. } => "breaker_open",
            Error::Timeout { .. } => "timeout",
            Error::InconsistentState { .. } => "inconsistent_state",
            Error::ServiceUnavailable(_) => "service_unavailable",
            Error::Io(_) => "io_error",
            Error::NotFound(_) => "not_found",
            Error::ShuttingDown => "shutting_down",
            Error::Serialization(_) => "serialization_error",
            Error::Other(_) => "internal_error",
        }
    }
}
