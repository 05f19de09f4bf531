//! Store error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::Version;

/// Errors surfaced by the entity store, lease manager and backends
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StoreError {
    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: Version,
        actual: Version,
    },

    #[error("Lease conflict on {key}: held by {owner} until {expires_at}")]
    LeaseConflict {
        key: String,
        owner: String,
        expires_at: i64,
    },

    #[error("Invalid lease token for {0}")]
    InvalidToken(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Check if the caller should retry with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::StoreUnavailable(_))
    }

    /// Stable machine-readable name, used on the wire
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::VersionConflict { .. } => "version_conflict",
            StoreError::LeaseConflict { .. } => "lease_conflict",
            StoreError::InvalidToken(_) => "invalid_token",
            StoreError::StoreUnavailable(_) => "store_unavailable",
            StoreError::Backend(_) => "backend",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy
                        | ErrorCode::DatabaseLocked
                        | ErrorCode::SystemIoFailure
                        | ErrorCode::CannotOpen
                        | ErrorCode::OutOfMemory
                ) =>
            {
                StoreError::StoreUnavailable(e.to_string())
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}
