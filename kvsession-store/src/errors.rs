//! Store error types
//!
//! `StoreError` covers the record store and its backends. `SessionError` is
//! what callers of the manager and of a session handle see. A missing or
//! expired session is never an error.

use kvsession_core::CoreError;
use thiserror::Error;

/// Record store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Session operation result type
pub type SessionResult<T> = Result<T, SessionError>;

/// Failures surfaced by a record store backend
#[derive(Debug, Error)]
pub enum StoreError {
    /// Driver or I/O failure from the SQL backend
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An insert hit an existing row for the same id
    #[error("Session already exists: {id}")]
    Conflict { id: String },

    /// The store was closed
    #[error("Session store is closed")]
    Closed,

    /// Invalid store configuration (for example a bad table name)
    #[error("Store configuration error: {0}")]
    Config(#[from] CoreError),

    /// Backend failure that is not a driver error
    #[error("Storage backend error: {message}")]
    Backend { message: String },
}

impl StoreError {
    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Map an insert failure, turning a unique-key violation into `Conflict`
    pub(crate) fn from_insert(id: &str, error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) if db_error.is_unique_violation() => Self::Conflict {
                id: id.to_string(),
            },
            _ => Self::Database(error),
        }
    }
}

/// Failures of one reaper pass
#[derive(Debug, Error)]
pub enum ReapError {
    #[error("Counting expired sessions failed: {0}")]
    Count(#[source] StoreError),

    #[error("Deleting expired sessions failed: {0}")]
    Delete(#[source] StoreError),
}

impl ReapError {
    /// Phase name for logs
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Count(_) => "count",
            Self::Delete(_) => "delete",
        }
    }
}

/// Failures returned by the session manager and session handles
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Failed to decode session {session_id}: {source}")]
    Decode {
        session_id: String,
        #[source]
        source: CoreError,
    },

    #[error("Failed to encode session {session_id}: {source}")]
    Encode {
        session_id: String,
        #[source]
        source: CoreError,
    },

    #[error("Session {session_id} encodes to {len} bytes, limit is {limit}")]
    ValueTooLarge {
        session_id: String,
        len: usize,
        limit: usize,
    },

    #[error("Reaper error: {0}")]
    Reap(#[from] ReapError),

    #[error("Configuration error: {0}")]
    Config(#[from] CoreError),
}

impl SessionError {
    /// True when the underlying failure came from storage
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Reap(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_detection() {
        let err = StoreError::Conflict {
            id: "sid".to_string(),
        };
        assert!(err.is_conflict());
        assert!(!StoreError::Closed.is_conflict());
        assert!(!StoreError::from_insert("sid", sqlx::Error::PoolClosed).is_conflict());
    }

    #[test]
    fn test_session_error_wraps_store_error() {
        let err: SessionError = StoreError::backend("disk full").into();
        assert!(err.is_storage());
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_reap_phase_names() {
        assert_eq!(ReapError::Count(StoreError::Closed).phase(), "count");
        assert_eq!(ReapError::Delete(StoreError::Closed).phase(), "delete");
    }
}
