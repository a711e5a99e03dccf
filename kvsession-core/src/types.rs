//! Session record data model

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Values held by one session, keyed by name.
pub type SessionValues = HashMap<String, serde_json::Value>;

/// Default table name used when none is configured
pub const DEFAULT_TABLE_NAME: &str = "go_session";

/// Maximum length of a session id column
pub const MAX_SESSION_ID_LEN: usize = 255;

/// Maximum length of the encoded value column
pub const DEFAULT_MAX_VALUE_LEN: usize = 2048;

/// One persisted session row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Caller-supplied session id (primary key)
    pub id: String,
    /// Encoded value map; empty when the session holds no values
    pub value: String,
    /// Absolute expiry instant in epoch seconds
    pub expires_at: i64,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, value: impl Into<String>, expires_at: i64) -> Self {
        Self {
            id: id.into(),
            value: value.into(),
            expires_at,
        }
    }

    /// A row is logically gone once `now` reaches its expiry, whether or not
    /// the reaper has deleted it yet.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Classify this row as seen at `now`.
    pub fn classify(self, now: i64) -> RecordLookup {
        if self.is_expired_at(now) {
            RecordLookup::Expired
        } else {
            RecordLookup::Present(self)
        }
    }
}

/// Result of reading a session row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordLookup {
    /// A live row, possibly holding an empty value map
    Present(SessionRecord),
    /// A row exists but its expiry has passed
    Expired,
    /// No row for the id
    Absent,
}

impl RecordLookup {
    /// Classify an optional row read from storage.
    pub fn from_row(row: Option<SessionRecord>, now: i64) -> Self {
        match row {
            Some(record) => record.classify(now),
            None => RecordLookup::Absent,
        }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, RecordLookup::Present(_))
    }

    /// The live record, if any. Expired and absent fold together here.
    pub fn into_record(self) -> Option<SessionRecord> {
        match self {
            RecordLookup::Present(record) => Some(record),
            RecordLookup::Expired | RecordLookup::Absent => None,
        }
    }
}

/// Current time in epoch seconds
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Absolute expiry for a session saved now with the given relative TTL
pub fn expiry_from_now(ttl_secs: i64) -> i64 {
    now_epoch().saturating_add(ttl_secs)
}
