use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::feed::Strategy;

// ============================================================================
// Error Types
// ============================================================================

/// Persistence backend failures
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another process holds the SQLite database lock past the busy timeout
    #[error("Database is locked by another process. Is the scheduler already running?")]
    Locked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stored payload does not decode into the expected shape
    #[error("Corrupt payload under key '{key}': {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Value could not be encoded as JSON
    #[error("Failed to encode payload for key '{key}': {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StorageError {
    /// Classify a sqlx error, mapping SQLite lock contention to [`StorageError::Locked`].
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let message = err.to_string().to_lowercase();
        if message.contains("database is locked")
            || message.contains("database table is locked")
            || message.contains("sqlite_busy")
            || message.contains("sqlite_locked")
        {
            return StorageError::Locked;
        }
        StorageError::Database(err)
    }
}

/// Which field made a registration collide with an existing source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateField {
    Name,
    Identifier,
}

impl fmt::Display for DuplicateField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateField::Name => f.write_str("name"),
            DuplicateField::Identifier => f.write_str("identifier"),
        }
    }
}

/// Errors surfaced by the source registry and article store to their callers.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Registration collides with an existing source
    #[error("A source with the same {field} already exists ({existing})")]
    Duplicate {
        field: DuplicateField,
        existing: Uuid,
    },

    /// Unknown source or item id
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: Uuid },

    /// Caller-supplied data is unusable (e.g. blank name)
    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ============================================================================
// Sources
// ============================================================================

/// Health of a source as of its most recent sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceStatus {
    #[default]
    Active,
    Error,
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceStatus::Active => f.write_str("active"),
            SourceStatus::Error => f.write_str("error"),
        }
    }
}

/// A watched public account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: Uuid,
    pub name: String,
    /// Handle, search term or feed path handed to the fetch strategies
    pub identifier: String,
    pub strategy: Strategy,
    /// True once at least one fetch has succeeded
    pub verified: bool,
    pub status: SourceStatus,
    pub created_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub last_item_count: usize,
    pub last_new_item_count: usize,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Registration payload
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub identifier: String,
    pub strategy: Strategy,
}

impl NewSource {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>, strategy: Strategy) -> Self {
        Self {
            name: name.into(),
            identifier: identifier.into(),
            strategy,
        }
    }
}

/// Outcome of one sync attempt as recorded against the source
#[derive(Debug, Clone)]
pub enum SyncRecord {
    Success { fetched: usize, new: usize },
    Failure { error: String },
}

/// Source with article counters for listings
#[derive(Debug, Clone)]
pub struct SourceSummary {
    pub source: Source,
    pub item_count: usize,
    pub unread_count: usize,
}

// ============================================================================
// Items
// ============================================================================

/// Key under which two items of one source are considered the same article.
///
/// The link wins when present; feeds whose links rotate (tracking parameters,
/// expiring share URLs) fall back to the exact title.
pub fn dedup_key<'a>(link: &'a str, title: &'a str) -> &'a str {
    if link.trim().is_empty() {
        title
    } else {
        link
    }
}

/// A normalized item as produced by a fetch, before it is stored
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedItem {
    pub title: String,
    pub link: String,
    pub summary: String,
    pub author: String,
    pub publish_time: Option<DateTime<Utc>>,
}

impl ParsedItem {
    pub fn dedup_key(&self) -> &str {
        dedup_key(&self.link, &self.title)
    }
}

/// A stored article.
///
/// Content fields are written once at insert; only `is_read` changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: Uuid,
    pub source_id: Uuid,
    pub title: String,
    pub link: String,
    pub summary: String,
    pub author: String,
    pub publish_time: Option<DateTime<Utc>>,
    pub saved_at: DateTime<Utc>,
    pub is_read: bool,
    /// Set only on items returned from the merge that inserted them; never persisted.
    #[serde(skip)]
    pub is_new: bool,
}

impl Item {
    pub fn dedup_key(&self) -> &str {
        dedup_key(&self.link, &self.title)
    }

    /// Date used for ordering and retention: publish time when known, else save time.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.publish_time.unwrap_or(self.saved_at)
    }
}

/// Result of merging one fetch into a source's partition
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    pub inserted_count: usize,
    /// Items inserted by this merge, with `is_new` set
    pub new_items: Vec<Item>,
}
