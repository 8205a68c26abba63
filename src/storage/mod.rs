//! Persistence for sources and their discovered items.
//!
//! Everything is stored as JSON under named keys in a [`KvStore`]:
//!
//! - `sources` holds every [`Source`]
//! - `articles/{source_id}` holds one source's [`Item`]s
//! - `articles/_partitions` indexes the non-empty item partitions
//!
//! [`SqliteStore`] is the durable backend, [`MemoryStore`] the process-local
//! one. Both go through the same [`ArticleStore`] and [`SourceRegistry`] code,
//! so merge and dedup behave identically on either.

mod articles;
mod backend;
mod schema;
mod sources;
mod types;

pub use articles::ArticleStore;
pub use backend::{KvStore, MemoryStore, SharedStore};
pub use schema::SqliteStore;
pub use sources::{is_placeholder_identifier, SourceRegistry};
pub use types::{
    dedup_key, DuplicateField, Item, MergeResult, NewSource, ParsedItem, Source, SourceStatus,
    SourceSummary, StorageError, StoreError, SyncRecord,
};
