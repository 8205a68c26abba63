use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::articles::ArticleStore;
use super::backend::{read_json, write_json, SharedStore};
use super::types::{
    DuplicateField, NewSource, Source, SourceStatus, StorageError, StoreError, SyncRecord,
};

const SOURCES_KEY: &str = "sources";

/// Identifier values that carry no identity and must never collide.
const PLACEHOLDER_IDENTIFIERS: &[&str] = &["unknown", "none", "n/a", "-", "null"];

/// True for empty or sentinel identifiers, which are ignored by duplicate checks.
pub fn is_placeholder_identifier(identifier: &str) -> bool {
    let trimmed = identifier.trim();
    trimmed.is_empty()
        || PLACEHOLDER_IDENTIFIERS
            .iter()
            .any(|p| trimmed.eq_ignore_ascii_case(p))
}

/// Durable registry of watched sources and their last-known sync state.
///
/// Removal cascades into the [`ArticleStore`]. Mutations are serialized on a
/// registry-wide lock so a sync bookkeeping update can never overwrite a
/// concurrent registration.
#[derive(Clone)]
pub struct SourceRegistry {
    kv: SharedStore,
    articles: ArticleStore,
    write_lock: Arc<Mutex<()>>,
    failure_threshold: u32,
}

impl SourceRegistry {
    pub fn new(kv: SharedStore, articles: ArticleStore) -> Self {
        Self {
            kv,
            articles,
            write_lock: Arc::new(Mutex::new(())),
            failure_threshold: 1,
        }
    }

    /// Consecutive failures needed before a source is flagged `error` (minimum 1).
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    async fn load(&self) -> Result<Vec<Source>, StorageError> {
        Ok(read_json(&*self.kv, SOURCES_KEY).await?.unwrap_or_default())
    }

    async fn save(&self, sources: &[Source]) -> Result<(), StorageError> {
        write_json(&*self.kv, SOURCES_KEY, sources).await
    }

    /// Register a new source.
    ///
    /// A matching name is checked first and reported as
    /// [`DuplicateField::Name`]; otherwise an identifier equal to an existing
    /// one is reported as [`DuplicateField::Identifier`]. Names compare after
    /// trimming, case-sensitive. Placeholder identifiers never collide.
    ///
    /// # Errors
    ///
    /// - `StoreError::Invalid` for a blank name, or a blank identifier
    /// - `StoreError::Duplicate` on collision; nothing is written
    pub async fn add(&self, new: NewSource, verified: bool) -> Result<Source, StoreError> {
        let name = new.name.trim().to_string();
        let identifier = new.identifier.trim().to_string();
        if name.is_empty() {
            return Err(StoreError::Invalid("source name is empty".to_string()));
        }
        if identifier.is_empty() {
            return Err(StoreError::Invalid("source identifier is empty".to_string()));
        }

        let _guard = self.write_lock.lock().await;
        let mut sources = self.load().await?;

        if let Some(existing) = sources.iter().find(|s| s.name == name) {
            return Err(StoreError::Duplicate {
                field: DuplicateField::Name,
                existing: existing.id,
            });
        }
        if !is_placeholder_identifier(&identifier) {
            if let Some(existing) = sources.iter().find(|s| s.identifier == identifier) {
                return Err(StoreError::Duplicate {
                    field: DuplicateField::Identifier,
                    existing: existing.id,
                });
            }
        }

        let source = Source {
            id: Uuid::new_v4(),
            name,
            identifier,
            strategy: new.strategy,
            verified,
            status: SourceStatus::Active,
            created_at: Utc::now(),
            last_checked_at: None,
            last_item_count: 0,
            last_new_item_count: 0,
            consecutive_failures: 0,
            last_error: None,
        };
        sources.push(source.clone());
        self.save(&sources).await?;

        tracing::info!(
            source_id = %source.id,
            name = %source.name,
            strategy = %source.strategy,
            verified = verified,
            "Source registered"
        );
        Ok(source)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Source>, StorageError> {
        Ok(self.load().await?.into_iter().find(|s| s.id == id))
    }

    /// All sources ordered by name.
    pub async fn list(&self) -> Result<Vec<Source>, StorageError> {
        let mut sources = self.load().await?;
        sources.sort_by(|a, b| a.name.cmp(&b.name).then(a.created_at.cmp(&b.created_at)));
        Ok(sources)
    }

    /// Remove a source and all of its items.
    pub async fn remove(&self, id: Uuid) -> Result<Source, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut sources = self.load().await?;

        let pos = sources
            .iter()
            .position(|s| s.id == id)
            .ok_or(StoreError::NotFound { kind: "source", id })?;
        let removed = sources.remove(pos);
        self.save(&sources).await?;

        let items = self.articles.delete_by_source(id).await?;
        tracing::info!(source_id = %id, name = %removed.name, items = items, "Source removed");
        Ok(removed)
    }

    /// Record the outcome of a sync against the source.
    ///
    /// Success marks the source verified and `active` and resets the failure
    /// streak. Failure zeroes the counters, records the error and flips the
    /// status to `error` once the streak reaches the failure threshold.
    pub async fn update_after_sync(&self, id: Uuid, record: &SyncRecord) -> Result<Source, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut sources = self.load().await?;

        let source = sources
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or(StoreError::NotFound { kind: "source", id })?;

        let previous = source.status;
        source.last_checked_at = Some(Utc::now());
        match record {
            SyncRecord::Success { fetched, new } => {
                source.last_item_count = *fetched;
                source.last_new_item_count = *new;
                source.verified = true;
                source.status = SourceStatus::Active;
                source.consecutive_failures = 0;
                source.last_error = None;
            }
            SyncRecord::Failure { error } => {
                source.last_item_count = 0;
                source.last_new_item_count = 0;
                source.consecutive_failures = source.consecutive_failures.saturating_add(1);
                source.last_error = Some(error.clone());
                if source.consecutive_failures >= self.failure_threshold {
                    source.status = SourceStatus::Error;
                }
            }
        }

        if previous != source.status {
            match source.status {
                SourceStatus::Error => tracing::warn!(
                    source_id = %id,
                    failures = source.consecutive_failures,
                    error = source.last_error.as_deref().unwrap_or_default(),
                    "Source entered error state"
                ),
                SourceStatus::Active => {
                    tracing::info!(source_id = %id, "Source recovered")
                }
            }
        }

        let updated = source.clone();
        self.save(&sources).await?;
        Ok(updated)
    }

    /// Collapse sources sharing the same (name, identifier) pair.
    ///
    /// The earliest created row of each pair survives; the others are removed
    /// along with their items. Idempotent.
    ///
    /// # Returns
    ///
    /// Ids of the removed sources.
    pub async fn deduplicate(&self) -> Result<Vec<Uuid>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut sources = self.load().await?;

        let mut ordered: Vec<&Source> = sources.iter().collect();
        ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        let mut seen = HashSet::new();
        let mut doomed = HashSet::new();
        for source in ordered {
            if !seen.insert((source.name.as_str(), source.identifier.as_str())) {
                doomed.insert(source.id);
            }
        }

        if doomed.is_empty() {
            return Ok(Vec::new());
        }

        sources.retain(|s| !doomed.contains(&s.id));
        self.save(&sources).await?;

        let removed: Vec<Uuid> = doomed.into_iter().collect();
        for id in &removed {
            self.articles.delete_by_source(*id).await?;
        }
        tracing::info!(removed = removed.len(), "Duplicate sources collapsed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::Strategy;
    use crate::storage::{KvStore, MemoryStore, ParsedItem};
    use pretty_assertions::assert_eq;

    fn registry() -> (SourceRegistry, ArticleStore) {
        let kv: SharedStore = Arc::new(MemoryStore::new());
        let articles = ArticleStore::new(kv.clone());
        (SourceRegistry::new(kv, articles.clone()), articles)
    }

    fn poetry() -> NewSource {
        NewSource::new("Poetry Weekly", "poetry-weekly", Strategy::Auto)
    }

    fn item(link: &str) -> ParsedItem {
        ParsedItem {
            title: link.to_string(),
            link: link.to_string(),
            summary: String::new(),
            author: String::new(),
            publish_time: None,
        }
    }

    #[test]
    fn test_placeholder_identifiers() {
        assert!(is_placeholder_identifier(""));
        assert!(is_placeholder_identifier("  "));
        assert!(is_placeholder_identifier("unknown"));
        assert!(is_placeholder_identifier("UNKNOWN"));
        assert!(is_placeholder_identifier("N/A"));
        assert!(!is_placeholder_identifier("poetry-weekly"));
    }

    #[tokio::test]
    async fn test_add_and_get() {
        let (registry, _) = registry();
        let source = registry.add(poetry(), false).await.unwrap();

        assert_eq!(source.name, "Poetry Weekly");
        assert_eq!(source.status, SourceStatus::Active);
        assert!(!source.verified);
        assert!(source.last_checked_at.is_none());
        assert_eq!(registry.get(source.id).await.unwrap(), Some(source));
    }

    #[tokio::test]
    async fn test_add_trims_fields() {
        let (registry, _) = registry();
        let source = registry
            .add(NewSource::new("  Spaced  ", " handle ", Strategy::Feed), true)
            .await
            .unwrap();
        assert_eq!(source.name, "Spaced");
        assert_eq!(source.identifier, "handle");
    }

    #[tokio::test]
    async fn test_add_rejects_blank_name() {
        let (registry, _) = registry();
        let err = registry
            .add(NewSource::new("  ", "x", Strategy::Auto), false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let (registry, _) = registry();
        let first = registry.add(poetry(), false).await.unwrap();

        let err = registry
            .add(NewSource::new("Poetry Weekly", "other-handle", Strategy::Mirror), false)
            .await
            .unwrap_err();
        match err {
            StoreError::Duplicate { field, existing } => {
                assert_eq!(field, DuplicateField::Name);
                assert_eq!(existing, first.id);
            }
            e => panic!("Expected Duplicate, got {:?}", e),
        }
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_identifier_rejected() {
        let (registry, _) = registry();
        registry.add(poetry(), false).await.unwrap();

        let err = registry
            .add(NewSource::new("Another Name", "poetry-weekly", Strategy::Auto), false)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Duplicate {
                field: DuplicateField::Identifier,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_name_wins_when_both_collide() {
        let (registry, _) = registry();
        let a = registry
            .add(NewSource::new("A", "handle-a", Strategy::Auto), false)
            .await
            .unwrap();
        let b = registry
            .add(NewSource::new("B", "handle-b", Strategy::Auto), false)
            .await
            .unwrap();

        // Name matches A, identifier matches B: reported against A by name
        let err = registry
            .add(NewSource::new("A", "handle-b", Strategy::Auto), false)
            .await
            .unwrap_err();
        match err {
            StoreError::Duplicate { field, existing } => {
                assert_eq!(field, DuplicateField::Name);
                assert_eq!(existing, a.id);
                assert_ne!(existing, b.id);
            }
            e => panic!("Expected Duplicate, got {:?}", e),
        }
    }

    #[tokio::test]
    async fn test_placeholder_identifier_never_collides() {
        let (registry, _) = registry();
        registry
            .add(NewSource::new("First", "unknown", Strategy::Search), false)
            .await
            .unwrap();
        registry
            .add(NewSource::new("Second", "Unknown", Strategy::Search), false)
            .await
            .unwrap();
        assert_eq!(registry.list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_list_sorted_by_name() {
        let (registry, _) = registry();
        for name in ["Zeta", "Alpha", "Mu"] {
            registry
                .add(NewSource::new(name, name.to_lowercase(), Strategy::Auto), false)
                .await
                .unwrap();
        }
        let names: Vec<_> = registry
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["Alpha", "Mu", "Zeta"]);
    }

    #[tokio::test]
    async fn test_remove_cascades_to_items() {
        let (registry, articles) = registry();
        let source = registry.add(poetry(), false).await.unwrap();
        articles.merge(source.id, &[item("l1"), item("l2")]).await.unwrap();

        let removed = registry.remove(source.id).await.unwrap();
        assert_eq!(removed.id, source.id);
        assert_eq!(registry.get(source.id).await.unwrap(), None);
        assert_eq!(articles.count_by_source(source.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_unknown() {
        let (registry, _) = registry();
        let err = registry.remove(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { kind: "source", .. }));
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let (registry, _) = registry();
        let source = registry.add(poetry(), false).await.unwrap();

        let failed = registry
            .update_after_sync(
                source.id,
                &SyncRecord::Failure {
                    error: "All fetch methods failed".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.status, SourceStatus::Error);
        assert_eq!(failed.consecutive_failures, 1);
        assert!(failed.last_checked_at.is_some());
        assert!(!failed.verified);

        let recovered = registry
            .update_after_sync(source.id, &SyncRecord::Success { fetched: 5, new: 5 })
            .await
            .unwrap();
        assert_eq!(recovered.status, SourceStatus::Active);
        assert_eq!(recovered.consecutive_failures, 0);
        assert_eq!(recovered.last_error, None);
        assert_eq!(recovered.last_item_count, 5);
        assert_eq!(recovered.last_new_item_count, 5);
        assert!(recovered.verified);
    }

    #[tokio::test]
    async fn test_failure_threshold() {
        let (registry, _) = registry();
        let registry = registry.with_failure_threshold(3);
        let source = registry.add(poetry(), true).await.unwrap();
        let failure = SyncRecord::Failure {
            error: "timeout".to_string(),
        };

        for expected in [SourceStatus::Active, SourceStatus::Active, SourceStatus::Error] {
            let updated = registry.update_after_sync(source.id, &failure).await.unwrap();
            assert_eq!(updated.status, expected);
        }
    }

    #[tokio::test]
    async fn test_update_unknown_source() {
        let (registry, _) = registry();
        let err = registry
            .update_after_sync(Uuid::new_v4(), &SyncRecord::Success { fetched: 0, new: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_deduplicate_keeps_earliest() {
        let kv: SharedStore = Arc::new(MemoryStore::new());
        let articles = ArticleStore::new(kv.clone());
        let registry = SourceRegistry::new(kv.clone(), articles.clone());

        // Legacy data can hold duplicates that `add` would now reject
        let keeper = registry.add(poetry(), true).await.unwrap();
        let mut clone = keeper.clone();
        clone.id = Uuid::new_v4();
        clone.created_at = keeper.created_at + chrono::Duration::seconds(5);
        let mut rows = registry.load().await.unwrap();
        rows.push(clone.clone());
        registry.save(&rows).await.unwrap();
        articles.merge(clone.id, &[item("dup")]).await.unwrap();

        let removed = registry.deduplicate().await.unwrap();
        assert_eq!(removed, vec![clone.id]);
        assert_eq!(registry.list().await.unwrap(), vec![keeper]);
        assert_eq!(articles.count_by_source(clone.id).await.unwrap(), 0);

        assert!(registry.deduplicate().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sources_survive_new_registry_instance() {
        let kv: SharedStore = Arc::new(MemoryStore::new());
        let first = SourceRegistry::new(kv.clone(), ArticleStore::new(kv.clone()));
        let source = first.add(poetry(), false).await.unwrap();

        let second = SourceRegistry::new(kv.clone(), ArticleStore::new(kv.clone()));
        assert_eq!(second.get(source.id).await.unwrap(), Some(source));
        assert!(kv.get("sources").await.unwrap().is_some());
    }
}
