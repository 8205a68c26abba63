use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::backend::{read_json, write_json, SharedStore};
use super::types::{Item, MergeResult, ParsedItem, StorageError, StoreError};

// ============================================================================
// Key Layout
// ============================================================================

/// Index of source ids that currently own a non-empty partition
const PARTITIONS_KEY: &str = "articles/_partitions";

/// Maximum number of articles returned by a single listing (OOM protection)
const MAX_ARTICLES: usize = 2000;

fn partition_key(source_id: Uuid) -> String {
    format!("articles/{}", source_id)
}

/// Orders items newest first by effective date, then by save time.
fn sort_newest_first(items: &mut [Item]) {
    items.sort_by(|a, b| {
        b.effective_date()
            .cmp(&a.effective_date())
            .then_with(|| b.saved_at.cmp(&a.saved_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ============================================================================
// Article Store
// ============================================================================

/// Durable collection of discovered items, partitioned per source.
///
/// Every read-modify-write goes through `write_lock`, so merges from parallel
/// per-source syncs, read-state changes and retention cleanup never lose each
/// other's updates. Reads only see whole partitions as written by `set`.
#[derive(Clone)]
pub struct ArticleStore {
    kv: SharedStore,
    write_lock: Arc<Mutex<()>>,
}

impl ArticleStore {
    pub fn new(kv: SharedStore) -> Self {
        Self {
            kv,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_partition(&self, source_id: Uuid) -> Result<Vec<Item>, StorageError> {
        Ok(read_json(&*self.kv, &partition_key(source_id))
            .await?
            .unwrap_or_default())
    }

    async fn save_partition(&self, source_id: Uuid, items: &[Item]) -> Result<(), StorageError> {
        write_json(&*self.kv, &partition_key(source_id), items).await
    }

    async fn partitions(&self) -> Result<Vec<Uuid>, StorageError> {
        Ok(read_json(&*self.kv, PARTITIONS_KEY).await?.unwrap_or_default())
    }

    /// Remove a partition and its index entry. Caller holds the write lock.
    async fn drop_partition(&self, source_id: Uuid) -> Result<(), StorageError> {
        self.kv.delete(&partition_key(source_id)).await?;
        let mut index = self.partitions().await?;
        let before = index.len();
        index.retain(|id| *id != source_id);
        if index.len() != before {
            write_json(&*self.kv, PARTITIONS_KEY, &index).await?;
        }
        Ok(())
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Insert the fetched items that a source does not already have.
    ///
    /// Items are matched on their dedup key (link, or title when the link is
    /// empty), case-sensitive. Matches are discarded without touching the stored
    /// copy, so content is immutable after first insert. Duplicates inside
    /// `fetched` collapse to the first occurrence. Running the same merge twice
    /// inserts nothing the second time.
    ///
    /// # Returns
    ///
    /// The inserted count and the inserted items with `is_new = true`.
    pub async fn merge(
        &self,
        source_id: Uuid,
        fetched: &[ParsedItem],
    ) -> Result<MergeResult, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut stored = self.load_partition(source_id).await?;
        let was_empty = stored.is_empty();
        let mut seen: HashSet<String> = stored.iter().map(|i| i.dedup_key().to_string()).collect();

        let now = Utc::now();
        let mut new_items = Vec::new();
        for parsed in fetched {
            let key = parsed.dedup_key();
            if key.is_empty() || !seen.insert(key.to_string()) {
                continue;
            }
            let item = Item {
                id: Uuid::new_v4(),
                source_id,
                title: parsed.title.clone(),
                link: parsed.link.clone(),
                summary: parsed.summary.clone(),
                author: parsed.author.clone(),
                publish_time: parsed.publish_time,
                saved_at: now,
                is_read: false,
                is_new: true,
            };
            stored.push(item.clone());
            new_items.push(item);
        }

        if !new_items.is_empty() {
            self.save_partition(source_id, &stored).await?;
            if was_empty {
                let mut index = self.partitions().await?;
                if !index.contains(&source_id) {
                    index.push(source_id);
                    write_json(&*self.kv, PARTITIONS_KEY, &index).await?;
                }
            }
        }

        tracing::debug!(
            source_id = %source_id,
            fetched = fetched.len(),
            inserted = new_items.len(),
            "Merged fetched items"
        );

        Ok(MergeResult {
            inserted_count: new_items.len(),
            new_items,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Items of one source, newest first.
    ///
    /// Ordering uses `publish_time`, falling back to `saved_at` for items whose
    /// feed carried no usable date. `limit` is capped at 2000.
    pub async fn get_by_source(
        &self,
        source_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, StorageError> {
        let mut items = self.load_partition(source_id).await?;
        sort_newest_first(&mut items);
        items.truncate(limit.unwrap_or(MAX_ARTICLES).min(MAX_ARTICLES));
        Ok(items)
    }

    /// Newest items across all sources, at most `limit_per_source` from each,
    /// merged and sorted by effective date.
    pub async fn get_all(&self, limit_per_source: usize) -> Result<Vec<Item>, StorageError> {
        let mut all = Vec::new();
        for source_id in self.partitions().await? {
            all.extend(self.get_by_source(source_id, Some(limit_per_source)).await?);
        }
        sort_newest_first(&mut all);
        all.truncate(MAX_ARTICLES);
        Ok(all)
    }

    /// Look up a single item by id.
    pub async fn get(&self, item_id: Uuid) -> Result<Option<Item>, StorageError> {
        for source_id in self.partitions().await? {
            if let Some(item) = self
                .load_partition(source_id)
                .await?
                .into_iter()
                .find(|i| i.id == item_id)
            {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    pub async fn count_by_source(&self, source_id: Uuid) -> Result<usize, StorageError> {
        Ok(self.load_partition(source_id).await?.len())
    }

    pub async fn unread_count(&self, source_id: Uuid) -> Result<usize, StorageError> {
        Ok(self
            .load_partition(source_id)
            .await?
            .iter()
            .filter(|i| !i.is_read)
            .count())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Mark an item as read (idempotent), returns whether it was changed.
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if no source owns an item with this id.
    pub async fn mark_read(&self, item_id: Uuid) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;

        for source_id in self.partitions().await? {
            let mut items = self.load_partition(source_id).await?;
            if let Some(item) = items.iter_mut().find(|i| i.id == item_id) {
                if item.is_read {
                    return Ok(false);
                }
                item.is_read = true;
                self.save_partition(source_id, &items).await?;
                return Ok(true);
            }
        }

        Err(StoreError::NotFound {
            kind: "item",
            id: item_id,
        })
    }

    /// Mark every unread item of a source as read, returns how many changed.
    pub async fn mark_all_read(&self, source_id: Uuid) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut items = self.load_partition(source_id).await?;
        let mut changed = 0;
        for item in items.iter_mut().filter(|i| !i.is_read) {
            item.is_read = true;
            changed += 1;
        }
        if changed > 0 {
            self.save_partition(source_id, &items).await?;
        }
        Ok(changed)
    }

    /// Delete every item of a source, returns how many were removed.
    pub async fn delete_by_source(&self, source_id: Uuid) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;

        let removed = self.load_partition(source_id).await?.len();
        self.drop_partition(source_id).await?;
        Ok(removed)
    }

    /// Retention: remove items whose effective date is more than `days` days old.
    pub async fn purge_older_than(&self, days: u32) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - Duration::days(i64::from(days));
        self.purge_before(cutoff).await
    }

    /// Remove items whose effective date is strictly before `cutoff`.
    pub async fn purge_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let _guard = self.write_lock.lock().await;

        let mut removed = 0;
        for source_id in self.partitions().await? {
            let mut items = self.load_partition(source_id).await?;
            let before = items.len();
            items.retain(|i| i.effective_date() >= cutoff);
            let dropped = before - items.len();
            if dropped == 0 {
                continue;
            }
            removed += dropped;
            if items.is_empty() {
                self.drop_partition(source_id).await?;
            } else {
                self.save_partition(source_id, &items).await?;
            }
        }

        tracing::info!(cutoff = %cutoff, removed = removed, "Retention cleanup finished");
        Ok(removed)
    }
}
