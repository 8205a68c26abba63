use futures::stream::{self, StreamExt};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::feed::{FetchError, SourceFetcher, Strategy};
use crate::storage::{
    ArticleStore, Item, Source, SourceRegistry, StorageError, StoreError, SyncRecord,
};
use crate::util::catch_task_panic;

// ============================================================================
// Results
// ============================================================================

/// Result of syncing one source. Never an error: failures are described here.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub source_id: Uuid,
    pub source_name: String,
    pub success: bool,
    pub items_fetched: usize,
    pub items_new: usize,
    /// Items inserted by this sync, with `is_new` set
    pub new_items: Vec<Item>,
    /// Method that produced the items
    pub strategy: Option<Strategy>,
    pub error: Option<String>,
}

impl SyncOutcome {
    fn failed(source: &Source, error: String) -> Self {
        Self {
            source_id: source.id,
            source_name: source.name.clone(),
            success: false,
            items_fetched: 0,
            items_new: 0,
            new_items: Vec::new(),
            strategy: None,
            error: Some(error),
        }
    }
}

/// How a batch went, for callers that render the three cases differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    NoSources,
    AllFailed,
    Partial,
    AllSucceeded,
}

/// Aggregate of one `sync_all` pass.
#[derive(Debug, Clone, Default)]
pub struct BatchSummary {
    pub accounts_total: usize,
    pub accounts_succeeded: usize,
    pub accounts_failed: usize,
    pub items_new_total: usize,
    pub duration_ms: u64,
    /// Per-source outcomes in completion order
    pub outcomes: Vec<SyncOutcome>,
}

impl BatchSummary {
    pub fn status(&self) -> BatchStatus {
        if self.accounts_total == 0 {
            BatchStatus::NoSources
        } else if self.accounts_succeeded == 0 {
            BatchStatus::AllFailed
        } else if self.accounts_failed > 0 {
            BatchStatus::Partial
        } else {
            BatchStatus::AllSucceeded
        }
    }
}

/// Errors that abort a single-source sync before any work is done.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source not found: {0}")]
    SourceNotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Runs fetch → merge → bookkeeping for one source or for all of them.
///
/// Per-source failures, including panics inside a fetch method, are turned
/// into failed [`SyncOutcome`]s and never abort the rest of a batch.
#[derive(Clone)]
pub struct SyncOrchestrator {
    fetcher: SourceFetcher,
    registry: SourceRegistry,
    articles: ArticleStore,
    limit: usize,
    max_concurrent: usize,
}

impl SyncOrchestrator {
    pub fn new(fetcher: SourceFetcher, registry: SourceRegistry, articles: ArticleStore) -> Self {
        Self {
            fetcher,
            registry,
            articles,
            limit: 10,
            max_concurrent: 4,
        }
    }

    /// Items requested per source.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Sources fetched in parallel within one batch.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    /// Sync a single source by id.
    ///
    /// # Errors
    ///
    /// `SyncError::SourceNotFound` for an unknown id, `SyncError::Storage` if
    /// the registry cannot be read. Everything after the lookup is reported
    /// inside the outcome.
    pub async fn sync_one(&self, source_id: Uuid) -> Result<SyncOutcome, SyncError> {
        let source = self
            .registry
            .get(source_id)
            .await?
            .ok_or(SyncError::SourceNotFound(source_id))?;
        Ok(self.sync_source(&source).await)
    }

    /// Sync every registered source.
    ///
    /// Sources in `error` state are retried like any other. Always returns a
    /// summary, even when every source failed.
    pub async fn sync_all(&self) -> Result<BatchSummary, StorageError> {
        self.sync_all_until(&CancellationToken::new()).await
    }

    /// Like [`sync_all`](Self::sync_all), but stops launching further sources
    /// once `cancel` fires. Sources already in flight finish normally.
    pub async fn sync_all_until(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BatchSummary, StorageError> {
        let started = Instant::now();
        let sources = self.registry.list().await?;
        tracing::info!(sources = sources.len(), "Starting sync of all sources");

        let outcomes: Vec<SyncOutcome> = stream::iter(sources)
            .take_while(|_| std::future::ready(!cancel.is_cancelled()))
            .map(|source| async move { self.sync_source(&source).await })
            .buffer_unordered(self.max_concurrent)
            .collect()
            .await;

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        let summary = BatchSummary {
            accounts_total: outcomes.len(),
            accounts_succeeded: succeeded,
            accounts_failed: outcomes.len() - succeeded,
            items_new_total: outcomes.iter().map(|o| o.items_new).sum(),
            duration_ms: started.elapsed().as_millis() as u64,
            outcomes,
        };

        if cancel.is_cancelled() {
            tracing::info!(completed = summary.accounts_total, "Sync batch cancelled");
        }
        tracing::info!(
            total = summary.accounts_total,
            succeeded = summary.accounts_succeeded,
            failed = summary.accounts_failed,
            items_new = summary.items_new_total,
            duration_ms = summary.duration_ms,
            status = ?summary.status(),
            "Sync batch complete"
        );
        Ok(summary)
    }

    /// Sync one source, containing every failure (panics included).
    async fn sync_source(&self, source: &Source) -> SyncOutcome {
        match catch_task_panic(self.sync_source_inner(source)).await {
            Ok(outcome) => outcome,
            Err(panic_msg) => {
                tracing::error!(source_id = %source.id, error = %panic_msg, "Source sync panicked");
                let error = format!("panicked: {}", panic_msg);
                self.record(source, SyncRecord::Failure { error: error.clone() }).await;
                SyncOutcome::failed(source, error)
            }
        }
    }

    async fn sync_source_inner(&self, source: &Source) -> SyncOutcome {
        let report = match self
            .fetcher
            .fetch(&source.identifier, source.strategy, self.limit)
            .await
        {
            Ok(report) => report,
            Err(e) => return self.fail(source, &e).await,
        };

        for attempt in &report.attempts {
            tracing::debug!(source_id = %source.id, attempt = %attempt, "Fallback attempt failed");
        }

        let merged = match self.articles.merge(source.id, &report.items).await {
            Ok(merged) => merged,
            Err(e) => {
                tracing::error!(source_id = %source.id, error = %e, "Merge failed");
                let error = format!("storage: {}", e);
                self.record(source, SyncRecord::Failure { error: error.clone() }).await;
                return SyncOutcome::failed(source, error);
            }
        };

        let recorded = self
            .record(
                source,
                SyncRecord::Success {
                    fetched: report.items.len(),
                    new: merged.inserted_count,
                },
            )
            .await;
        if !recorded {
            // Removed while the merge ran: the cascade may already be done
            return self.discard_orphans(source).await;
        }

        tracing::info!(
            source_id = %source.id,
            name = %source.name,
            strategy = %report.strategy,
            fetched = report.items.len(),
            new = merged.inserted_count,
            "Source synced"
        );

        SyncOutcome {
            source_id: source.id,
            source_name: source.name.clone(),
            success: true,
            items_fetched: report.items.len(),
            items_new: merged.inserted_count,
            new_items: merged.new_items,
            strategy: Some(report.strategy),
            error: None,
        }
    }

    async fn fail(&self, source: &Source, error: &FetchError) -> SyncOutcome {
        tracing::warn!(
            source_id = %source.id,
            name = %source.name,
            strategy = %source.strategy,
            error = %error,
            "Source fetch failed"
        );
        let message = error.to_string();
        self.record(source, SyncRecord::Failure { error: message.clone() }).await;
        SyncOutcome::failed(source, message)
    }

    /// Bookkeeping is best-effort. Returns false only when the source no
    /// longer exists.
    async fn record(&self, source: &Source, record: SyncRecord) -> bool {
        match self.registry.update_after_sync(source.id, &record).await {
            Ok(_) => true,
            Err(StoreError::NotFound { .. }) => {
                tracing::debug!(source_id = %source.id, "Source removed during sync, skipping bookkeeping");
                false
            }
            Err(e) => {
                tracing::warn!(source_id = %source.id, error = %e, "Failed to record sync result");
                true
            }
        }
    }

    /// Drop a partition re-created by a merge that raced the source's removal.
    async fn discard_orphans(&self, source: &Source) -> SyncOutcome {
        match self.articles.delete_by_source(source.id).await {
            Ok(removed) => {
                tracing::info!(source_id = %source.id, removed, "Discarded items of a source removed mid-sync");
            }
            Err(e) => {
                tracing::warn!(source_id = %source.id, error = %e, "Failed to discard items of a removed source");
            }
        }
        SyncOutcome::failed(source, "source removed during sync".to_string())
    }
}
