//! Facade wiring config, storage, fetching, syncing and scheduling together.
//!
//! This is the surface an outer layer (CLI, HTTP API, UI) talks to.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::{Backend, Config};
use crate::feed::{build_client, SourceFetcher, Strategy};
use crate::storage::{
    ArticleStore, Item, MemoryStore, NewSource, SharedStore, Source, SourceRegistry,
    SourceSummary, SqliteStore, StorageError, StoreError,
};
use crate::sync::{BatchSummary, Scheduler, SchedulerStatus, SyncError, SyncOrchestrator, SyncOutcome};

/// Result of [`Monitor::trigger_sync`].
#[derive(Debug)]
pub enum SyncTrigger {
    One(SyncOutcome),
    Batch(BatchSummary),
}

pub struct Monitor {
    kv: SharedStore,
    registry: SourceRegistry,
    articles: ArticleStore,
    fetcher: SourceFetcher,
    scheduler: Scheduler,
    backend: &'static str,
}

impl Monitor {
    /// Open the configured backend and build every component.
    ///
    /// Runs source deduplication once, so duplicates left by older data never
    /// reach a sync.
    pub async fn open(config: &Config) -> Result<Self> {
        let kv: SharedStore = match config.storage.backend {
            Backend::Sqlite => {
                let path = database_path(config)?;
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("Failed to create data directory '{}'", parent.display())
                    })?;
                }
                let path_str = path
                    .to_str()
                    .with_context(|| format!("Database path '{}' is not valid UTF-8", path.display()))?;
                Arc::new(SqliteStore::open(path_str).await?)
            }
            Backend::Memory => {
                tracing::warn!("Using in-memory storage, nothing will persist past this process");
                Arc::new(MemoryStore::new())
            }
        };

        let client = build_client(&config.fetch).context("Failed to build HTTP client")?;
        let fetcher = SourceFetcher::new(&config.fetch, client);
        let monitor = Self::with_parts(kv, fetcher, config);

        let removed = monitor.deduplicate_sources().await?;
        if !removed.is_empty() {
            tracing::info!(removed = removed.len(), "Removed duplicate sources at startup");
        }
        Ok(monitor)
    }

    /// Build from an existing store and fetcher.
    pub fn with_parts(kv: SharedStore, fetcher: SourceFetcher, config: &Config) -> Self {
        let backend = kv.backend_name();
        let articles = ArticleStore::new(kv.clone());
        let registry = SourceRegistry::new(kv.clone(), articles.clone())
            .with_failure_threshold(config.sync.failure_threshold);
        let orchestrator = SyncOrchestrator::new(fetcher.clone(), registry.clone(), articles.clone())
            .with_limit(config.fetch.limit)
            .with_max_concurrent(config.fetch.max_concurrent_sources);
        let scheduler = Scheduler::new(
            orchestrator,
            articles.clone(),
            config.scheduler.timers.clone(),
            config.sync.retention_days,
        );

        tracing::debug!(backend = backend, "Monitor ready");
        Self {
            kv,
            registry,
            articles,
            fetcher,
            scheduler,
            backend,
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // ========================================================================
    // Sources
    // ========================================================================

    /// Register a source, optionally probing it first.
    ///
    /// A failed validation fetch still registers the source, unverified.
    pub async fn register_source(
        &self,
        name: &str,
        identifier: &str,
        strategy: Strategy,
        validate: bool,
    ) -> Result<Source, StoreError> {
        let verified = validate && self.fetcher.validate(identifier.trim(), strategy).await;
        self.registry
            .add(NewSource::new(name, identifier, strategy), verified)
            .await
    }

    /// Remove a source and its items. Waits for a sync in progress, so the
    /// cascade never runs underneath a merge.
    pub async fn remove_source(&self, id: Uuid) -> Result<Source, StoreError> {
        self.scheduler.exclusive(self.registry.remove(id)).await
    }

    pub async fn get_source(&self, id: Uuid) -> Result<Option<Source>, StorageError> {
        self.registry.get(id).await
    }

    /// Sources ordered by name, with item and unread counts.
    pub async fn list_sources(&self) -> Result<Vec<SourceSummary>, StorageError> {
        let mut summaries = Vec::new();
        for source in self.registry.list().await? {
            summaries.push(SourceSummary {
                item_count: self.articles.count_by_source(source.id).await?,
                unread_count: self.articles.unread_count(source.id).await?,
                source,
            });
        }
        Ok(summaries)
    }

    pub async fn validate_source(&self, identifier: &str, strategy: Strategy) -> bool {
        self.fetcher.validate(identifier, strategy).await
    }

    pub async fn deduplicate_sources(&self) -> Result<Vec<Uuid>, StoreError> {
        self.scheduler.exclusive(self.registry.deduplicate()).await
    }

    // ========================================================================
    // Articles
    // ========================================================================

    pub async fn get_source_articles(
        &self,
        source_id: Uuid,
        limit: Option<usize>,
    ) -> Result<Vec<Item>, StoreError> {
        if self.registry.get(source_id).await?.is_none() {
            return Err(StoreError::NotFound {
                kind: "source",
                id: source_id,
            });
        }
        Ok(self.articles.get_by_source(source_id, limit).await?)
    }

    /// Newest items across sources, merged and sorted by effective date.
    pub async fn get_all_articles(&self, limit_per_source: usize) -> Result<Vec<Item>, StorageError> {
        self.articles.get_all(limit_per_source).await
    }

    pub async fn mark_item_read(&self, item_id: Uuid) -> Result<(), StoreError> {
        self.articles.mark_read(item_id).await.map(|_| ())
    }

    pub async fn mark_source_read(&self, source_id: Uuid) -> Result<usize, StorageError> {
        self.articles.mark_all_read(source_id).await
    }

    pub async fn purge_older_than(&self, days: u32) -> Result<usize, StorageError> {
        self.articles.purge_older_than(days).await
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Sync one source, or every source when `source_id` is `None`.
    ///
    /// Both go through the scheduler's gate, so they wait for a sync already
    /// in progress rather than overlapping it.
    pub async fn trigger_sync(&self, source_id: Option<Uuid>) -> Result<SyncTrigger, SyncError> {
        match source_id {
            Some(id) => Ok(SyncTrigger::One(self.scheduler.trigger_one(id).await?)),
            None => Ok(SyncTrigger::Batch(self.scheduler.trigger_manual_check().await?)),
        }
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Shut the scheduler down and release the store, file lock included.
    pub async fn close(&self) {
        self.scheduler.shutdown().await;
        self.kv.close().await;
        tracing::debug!(backend = self.backend, "Monitor closed");
    }
}

fn database_path(config: &Config) -> Result<PathBuf> {
    if let Some(path) = &config.storage.path {
        return Ok(path.clone());
    }
    let dir = Config::default_dir().context("HOME environment variable not set")?;
    Ok(dir.join("feedwatch.db"))
}
