use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::orchestrator::{BatchSummary, SyncError, SyncOrchestrator, SyncOutcome};
use crate::config::{TimerConfig, TimerKind, MAX_TIMER_MINUTES};
use crate::storage::{ArticleStore, StorageError};
use crate::util::catch_task_panic;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown timer: {0}")]
    UnknownTimer(String),
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub is_running: bool,
    /// Completion time of the most recent full sync, from any trigger
    pub last_run_time: Option<DateTime<Utc>>,
    /// Names of timers currently armed, sorted
    pub active_timers: Vec<String>,
    pub sync_in_progress: bool,
}

struct TimerHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    orchestrator: SyncOrchestrator,
    articles: ArticleStore,
    retention_days: u32,
    timers: Vec<TimerConfig>,
    active: Mutex<HashMap<String, TimerHandle>>,
    /// At most one full sync at a time, whatever triggered it
    gate: tokio::sync::Mutex<()>,
    running: AtomicBool,
    syncing: AtomicBool,
    last_run: Mutex<Option<DateTime<Utc>>>,
    /// Cancelled on shutdown to stop launching sources in a timer batch;
    /// replaced by a fresh token when the scheduler is started again
    shutdown: Mutex<CancellationToken>,
}

/// Drives full syncs and retention cleanup on named recurring timers.
///
/// Overlap policy: a timer firing that finds a sync in progress is skipped
/// and logged; manual triggers wait for the gate and run afterwards. Cleanup
/// does not take the gate, since the article store serializes its own writes.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        orchestrator: SyncOrchestrator,
        articles: ArticleStore,
        timers: Vec<TimerConfig>,
        retention_days: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                articles,
                retention_days,
                timers,
                active: Mutex::new(HashMap::new()),
                gate: tokio::sync::Mutex::new(()),
                running: AtomicBool::new(false),
                syncing: AtomicBool::new(false),
                last_run: Mutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Arm every configured timer. Calling it while running only logs.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::info!("Scheduler already running, ignoring start");
            return;
        }
        {
            let mut token = self.inner.shutdown.lock().unwrap_or_else(|e| e.into_inner());
            if token.is_cancelled() {
                *token = CancellationToken::new();
            }
        }
        for timer in &self.inner.timers {
            self.arm(timer);
        }
        tracing::info!(timers = self.inner.timers.len(), "Scheduler started");
    }

    /// Disarm every timer. A firing already in progress runs to completion.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let drained: Vec<(String, TimerHandle)> = self.lock_active().drain().collect();
        for (name, handle) in &drained {
            handle.cancel.cancel();
            tracing::debug!(timer = %name, "Timer stopped");
        }
        tracing::info!(stopped = drained.len(), "Scheduler stopped");
    }

    /// Stop, tell in-flight timer batches to launch no further sources, and
    /// wait for the timer tasks to exit. A later [`start`](Self::start) arms
    /// the timers again.
    pub async fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.shutdown_token().cancel();
        let drained: Vec<TimerHandle> = self.lock_active().drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::warn!(error = %e, "Timer task ended abnormally");
            }
        }
    }

    /// Arm one timer by name. Returns false if it was already armed.
    pub fn start_timer(&self, name: &str) -> Result<bool, SchedulerError> {
        let timer = self
            .inner
            .timers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| SchedulerError::UnknownTimer(name.to_string()))?;
        Ok(self.arm(timer))
    }

    /// Disarm one timer by name. Returns false if it was not armed.
    pub fn stop_timer(&self, name: &str) -> Result<bool, SchedulerError> {
        if !self.inner.timers.iter().any(|t| t.name == name) {
            return Err(SchedulerError::UnknownTimer(name.to_string()));
        }
        match self.lock_active().remove(name) {
            Some(handle) => {
                handle.cancel.cancel();
                tracing::info!(timer = %name, "Timer stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run a full sync now, waiting for any sync in progress to finish first.
    pub async fn trigger_manual_check(&self) -> Result<BatchSummary, StorageError> {
        let _guard = self.inner.gate.lock().await;
        tracing::info!("Manual sync triggered");
        self.inner.run_sync_all(&CancellationToken::new()).await
    }

    /// Sync one source through the same gate as full syncs.
    pub async fn trigger_one(&self, source_id: Uuid) -> Result<SyncOutcome, SyncError> {
        let _guard = self.inner.gate.lock().await;
        self.inner.syncing.store(true, Ordering::SeqCst);
        let outcome = self.inner.orchestrator.sync_one(source_id).await;
        self.inner.syncing.store(false, Ordering::SeqCst);
        outcome
    }

    /// Run `work` while holding the sync gate, so no sync is in flight.
    ///
    /// Used for registry changes that must not interleave with a merge.
    pub async fn exclusive<F: Future>(&self, work: F) -> F::Output {
        let _guard = self.inner.gate.lock().await;
        work.await
    }

    /// Apply retention now, returns the number of items removed.
    pub async fn run_cleanup(&self) -> Result<usize, StorageError> {
        self.inner.run_cleanup().await
    }

    pub fn status(&self) -> SchedulerStatus {
        let mut active_timers: Vec<String> = self.lock_active().keys().cloned().collect();
        active_timers.sort();
        SchedulerStatus {
            is_running: self.inner.running.load(Ordering::SeqCst),
            last_run_time: *self.inner.last_run.lock().unwrap_or_else(|e| e.into_inner()),
            active_timers,
            sync_in_progress: self.inner.syncing.load(Ordering::SeqCst),
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, TimerHandle>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn the task for `timer` unless it is already armed.
    fn arm(&self, timer: &TimerConfig) -> bool {
        let mut active = self.lock_active();
        if active.contains_key(&timer.name) {
            return false;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let timer = timer.clone();
        let period = Duration::from_secs(timer.every_minutes.clamp(1, MAX_TIMER_MINUTES) * 60);
        let name = timer.name.clone();

        let task = tokio::spawn(async move {
            // First firing one full period after arming
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }
                if let Err(panic_msg) = catch_task_panic(inner.fire(&timer)).await {
                    tracing::error!(timer = %timer.name, error = %panic_msg, "Timer firing panicked");
                }
            }
        });

        tracing::debug!(timer = %name, period_secs = period.as_secs(), "Timer armed");
        active.insert(name, TimerHandle { cancel, task });
        true
    }
}

impl Inner {
    fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    async fn fire(&self, timer: &TimerConfig) {
        match timer.kind {
            TimerKind::Sync => {
                let Ok(_guard) = self.gate.try_lock() else {
                    tracing::info!(timer = %timer.name, "Sync already in progress, skipping timer firing");
                    return;
                };
                tracing::info!(timer = %timer.name, "Timer sync starting");
                let cancel = self.shutdown_token();
                if let Err(e) = self.run_sync_all(&cancel).await {
                    tracing::error!(timer = %timer.name, error = %e, "Timer sync failed");
                }
            }
            TimerKind::Cleanup => {
                if let Err(e) = self.run_cleanup().await {
                    tracing::error!(timer = %timer.name, error = %e, "Retention cleanup failed");
                }
            }
        }
    }

    /// Caller holds the gate.
    async fn run_sync_all(&self, cancel: &CancellationToken) -> Result<BatchSummary, StorageError> {
        self.syncing.store(true, Ordering::SeqCst);
        let result = self.orchestrator.sync_all_until(cancel).await;
        self.syncing.store(false, Ordering::SeqCst);
        if result.is_ok() {
            *self.last_run.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
        }
        result
    }

    async fn run_cleanup(&self) -> Result<usize, StorageError> {
        let removed = self.articles.purge_older_than(self.retention_days).await?;
        tracing::info!(removed = removed, retention_days = self.retention_days, "Retention cleanup complete");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{FetchError, FetchMethod, SourceFetcher, Strategy};
    use crate::storage::{MemoryStore, NewSource, ParsedItem, SharedStore, SourceRegistry};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    /// Upstream that takes `delay` per fetch and records peak concurrency.
    struct SlowUpstream {
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl FetchMethod for SlowUpstream {
        fn strategy(&self) -> Strategy {
            Strategy::Feed
        }

        async fn fetch(&self, identifier: &str, _limit: usize) -> Result<Vec<ParsedItem>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![ParsedItem {
                title: identifier.to_string(),
                link: format!("https://mp.example.com/{}", identifier),
                summary: String::new(),
                author: String::new(),
                publish_time: None,
            }])
        }
    }

    struct Harness {
        upstream: Arc<SlowUpstream>,
        articles: ArticleStore,
        scheduler: Scheduler,
    }

    async fn harness(timers: Vec<TimerConfig>, delay: Duration) -> Harness {
        let kv: SharedStore = Arc::new(MemoryStore::new());
        let articles = ArticleStore::new(kv.clone());
        let registry = SourceRegistry::new(kv, articles.clone());
        registry
            .add(NewSource::new("Poetry Weekly", "poetry-weekly", Strategy::Auto), false)
            .await
            .unwrap();

        let upstream = Arc::new(SlowUpstream {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let fetcher = SourceFetcher::with_methods(
            vec![upstream.clone() as Arc<dyn FetchMethod>],
            Duration::from_secs(3600),
        );
        let orchestrator = SyncOrchestrator::new(fetcher, registry, articles.clone());
        let scheduler = Scheduler::new(orchestrator, articles.clone(), timers, 30);
        Harness {
            upstream,
            articles,
            scheduler,
        }
    }

    fn every_minute() -> Vec<TimerConfig> {
        vec![TimerConfig::new("frequent-sync", TimerKind::Sync, 1)]
    }

    fn calls(h: &Harness) -> usize {
        h.upstream.calls.load(Ordering::SeqCst)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let h = harness(crate::config::SchedulerConfig::default().timers, Duration::ZERO).await;
        h.scheduler.start();
        h.scheduler.start();

        let status = h.scheduler.status();
        assert!(status.is_running);
        assert_eq!(
            status.active_timers,
            vec!["daily-sync", "frequent-sync", "nightly-cleanup"]
        );
        assert_eq!(status.last_run_time, None);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_firing_after_one_period() {
        let h = harness(every_minute(), Duration::ZERO).await;
        h.scheduler.start();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(calls(&h), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls(&h), 1);
        assert!(h.scheduler.status().last_run_time.is_some());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls(&h), 2);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_skips_when_sync_in_progress() {
        let h = harness(every_minute(), Duration::ZERO).await;
        h.scheduler.start();

        let guard = h.scheduler.inner.gate.lock().await;
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(calls(&h), 0, "timer must not run while the gate is held");
        drop(guard);

        // The skipped firing is not replayed; the next one runs normally
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls(&h), 1);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_trigger_queues_behind_running_sync() {
        let h = harness(Vec::new(), Duration::ZERO).await;

        let guard = h.scheduler.inner.gate.lock().await;
        let scheduler = h.scheduler.clone();
        let pending = tokio::spawn(async move { scheduler.trigger_manual_check().await });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!pending.is_finished());
        assert_eq!(calls(&h), 0);

        drop(guard);
        let summary = pending.await.unwrap().unwrap();
        assert_eq!(summary.accounts_succeeded, 1);
        assert_eq!(calls(&h), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_triggers_never_interleave() {
        let h = harness(every_minute(), Duration::from_secs(30)).await;
        h.scheduler.start();

        // Manual sync starts at t=50s and is still fetching when the timer fires at t=60s
        tokio::time::sleep(Duration::from_secs(50)).await;
        let first = h.scheduler.clone();
        let second = h.scheduler.clone();
        let (a, b) = tokio::join!(
            async move { first.trigger_manual_check().await },
            async move { second.trigger_manual_check().await },
        );

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(h.upstream.peak.load(Ordering::SeqCst), 1);
        // Two manual runs; the timer firing at t=60s found the gate busy
        assert_eq!(calls(&h), 2);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_in_progress_reported() {
        let h = harness(Vec::new(), Duration::from_secs(10)).await;
        let scheduler = h.scheduler.clone();
        let running = tokio::spawn(async move { scheduler.trigger_manual_check().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(h.scheduler.status().sync_in_progress);

        running.await.unwrap().unwrap();
        assert!(!h.scheduler.status().sync_in_progress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_disarms_timers() {
        let h = harness(every_minute(), Duration::ZERO).await;
        h.scheduler.start();
        h.scheduler.stop();

        let status = h.scheduler.status();
        assert!(!status.is_running);
        assert!(status.active_timers.is_empty());

        tokio::time::sleep(Duration::from_secs(180)).await;
        assert_eq!(calls(&h), 0);

        // Restart after stop arms timers again
        h.scheduler.start();
        assert_eq!(h.scheduler.status().active_timers, vec!["frequent-sync"]);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_after_shutdown_fires_again() {
        let h = harness(every_minute(), Duration::ZERO).await;
        h.scheduler.start();
        h.scheduler.shutdown().await;
        assert!(!h.scheduler.status().is_running);

        h.scheduler.start();
        assert_eq!(h.scheduler.status().active_timers, vec!["frequent-sync"]);

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(calls(&h), 1, "restarted timer must launch fetches");

        let summary = h.scheduler.trigger_manual_check().await.unwrap();
        assert_eq!(summary.accounts_succeeded, 1);
        assert_eq!(calls(&h), 2);
        h.scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_single_timer() {
        let h = harness(
            vec![
                TimerConfig::new("frequent-sync", TimerKind::Sync, 1),
                TimerConfig::new("nightly-cleanup", TimerKind::Cleanup, 1440),
            ],
            Duration::ZERO,
        )
        .await;

        assert!(h.scheduler.start_timer("nightly-cleanup").unwrap());
        assert!(!h.scheduler.start_timer("nightly-cleanup").unwrap());
        assert_eq!(h.scheduler.status().active_timers, vec!["nightly-cleanup"]);
        assert!(!h.scheduler.status().is_running);

        assert!(h.scheduler.stop_timer("nightly-cleanup").unwrap());
        assert!(!h.scheduler.stop_timer("nightly-cleanup").unwrap());
        assert!(matches!(
            h.scheduler.start_timer("hourly"),
            Err(SchedulerError::UnknownTimer(_))
        ));
        assert!(h.scheduler.stop_timer("hourly").is_err());
    }

    #[tokio::test]
    async fn test_run_cleanup_applies_retention() {
        let h = harness(Vec::new(), Duration::ZERO).await;
        let source = Uuid::new_v4();
        let now = Utc::now();
        let item = |link: &str, days: i64| ParsedItem {
            title: link.to_string(),
            link: link.to_string(),
            summary: String::new(),
            author: String::new(),
            publish_time: Some(now - chrono::Duration::days(days)),
        };
        h.articles
            .merge(source, &[item("old", 31), item("fresh", 29)])
            .await
            .unwrap();

        assert_eq!(h.scheduler.run_cleanup().await.unwrap(), 1);
        assert_eq!(h.articles.count_by_source(source).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_one_uses_gate() {
        let h = harness(Vec::new(), Duration::ZERO).await;
        let guard = h.scheduler.inner.gate.lock().await;
        let scheduler = h.scheduler.clone();
        let pending = tokio::spawn(async move { scheduler.trigger_one(Uuid::new_v4()).await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!pending.is_finished());
        drop(guard);

        assert!(matches!(
            pending.await.unwrap(),
            Err(SyncError::SourceNotFound(_))
        ));
    }
}
