//! Periodic roster synchronization
//!
//! The scheduler pages through the role source and refreshes the cache, on a
//! fixed interval or on demand. A cycle that cannot fetch its first page
//! leaves the cache untouched; malformed rows are counted and skipped.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::SecurityAuditService;
use crate::engine::RoleCache;
use crate::error::{AuthzError, Result};
use crate::event::{duration_ms, SyncEvent, SyncStatus, SyncTrigger};
use crate::source::RoleSource;
use crate::types::UserId;

/// Scheduler configuration
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Time between scheduled cycles
    pub interval: Duration,

    /// Rows requested per page
    pub page_size: usize,

    /// Upper bound on a single page fetch
    pub page_timeout: Duration,

    /// Run a cycle as soon as the scheduler starts
    pub run_on_start: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            page_size: 500,
            page_timeout: Duration::from_secs(5),
            run_on_start: true,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(AuthzError::Config("sync interval must be > 0".to_string()));
        }
        if self.page_size == 0 {
            return Err(AuthzError::Config("sync page_size must be > 0".to_string()));
        }
        if self.page_timeout.is_zero() {
            return Err(AuthzError::Config("sync page_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

/// Roster sync scheduler
pub struct RoleSyncScheduler {
    config: SyncConfig,
    cache: Arc<RoleCache>,
    source: Arc<dyn RoleSource>,
    audit: Arc<SecurityAuditService>,
    state: Mutex<SyncState>,
    last_event: Mutex<Option<SyncEvent>>,
    /// Serializes cycles; a manual trigger waits for a running cycle
    cycle: tokio::sync::Mutex<()>,
}

impl RoleSyncScheduler {
    pub fn new(
        config: SyncConfig,
        cache: Arc<RoleCache>,
        source: Arc<dyn RoleSource>,
        audit: Arc<SecurityAuditService>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cache,
            source,
            audit,
            state: Mutex::new(SyncState::Idle),
            last_event: Mutex::new(None),
            cycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> SyncState {
        *self.state.lock()
    }

    /// Event of the most recent finished cycle
    pub fn last_event(&self) -> Option<SyncEvent> {
        self.last_event.lock().clone()
    }

    /// Run one full cycle and return its event
    pub async fn run_cycle(&self, trigger: SyncTrigger) -> SyncEvent {
        let _cycle = self.cycle.lock().await;
        self.transition(SyncState::Running);

        let started = Instant::now();
        let mut event = SyncEvent::begin(trigger);
        let mut seen = HashSet::new();

        info!(trigger = trigger.as_str(), "Roster sync started");

        if let Err(reason) = self.fetch_all(&mut event, &mut seen).await {
            error!(trigger = trigger.as_str(), error = %reason, "Roster sync failed");
            event.error = Some(reason);
        }

        // Only a fully clean pass is trusted to say who left the roster.
        if event.status() == SyncStatus::Succeeded {
            event.records_pruned = self.cache.prune_absent(&seen, started);
        }
        let purged = self.cache.purge_expired();

        event.duration_ms = duration_ms(started.elapsed());

        match event.status() {
            SyncStatus::Succeeded => info!(
                records_fetched = event.records_fetched,
                records_pruned = event.records_pruned,
                purged,
                duration_ms = event.duration_ms,
                "Roster sync succeeded"
            ),
            SyncStatus::Partial => warn!(
                records_fetched = event.records_fetched,
                records_failed = event.records_failed,
                pages_failed = event.pages_failed,
                "Roster sync partially failed"
            ),
            SyncStatus::Failed => {}
        }

        self.transition(match event.status() {
            SyncStatus::Failed => SyncState::Failed,
            SyncStatus::Succeeded | SyncStatus::Partial => SyncState::Succeeded,
        });

        self.audit.log_sync_event(&event).await;
        *self.last_event.lock() = Some(event.clone());
        self.transition(SyncState::Idle);

        event
    }

    /// Page through the source applying valid rows; `Err` only when nothing could be fetched
    async fn fetch_all(
        &self,
        event: &mut SyncEvent,
        seen: &mut HashSet<UserId>,
    ) -> std::result::Result<(), String> {
        let page_size = self.config.page_size;
        let mut offset = 0usize;
        let mut pages_fetched = 0usize;
        let mut total: Option<usize> = None;

        loop {
            let observed_at = Instant::now();
            let fetched = match tokio::time::timeout(
                self.config.page_timeout,
                self.source.fetch_page(offset, page_size),
            )
            .await
            {
                Ok(Ok(page)) => Ok(page),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(AuthzError::LookupTimeout(self.config.page_timeout).to_string()),
            };

            let page = match fetched {
                Ok(page) => page,
                Err(reason) if pages_fetched == 0 => return Err(reason),
                Err(reason) => {
                    event.pages_failed += 1;
                    warn!(offset, error = %reason, "Roster page fetch failed");
                    match total {
                        Some(total) if offset + page_size < total => {
                            offset += page_size;
                            continue;
                        }
                        _ => return Ok(()),
                    }
                }
            };

            pages_fetched += 1;
            total = page.total.or(total);
            let rows = page.records.len();

            for record in &page.records {
                match record.parse() {
                    Ok(assignment) => {
                        seen.insert(assignment.user_id);
                        self.cache
                            .set_observed(assignment.user_id, assignment.role, observed_at);
                        event.records_fetched += 1;
                    }
                    Err(e) => {
                        debug!(
                            offset,
                            user_id = ?record.user_id,
                            error = %e,
                            "Skipping malformed roster row"
                        );
                        event.records_failed += 1;
                        if let Some(id) = record.user_id {
                            event.failed_ids.push(id);
                        }
                    }
                }
            }

            offset += rows;
            let exhausted = rows < page_size || total.is_some_and(|total| offset >= total);
            if exhausted {
                return Ok(());
            }
        }
    }

    fn transition(&self, next: SyncState) {
        let mut state = self.state.lock();
        debug!("Sync state {:?} -> {:?}", *state, next);
        *state = next;
    }

    /// Start the periodic task
    pub fn spawn(self: Arc<Self>) -> SyncHandle {
        let token = CancellationToken::new();
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<oneshot::Sender<SyncEvent>>(8);

        let scheduler = Arc::clone(&self);
        let cancelled = token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !scheduler.config.run_on_start {
                // First tick completes immediately.
                ticker.tick().await;
            }

            info!(
                interval_secs = scheduler.config.interval.as_secs(),
                "Roster sync scheduler started"
            );

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    Some(reply) = trigger_rx.recv() => {
                        let event = scheduler.run_cycle(SyncTrigger::Manual).await;
                        let _ = reply.send(event);
                    }
                    _ = ticker.tick() => {
                        scheduler.run_cycle(SyncTrigger::Scheduled).await;
                    }
                }
            }

            info!("Roster sync scheduler stopped");
        });

        SyncHandle {
            scheduler: self,
            trigger_tx,
            token,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Control handle for a spawned scheduler
pub struct SyncHandle {
    scheduler: Arc<RoleSyncScheduler>,
    trigger_tx: mpsc::Sender<oneshot::Sender<SyncEvent>>,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncHandle {
    /// Run a cycle now and wait for its event
    pub async fn trigger_manual_sync(&self) -> Result<SyncEvent> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.trigger_tx
            .send(reply_tx)
            .await
            .map_err(|_| {
                AuthzError::TotalSyncFailure("sync scheduler is not running".to_string())
            })?;
        reply_rx
            .await
            .map_err(|_| AuthzError::TotalSyncFailure("sync scheduler stopped".to_string()))
    }

    pub fn state(&self) -> SyncState {
        self.scheduler.state()
    }

    pub fn last_event(&self) -> Option<SyncEvent> {
        self.scheduler.last_event()
    }

    pub fn scheduler(&self) -> &Arc<RoleSyncScheduler> {
        &self.scheduler
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Stop the task after any in-flight cycle completes
    pub async fn shutdown(&self) {
        self.token.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Sync scheduler task failed: {}", e);
            }
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditConfig, MemoryAuditSink};
    use crate::engine::CacheConfig;
    use crate::source::{InMemoryRoleSource, RawRoleRecord};
    use crate::types::{Role, RoleAssignment, UserId};

    fn scheduler(
        source: InMemoryRoleSource,
        config: SyncConfig,
    ) -> (Arc<RoleSyncScheduler>, Arc<RoleCache>) {
        let cache = Arc::new(RoleCache::new(CacheConfig::default()).unwrap());
        let audit = Arc::new(SecurityAuditService::new(
            AuditConfig::default(),
            Arc::new(MemoryAuditSink::new()),
        ));
        let scheduler =
            RoleSyncScheduler::new(config, cache.clone(), Arc::new(source), audit).unwrap();
        (Arc::new(scheduler), cache)
    }

    fn small_pages() -> SyncConfig {
        SyncConfig {
            page_size: 10,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_clean_cycle() {
        let source = InMemoryRoleSource::with_assignments(
            (1..=25).map(|id| RoleAssignment::new(id, Role::Viewer)),
        );
        let (scheduler, cache) = scheduler(source.clone(), small_pages());

        let event = scheduler.run_cycle(SyncTrigger::Scheduled).await;

        assert_eq!(event.status(), SyncStatus::Succeeded);
        assert_eq!(event.records_fetched, 25);
        assert_eq!(cache.len(), 25);
        assert_eq!(source.page_fetches(), 3);
        assert_eq!(scheduler.state(), SyncState::Idle);
        assert_eq!(scheduler.last_event(), Some(event));
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped() {
        let mut records: Vec<RawRoleRecord> =
            (1..=20).map(|id| RawRoleRecord::new(id, Role::Viewer)).collect();
        records[4].role = Some("wizard".into());
        records[12].user_id = None;
        let (scheduler, cache) =
            scheduler(InMemoryRoleSource::with_records(records), small_pages());

        let event = scheduler.run_cycle(SyncTrigger::Manual).await;

        assert_eq!(event.status(), SyncStatus::Partial);
        assert_eq!(event.records_fetched, 18);
        assert_eq!(event.records_failed, 2);
        assert_eq!(event.failed_ids, vec![5]);
        assert_eq!(cache.peek(UserId::new(5)), None);
        assert_eq!(cache.peek(UserId::new(6)), Some(Role::Viewer));
    }

    #[tokio::test]
    async fn test_total_failure_leaves_cache_untouched() {
        let source = InMemoryRoleSource::new();
        let (scheduler, cache) = scheduler(source.clone(), small_pages());
        cache.set(UserId::new(1), Role::Admin);
        source.set_failing(true);

        let event = scheduler.run_cycle(SyncTrigger::Scheduled).await;

        assert_eq!(event.status(), SyncStatus::Failed);
        assert_eq!(event.records_fetched, 0);
        assert!(event.error.is_some());
        assert_eq!(cache.peek(UserId::new(1)), Some(Role::Admin));
    }

    #[tokio::test]
    async fn test_failed_middle_page_is_skipped() {
        let source = InMemoryRoleSource::with_assignments(
            (1..=30).map(|id| RoleAssignment::new(id, Role::Viewer)),
        );
        source.fail_page_at(10);
        let (scheduler, cache) = scheduler(source, small_pages());
        cache.set(UserId::new(999), Role::Admin);

        let event = scheduler.run_cycle(SyncTrigger::Scheduled).await;

        assert_eq!(event.pages_failed, 1);
        assert_eq!(event.records_fetched, 20);
        assert_eq!(event.records_pruned, 0);
        assert_eq!(cache.peek(UserId::new(999)), Some(Role::Admin));
    }

    #[tokio::test]
    async fn test_clean_cycle_prunes_departed_users() {
        let source = InMemoryRoleSource::with_assignments([RoleAssignment::new(1, Role::Admin)]);
        let (scheduler, cache) = scheduler(source, small_pages());
        cache.set(UserId::new(2), Role::Coordinator);

        let event = scheduler.run_cycle(SyncTrigger::Scheduled).await;

        assert_eq!(event.records_pruned, 1);
        assert_eq!(cache.peek(UserId::new(2)), None);
        assert_eq!(cache.peek(UserId::new(1)), Some(Role::Admin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_timeout_on_first_page_fails_cycle() {
        let source = InMemoryRoleSource::with_assignments([RoleAssignment::new(1, Role::Admin)]);
        source.set_latency(Duration::from_secs(30));
        let (scheduler, cache) = scheduler(source, small_pages());

        let event = scheduler.run_cycle(SyncTrigger::Scheduled).await;

        assert_eq!(event.status(), SyncStatus::Failed);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_scheduler_runs_on_interval() {
        let source = InMemoryRoleSource::with_assignments([RoleAssignment::new(1, Role::Viewer)]);
        let (scheduler, _cache) = scheduler(
            source.clone(),
            SyncConfig {
                interval: Duration::from_secs(60),
                run_on_start: false,
                ..small_pages()
            },
        );

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(source.page_fetches(), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.page_fetches(), 1);

        let manual = handle.trigger_manual_sync().await.unwrap();
        assert_eq!(manual.trigger, SyncTrigger::Manual);
        assert_eq!(source.page_fetches(), 2);

        handle.shutdown().await;
        assert!(!handle.is_running());
        assert!(handle.trigger_manual_sync().await.is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(SyncConfig::default().validate().is_ok());
        let config = SyncConfig {
            page_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
