//! Authorization node wiring the cache, resolver, scheduler and audit trail

use anyhow::{Context, Result};
use roster_authz::{
    read_jsonl, verify_chain, Action, AuditSink, AuthorizationResolver, ChainVerification,
    JsonRosterSource, JsonlAuditSink, MemoryAuditSink, Resolution, RoleCache, RoleSource,
    RoleSyncScheduler, SecurityAuditService, SyncEvent, SyncHandle, SyncTrigger,
};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;

/// Operator request delivered to a running node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Run a manual roster sync now
    Sync,
    /// Drop every cached role
    InvalidateAll,
}

/// Roster authorization node
pub struct AuthzNode {
    config: NodeConfig,

    /// Shared role cache
    cache: Arc<RoleCache>,

    /// Resolver used by `check` and protected operations
    resolver: Arc<AuthorizationResolver>,

    /// Roster sync scheduler
    scheduler: Arc<RoleSyncScheduler>,

    /// Audit trail shared by the resolver and scheduler
    audit: Arc<SecurityAuditService>,
}

impl AuthzNode {
    /// Create a node from configuration
    pub async fn new(config: NodeConfig) -> Result<Self> {
        info!("Initializing authorization node (roster {:?})", config.roster.path);

        // 1. Audit trail
        let sink: Arc<dyn AuditSink> = match &config.audit.path {
            Some(path) => {
                let sink = JsonlAuditSink::open(path)
                    .await
                    .with_context(|| format!("Failed to open audit trail {:?}", path))?;
                info!("Audit trail at {:?}", path);
                Arc::new(sink)
            }
            None => {
                info!("Audit trail kept in memory");
                Arc::new(MemoryAuditSink::new())
            }
        };
        let audit = Arc::new(
            SecurityAuditService::resume(config.audit_config(), sink)
                .await
                .context("Failed to resume audit trail")?,
        );

        // 2. Role source and cache
        let source: Arc<dyn RoleSource> = Arc::new(JsonRosterSource::new(&config.roster.path));
        let cache = Arc::new(
            RoleCache::new(config.cache_config()).context("Failed to initialize role cache")?,
        );

        // 3. Resolver and scheduler
        let resolver = Arc::new(
            AuthorizationResolver::new(
                config.resolver_config(),
                cache.clone(),
                source.clone(),
                audit.clone(),
            )
            .context("Failed to initialize resolver")?,
        );
        let scheduler = Arc::new(
            RoleSyncScheduler::new(config.sync_config(), cache.clone(), source, audit.clone())
                .context("Failed to initialize sync scheduler")?,
        );

        Ok(Self {
            config,
            cache,
            resolver,
            scheduler,
            audit,
        })
    }

    pub fn resolver(&self) -> &Arc<AuthorizationResolver> {
        &self.resolver
    }

    pub fn cache(&self) -> &Arc<RoleCache> {
        &self.cache
    }

    pub fn audit(&self) -> &Arc<SecurityAuditService> {
        &self.audit
    }

    /// Resolve one action for one user
    pub async fn check(&self, user_id: i64, action: &str) -> Resolution {
        self.resolver.resolve(user_id, &Action::new(action)).await
    }

    /// Run one manual sync cycle
    pub async fn sync_once(&self) -> SyncEvent {
        self.scheduler.run_cycle(SyncTrigger::Manual).await
    }

    /// Store every queued audit record and release the trail
    pub async fn close(&self) {
        self.audit.close().await;
    }

    /// Run the scheduler until `shutdown` completes, applying `control` commands meanwhile
    ///
    /// The audit trail is closed before returning.
    pub async fn run<F>(
        &self,
        shutdown: F,
        mut control: mpsc::Receiver<ControlCommand>,
    ) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting authorization node...");

        let handle = Arc::clone(&self.scheduler).spawn();
        let report_task = self.start_periodic_report();

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(command) = control.recv() => self.apply(&handle, command).await,
            }
        }
        info!("Initiating graceful shutdown...");

        if let Some(task) = report_task {
            task.abort();
        }
        handle.shutdown().await;
        self.close().await;

        info!(cache_entries = self.cache.len(), "Shutdown complete");
        Ok(())
    }

    async fn apply(&self, handle: &SyncHandle, command: ControlCommand) {
        match command {
            ControlCommand::Sync => match handle.trigger_manual_sync().await {
                Ok(event) => info!(
                    status = ?event.status(),
                    fetched = event.records_fetched,
                    failed = event.records_failed,
                    "Manual sync finished"
                ),
                Err(e) => warn!("Manual sync not run: {}", e),
            },
            ControlCommand::InvalidateAll => {
                let dropped = self.cache.invalidate_all();
                info!(dropped, "Role cache invalidated");
            }
        }
    }

    /// Periodically log cache statistics and resolver latency
    fn start_periodic_report(&self) -> Option<tokio::task::JoinHandle<()>> {
        let secs = self.config.metrics.report_interval_secs;
        if secs == 0 {
            return None;
        }

        let cache = self.cache.clone();
        let resolver = self.resolver.clone();
        Some(tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(secs));
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let stats = cache.stats();
                let metrics = resolver.metrics();
                info!(
                    size = stats.size,
                    capacity = stats.capacity,
                    hit_rate = stats.hit_rate(),
                    evictions = stats.evictions,
                    "Cache stats"
                );
                info!(
                    requests = metrics.total_requests,
                    hit_p95_ms = metrics.hit_latency.p95_ms,
                    miss_p99_ms = metrics.miss_latency.p99_ms,
                    "Resolver latency"
                );
                debug!("{}", resolver.metrics_collector().export_prometheus());
            }
        }))
    }
}

/// Verify a JSON Lines audit trail
pub async fn verify_audit_file(path: &Path) -> Result<ChainVerification> {
    let records = read_jsonl(path)
        .await
        .with_context(|| format!("Failed to read audit trail {:?}", path))?;
    Ok(verify_chain(&records))
}
