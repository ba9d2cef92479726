//! Role resolution engine
//!
//! Resolves a user's role through the striped cache, falls back to the role
//! source on a miss, decides against the action's required role, and hands
//! every decision to the audit service and metrics collector.

pub mod cache;
pub mod guard;
pub mod metrics;

pub use cache::{CacheConfig, CacheLookup, CacheStats, RoleCache};
pub use guard::{AccessControlGuard, AccessDenied, ProtectedOperation};
pub use metrics::{ActionCounters, EngineMetrics, LatencyPercentiles, MetricsCollector};

use crate::audit::SecurityAuditService;
use crate::error::{AuthzError, Result};
use crate::event::{AuthorizationEvent, CacheState, Decision, PerformanceMetrics};
use crate::source::RoleSource;
use crate::types::{Action, ActionPolicy, Role, UserId};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Resolver configuration
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Upper bound on a single role source lookup
    pub lookup_timeout: Duration,

    /// Required role per action
    pub policy: ActionPolicy,

    /// Feed each resolution's latency to the audit service
    pub record_performance: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            lookup_timeout: Duration::from_millis(250),
            policy: ActionPolicy::default(),
            record_performance: true,
        }
    }
}

impl ResolverConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lookup_timeout.is_zero() {
            return Err(AuthzError::Config("lookup_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Outcome of one resolution
#[derive(Debug, Clone)]
pub struct Resolution {
    /// Role the decision was based on
    pub role: Role,

    /// Decision
    pub decision: Decision,

    /// The audit event emitted for this resolution
    pub event: AuthorizationEvent,
}

impl Resolution {
    pub fn is_granted(&self) -> bool {
        self.decision.is_granted()
    }
}

/// Authorization resolver
///
/// # Architecture
///
/// ```text
/// user_id → RoleCache ──hit──────────────┐
///              │ miss/expired             ↓
///              └──→ RoleSource (timeout) → compare with required role → Decision
///                                                    ↓              ↓
///                                              [Audit trail]    [Metrics]
/// ```
pub struct AuthorizationResolver {
    /// Striped TTL + LRU role cache
    cache: Arc<RoleCache>,

    /// Source of truth consulted on misses
    source: Arc<dyn RoleSource>,

    /// Audit trail
    audit: Arc<SecurityAuditService>,

    /// Latency and decision metrics
    metrics: Arc<MetricsCollector>,

    config: ResolverConfig,
}

impl AuthorizationResolver {
    /// Create a resolver over shared components
    pub fn new(
        config: ResolverConfig,
        cache: Arc<RoleCache>,
        source: Arc<dyn RoleSource>,
        audit: Arc<SecurityAuditService>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache,
            source,
            audit,
            metrics: Arc::new(MetricsCollector::new()),
            config,
        })
    }

    /// Resolve against the role the action policy requires
    pub async fn resolve(&self, user_id: impl Into<UserId>, action: &Action) -> Resolution {
        let required_role = self.config.policy.required_role(action);
        self.resolve_for(user_id, action, required_role).await
    }

    /// Resolve against an explicit required role
    ///
    /// # Pipeline
    ///
    /// 1. Reject malformed user ids without any lookup
    /// 2. Check the cache
    /// 3. On miss or expiry, ask the role source under the lookup timeout
    /// 4. Compare the role with the required role
    /// 5. Emit exactly one audit event and record metrics
    ///
    /// Never fails: lookup problems become [`Decision::Error`].
    pub async fn resolve_for(
        &self,
        user_id: impl Into<UserId>,
        action: &Action,
        required_role: Role,
    ) -> Resolution {
        let user_id = user_id.into();
        let start = Instant::now();

        // Step 1: Malformed ids never reach the cache or the source
        if !user_id.is_valid() {
            let event = AuthorizationEvent::new(
                user_id,
                action,
                Decision::Denied,
                Role::None,
                required_role,
                CacheState::Miss,
                start.elapsed(),
            )
            .with_error(&AuthzError::InvalidUserId(user_id.get()));
            return self.finalize(event).await;
        }

        // Step 2: Check cache
        let lookup = self.cache.get(user_id);

        // Step 3: Fall back to the role source
        let (role, failure) = match lookup.role {
            Some(role) => (role, None),
            None => match self.fetch_role(user_id).await {
                Ok(role) => (role, None),
                Err(e) => (Role::None, Some(e)),
            },
        };

        // Step 4: Decide
        let decision = if failure.is_some() {
            Decision::Error
        } else if role.satisfies(required_role) {
            Decision::Granted
        } else {
            Decision::Denied
        };

        // Step 5: Audit and metrics
        let mut event = AuthorizationEvent::new(
            user_id,
            action,
            decision,
            role,
            required_role,
            lookup.state,
            start.elapsed(),
        );
        if let Some(e) = &failure {
            event = event.with_error(e);
        }

        self.finalize(event).await
    }

    /// Convenience: whether the action is allowed
    pub async fn is_allowed(&self, user_id: impl Into<UserId>, action: &Action) -> bool {
        self.resolve(user_id, action).await.is_granted()
    }

    /// Get resolver metrics
    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.get_metrics()
    }

    /// Metrics collector, for Prometheus export
    pub fn metrics_collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<RoleCache> {
        &self.cache
    }

    pub fn audit(&self) -> &Arc<SecurityAuditService> {
        &self.audit
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    // Private helper methods

    async fn fetch_role(&self, user_id: UserId) -> Result<Role> {
        // An invalidation that lands while the lookup is in flight must win.
        let observed_at = Instant::now();
        let timeout = self.config.lookup_timeout;

        let lookup = tokio::time::timeout(timeout, self.source.fetch_role(user_id));
        let assignment = match lookup.await {
            Ok(Ok(assignment)) => assignment,
            Ok(Err(e)) => {
                warn!(user_id = user_id.get(), error = %e, "Role lookup failed");
                return Err(e);
            }
            Err(_) => {
                warn!(
                    user_id = user_id.get(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Role lookup timed out"
                );
                return Err(AuthzError::LookupTimeout(timeout));
            }
        };

        // Unknown users are cached as `None` until the entry expires.
        let role = assignment.map(|a| a.role).unwrap_or(Role::None);
        if !self.cache.set_observed(user_id, role, observed_at) {
            debug!(user_id = user_id.get(), "Lookup result superseded by newer cache state");
        }
        Ok(role)
    }

    async fn finalize(&self, event: AuthorizationEvent) -> Resolution {
        let bucket = self.metrics.record(&event);

        debug!(
            user_id = event.user_id.get(),
            action = %event.action,
            decision = event.result.as_str(),
            cache_state = event.cache_state.as_str(),
            "Resolved role {}",
            event.resolved_role
        );

        // Queued for the audit writer; only waits if its queue is full
        self.audit.log_authorization_event(&event).await;

        if self.config.record_performance {
            let operation = match event.cache_state {
                CacheState::Hit => "resolve.hit",
                CacheState::Miss | CacheState::Expired => "resolve.miss",
            };
            self.audit
                .log_performance(&PerformanceMetrics::new(operation, event.latency(), bucket))
                .await;
        }

        Resolution {
            role: event.resolved_role,
            decision: event.result,
            event,
        }
    }
}
