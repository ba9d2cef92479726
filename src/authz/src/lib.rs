//! # Roster Authorization
//!
//! Role resolution, roster synchronization and security auditing for a
//! roster-management bot.
//!
//! ## Features
//!
//! - **Striped TTL + LRU role cache** with hit/miss/expired reporting
//! - **Async-first design** using Tokio; only cache misses suspend
//! - **Periodic roster sync** with partial-failure accounting and manual triggers
//! - **Hash-chained audit trail** for every decision and sync cycle
//! - **Latency metrics** per cache path with Prometheus export
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use roster_authz::{
//!     Action, AuditConfig, AuthorizationResolver, CacheConfig, Decision, InMemoryRoleSource,
//!     MemoryAuditSink, ResolverConfig, Role, RoleAssignment, RoleCache, SecurityAuditService,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source =
//!         InMemoryRoleSource::with_assignments([RoleAssignment::new(42, Role::Coordinator)]);
//!     let audit = Arc::new(SecurityAuditService::new(
//!         AuditConfig::default(),
//!         Arc::new(MemoryAuditSink::new()),
//!     ));
//!     let cache = Arc::new(RoleCache::new(CacheConfig::default())?);
//!     let resolver =
//!         AuthorizationResolver::new(ResolverConfig::default(), cache, Arc::new(source), audit)?;
//!
//!     let resolution = resolver.resolve(42, &Action::new("export")).await;
//!     assert_eq!(resolution.decision, Decision::Granted);
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod engine;
pub mod error;
pub mod event;
pub mod source;
pub mod sync;
pub mod types;

// Re-export commonly used types
pub use audit::{
    read_jsonl, verify_chain, AuditConfig, AuditRecord, AuditRecordKind, AuditSink, AuditStats,
    ChainVerification, JsonlAuditSink, MemoryAuditSink, SecurityAuditService, Severity,
};
pub use engine::{
    AccessControlGuard, AccessDenied, AuthorizationResolver, CacheConfig, CacheLookup, CacheStats,
    EngineMetrics, MetricsCollector, ProtectedOperation, Resolution, ResolverConfig, RoleCache,
};
pub use error::{AuthzError, Result};
pub use event::{
    AuthorizationEvent, CacheState, Decision, PercentileBucket, PerformanceMetrics, SyncEvent,
    SyncStatus, SyncTrigger,
};
pub use source::{InMemoryRoleSource, JsonRosterSource, RawRoleRecord, RoleSource, RosterPage};
pub use sync::{RoleSyncScheduler, SyncConfig, SyncHandle, SyncState};
pub use types::{Action, ActionPolicy, Role, RoleAssignment, UserId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
