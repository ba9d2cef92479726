//! Roster sync tests
//!
//! Tests for full-roster refresh, partial failure accounting, total failure
//! isolation, manual triggers and interaction with concurrent invalidation.

use roster_authz::{
    AuditConfig, CacheConfig, InMemoryRoleSource, MemoryAuditSink, RawRoleRecord, Role,
    RoleAssignment, RoleCache, RoleSyncScheduler, SecurityAuditService, SyncConfig, SyncState,
    SyncStatus, SyncTrigger, UserId,
};
use std::sync::Arc;
use std::time::Duration;

struct Fixture {
    scheduler: Arc<RoleSyncScheduler>,
    cache: Arc<RoleCache>,
    audit: Arc<SecurityAuditService>,
    sink: Arc<MemoryAuditSink>,
}

fn fixture(source: InMemoryRoleSource, config: SyncConfig) -> Fixture {
    let cache = Arc::new(RoleCache::new(CacheConfig::default()).unwrap());
    let sink = Arc::new(MemoryAuditSink::new());
    let audit = Arc::new(SecurityAuditService::new(AuditConfig::default(), sink.clone()));
    let scheduler =
        RoleSyncScheduler::new(config, cache.clone(), Arc::new(source), audit.clone()).unwrap();

    Fixture {
        scheduler: Arc::new(scheduler),
        cache,
        audit,
        sink,
    }
}

fn role_for(id: i64) -> Role {
    match id % 3 {
        0 => Role::Viewer,
        1 => Role::Coordinator,
        _ => Role::Admin,
    }
}

// ============================================================================
// PARTIAL FAILURES
// ============================================================================

#[tokio::test]
async fn test_thousand_records_one_malformed() {
    // TDD: 1000 rows with a malformed one at position 500 → 999 fetched, 1 failed
    let mut records: Vec<RawRoleRecord> = (1..=1000)
        .map(|id| RawRoleRecord::new(id, role_for(id)))
        .collect();
    records[500].role = None;
    let malformed_id = records[500].user_id.unwrap();

    let f = fixture(InMemoryRoleSource::with_records(records), SyncConfig::default());
    let event = f.scheduler.run_cycle(SyncTrigger::Scheduled).await;

    assert_eq!(event.records_fetched, 999);
    assert_eq!(event.records_failed, 1);
    assert_eq!(event.failed_ids, vec![malformed_id]);
    assert_eq!(event.status(), SyncStatus::Partial);
    assert_eq!(f.cache.len(), 999);
    assert_eq!(f.cache.peek(UserId::new(malformed_id)), None);
}

#[tokio::test]
async fn test_two_of_hundred_malformed() {
    // TDD: 98 valid rows applied, 2 reported with their ids
    let mut records: Vec<RawRoleRecord> = (1..=100)
        .map(|id| RawRoleRecord::new(id, Role::Viewer))
        .collect();
    records[16].role = Some("root".into());
    records[62].role = Some("".into());
    records[62].user_id = Some(-63);

    let f = fixture(
        InMemoryRoleSource::with_records(records),
        SyncConfig {
            page_size: 25,
            ..Default::default()
        },
    );
    let event = f.scheduler.run_cycle(SyncTrigger::Manual).await;

    assert_eq!(event.records_fetched, 98);
    assert_eq!(event.records_failed, 2);
    assert_eq!(event.failed_ids, vec![17, -63]);
    assert_eq!(f.cache.len(), 98);

    f.audit.flush().await;
    let logged = f.sink.sync_events().await;
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].failed_ids, vec![17, -63]);
    assert_eq!(logged[0].trigger, SyncTrigger::Manual);
}

#[tokio::test]
async fn test_empty_role_cell_is_malformed() {
    // TDD: a blank role is a missing field, not a deny-all `none` assignment
    let records = vec![
        RawRoleRecord::new(4, Role::Viewer),
        RawRoleRecord {
            user_id: Some(5),
            role: Some(String::new()),
        },
        RawRoleRecord::new(6, Role::None),
    ];
    let f = fixture(InMemoryRoleSource::with_records(records), SyncConfig::default());

    let event = f.scheduler.run_cycle(SyncTrigger::Manual).await;

    assert_eq!(event.records_fetched, 2);
    assert_eq!(event.records_failed, 1);
    assert_eq!(event.failed_ids, vec![5]);
    assert_eq!(f.cache.peek(UserId::new(5)), None);
    assert_eq!(f.cache.peek(UserId::new(6)), Some(Role::None));
}

#[tokio::test]
async fn test_total_failure_isolated_from_cache() {
    // TDD: source down → error event, cache contents unchanged
    let source = InMemoryRoleSource::with_assignments([RoleAssignment::new(1, Role::Viewer)]);
    let f = fixture(source.clone(), SyncConfig::default());
    f.cache.set(UserId::new(1), Role::Admin);
    f.cache.set(UserId::new(2), Role::Coordinator);
    source.set_failing(true);

    let event = f.scheduler.run_cycle(SyncTrigger::Scheduled).await;

    assert_eq!(event.status(), SyncStatus::Failed);
    assert_eq!(event.records_fetched, 0);
    assert_eq!(f.cache.peek(UserId::new(1)), Some(Role::Admin));
    assert_eq!(f.cache.peek(UserId::new(2)), Some(Role::Coordinator));
    assert_eq!(f.scheduler.state(), SyncState::Idle);
    assert!(f.scheduler.last_event().unwrap().error.is_some());
}

// ============================================================================
// REFRESH SEMANTICS
// ============================================================================

#[tokio::test]
async fn test_sync_overwrites_stale_roles() {
    // TDD: a clean cycle replaces cached roles and drops departed users
    let source = InMemoryRoleSource::with_assignments([
        RoleAssignment::new(1, Role::Admin),
        RoleAssignment::new(2, Role::Viewer),
    ]);
    let f = fixture(source.clone(), SyncConfig::default());
    f.scheduler.run_cycle(SyncTrigger::Scheduled).await;

    source.upsert(2, Role::Coordinator).await;
    source.remove(1).await;
    let event = f.scheduler.run_cycle(SyncTrigger::Scheduled).await;

    assert_eq!(event.records_pruned, 1);
    assert_eq!(f.cache.peek(UserId::new(1)), None);
    assert_eq!(f.cache.peek(UserId::new(2)), Some(Role::Coordinator));
}

#[tokio::test(start_paused = true)]
async fn test_invalidation_during_sync_wins() {
    // TDD: a manual invalidation after a page was read is not overwritten by that page
    let source = InMemoryRoleSource::with_assignments([RoleAssignment::new(1, Role::Admin)]);
    source.set_latency(Duration::from_millis(200));
    let f = fixture(source, SyncConfig::default());

    let scheduler = Arc::clone(&f.scheduler);
    let cycle = tokio::spawn(async move { scheduler.run_cycle(SyncTrigger::Scheduled).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.scheduler.state(), SyncState::Running);
    f.cache.invalidate(UserId::new(1));

    let event = cycle.await.unwrap();
    assert_eq!(event.records_fetched, 1);
    assert_eq!(f.cache.peek(UserId::new(1)), None);
}

// ============================================================================
// SCHEDULING
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scheduled_and_manual_cycles() {
    // TDD: cycles run every interval; manual triggers run immediately
    let source = InMemoryRoleSource::with_assignments([RoleAssignment::new(1, Role::Viewer)]);
    let f = fixture(
        source.clone(),
        SyncConfig {
            interval: Duration::from_secs(60),
            ..Default::default()
        },
    );

    let handle = Arc::clone(&f.scheduler).spawn();

    // run_on_start
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(source.page_fetches(), 1);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(source.page_fetches(), 3);

    let event = handle.trigger_manual_sync().await.unwrap();
    assert_eq!(event.trigger, SyncTrigger::Manual);
    assert_eq!(handle.last_event().map(|e| e.event_id), Some(event.event_id));

    handle.shutdown().await;
    f.audit.flush().await;
    assert_eq!(f.sink.sync_events().await.len(), 4);
}
