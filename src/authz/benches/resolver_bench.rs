//! Resolver and cache benchmarks
//!
//! Hit path should stay in the low microseconds; it never awaits.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use roster_authz::{
    Action, AuditConfig, AuthorizationResolver, CacheConfig, InMemoryRoleSource, MemoryAuditSink,
    ResolverConfig, Role, RoleAssignment, RoleCache, SecurityAuditService, UserId,
};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn bench_cache_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("cache_get");

    for shards in [1usize, 16, 64] {
        let cache = RoleCache::new(CacheConfig {
            shards,
            ..Default::default()
        })
        .unwrap();
        for id in 1..=10_000 {
            cache.set(UserId::new(id), Role::Viewer);
        }

        group.bench_with_input(BenchmarkId::new("shards", shards), &shards, |b, _| {
            let mut id = 0i64;
            b.iter(|| {
                id = id % 10_000 + 1;
                black_box(cache.get(UserId::new(id)))
            });
        });
    }

    group.finish();
}

fn bench_resolve_hit(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();

    let resolver = rt.block_on(async {
        let source = InMemoryRoleSource::with_assignments(
            (1..=1_000).map(|id| RoleAssignment::new(id, Role::Coordinator)),
        );
        let audit = Arc::new(SecurityAuditService::new(
            AuditConfig::default(),
            Arc::new(MemoryAuditSink::with_capacity(10_000)),
        ));
        let cache = Arc::new(RoleCache::new(CacheConfig::default()).unwrap());
        let resolver =
            AuthorizationResolver::new(ResolverConfig::default(), cache, Arc::new(source), audit)
                .unwrap();
        for id in 1..=1_000 {
            resolver.resolve(id, &Action::new("edit")).await;
        }
        resolver
    });

    let action = Action::new("edit");
    let mut id = 0i64;
    c.bench_function("resolve_hit", |b| {
        b.to_async(&rt).iter(|| {
            id = id % 1_000 + 1;
            let resolver = &resolver;
            let action = &action;
            let user = id;
            async move { black_box(resolver.resolve(user, action).await) }
        });
    });
}

criterion_group!(benches, bench_cache_get, bench_resolve_hit);
criterion_main!(benches);
