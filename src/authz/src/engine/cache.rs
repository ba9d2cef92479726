//! Striped TTL + LRU role cache
//!
//! Maps user ids to their last known role. The map is split into stripes, each
//! guarded by its own `parking_lot::Mutex` around an `lru::LruCache`, so
//! concurrent lookups for different users rarely contend and the hit path never
//! awaits. Counters are lock-free atomics.
//!
//! Capacity and recency are global. Every touch takes a tick from a shared
//! clock, so each stripe's LRU tail is its oldest entry, and a full cache
//! evicts the tail with the oldest tick across all stripes. Admitting a new
//! user is serialized; hits and overwrites only take their own stripe lock.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{AuthzError, Result};
use crate::event::CacheState;
use crate::types::{Role, UserId};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries across all stripes
    pub capacity: usize,

    /// Time-to-live for cached roles
    pub ttl: Duration,

    /// Number of independently locked stripes
    pub shards: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(60),
            shards: 16,
        }
    }
}

impl CacheConfig {
    /// Check the configuration can build a cache
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(AuthzError::Config("cache capacity must be non-zero".to_string()));
        }
        if self.ttl.is_zero() {
            return Err(AuthzError::Config("cache ttl must be non-zero".to_string()));
        }
        if self.shards == 0 {
            return Err(AuthzError::Config("cache shards must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLookup {
    /// Cached role, present only on `Hit`
    pub role: Option<Role>,

    /// Lookup classification
    pub state: CacheState,
}

impl CacheLookup {
    fn hit(role: Role) -> Self {
        Self {
            role: Some(role),
            state: CacheState::Hit,
        }
    }

    fn miss() -> Self {
        Self {
            role: None,
            state: CacheState::Miss,
        }
    }

    fn expired() -> Self {
        Self {
            role: None,
            state: CacheState::Expired,
        }
    }
}

/// Cached role with freshness data
#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    role: Role,
    cached_at: Instant,
    /// When the role was read from the source; orders competing writers
    observed_at: Instant,
    ttl: Duration,
    /// Clock tick of the last touch
    last_used: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.cached_at) > self.ttl
    }
}

/// One stripe of the cache
struct Shard {
    entries: LruCache<UserId, CacheEntry>,
    /// Per-user invalidation times; older observations are rejected
    tombstones: HashMap<UserId, Instant>,
    /// Last `invalidate_all` on this stripe
    cleared_at: Option<Instant>,
}

impl Shard {
    fn new() -> Self {
        Self {
            // Bounded globally by RoleCache
            entries: LruCache::unbounded(),
            tombstones: HashMap::new(),
            cleared_at: None,
        }
    }

    /// Tick of this stripe's least recently used entry
    fn oldest_tick(&self) -> Option<u64> {
        self.entries.peek_lru().map(|(_, entry)| entry.last_used)
    }

    fn is_superseded(&self, user_id: UserId, observed_at: Instant) -> bool {
        if self.cleared_at.is_some_and(|cleared| cleared > observed_at) {
            return true;
        }
        if self
            .tombstones
            .get(&user_id)
            .is_some_and(|invalidated| *invalidated > observed_at)
        {
            return true;
        }
        self.entries
            .peek(&user_id)
            .is_some_and(|existing| existing.observed_at > observed_at)
    }

    fn expire_tombstones(&mut self, now: Instant, ttl: Duration) {
        self.tombstones
            .retain(|_, invalidated| now.saturating_duration_since(*invalidated) <= ttl);
        if self
            .cleared_at
            .is_some_and(|cleared| now.saturating_duration_since(cleared) > ttl)
        {
            self.cleared_at = None;
        }
    }
}

/// Bounded, thread-safe user → role cache
///
/// Provides:
/// - Striped locking for low contention
/// - TTL-based expiration, reported as [`CacheState::Expired`]
/// - Global LRU eviction at capacity
/// - Last-writer-wins writes for sync data via [`RoleCache::set_observed`]
pub struct RoleCache {
    shards: Box<[Mutex<Shard>]>,
    config: CacheConfig,
    /// Entries across all stripes
    len: AtomicUsize,
    /// Recency clock shared by all stripes
    clock: AtomicU64,
    /// Held while admitting a new user, so the total stays within capacity
    admission: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
    expirations: AtomicU64,
    evictions: AtomicU64,
}

impl RoleCache {
    /// Create a new role cache
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;

        let shards = (0..config.shards)
            .map(|_| Mutex::new(Shard::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            capacity = config.capacity,
            shards = config.shards,
            ttl_ms = config.ttl.as_millis() as u64,
            "Role cache initialized"
        );

        Ok(Self {
            shards,
            config,
            len: AtomicUsize::new(0),
            clock: AtomicU64::new(0),
            admission: Mutex::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        })
    }

    /// Look up a user's role
    ///
    /// Expired entries are removed and reported as `Expired`.
    pub fn get(&self, user_id: UserId) -> CacheLookup {
        let now = Instant::now();
        let mut shard = self.shard(user_id).lock();

        let found = match shard.entries.get_mut(&user_id) {
            Some(entry) if entry.is_expired(now) => Some(None),
            Some(entry) => {
                entry.last_used = self.tick();
                Some(Some(entry.role))
            }
            None => None,
        };

        match found {
            Some(None) => {
                shard.entries.pop(&user_id);
                self.len.fetch_sub(1, Ordering::AcqRel);
                self.expirations.fetch_add(1, Ordering::Relaxed);
                CacheLookup::expired()
            }
            Some(Some(role)) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                CacheLookup::hit(role)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::miss()
            }
        }
    }

    /// Store a role, overwriting any existing entry
    ///
    /// At capacity the least recently used entry is evicted first.
    pub fn set(&self, user_id: UserId, role: Role) {
        self.write(user_id, role, Instant::now(), false);
    }

    /// Store a role read from the source at `observed_at`
    ///
    /// The write is dropped when a newer observation or an invalidation of
    /// this user (or of the whole cache) happened after `observed_at`.
    /// Returns whether the entry was written.
    pub fn set_observed(&self, user_id: UserId, role: Role, observed_at: Instant) -> bool {
        self.write(user_id, role, observed_at, true)
    }

    /// Remove one user's entry. Returns whether an entry existed.
    pub fn invalidate(&self, user_id: UserId) -> bool {
        let now = Instant::now();
        let mut shard = self.shard(user_id).lock();

        shard.expire_tombstones(now, self.config.ttl);
        shard.tombstones.insert(user_id, now);
        let removed = shard.entries.pop(&user_id).is_some();
        if removed {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }

        debug!(user_id = %user_id, removed, "Role cache entry invalidated");
        removed
    }

    /// Remove every entry. Returns the number removed.
    pub fn invalidate_all(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let count = shard.entries.len();
            self.len.fetch_sub(count, Ordering::AcqRel);
            removed += count;
            shard.entries.clear();
            shard.tombstones.clear();
            shard.cleared_at = Some(now);
        }

        debug!(removed, "Role cache cleared");
        removed
    }

    /// Invalidate entries for users not in `keep` observed no later than
    /// `cutoff`. Returns the number removed.
    pub fn prune_absent(&self, keep: &HashSet<UserId>, cutoff: Instant) -> usize {
        let mut removed = 0;

        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let stale: Vec<UserId> = shard
                .entries
                .iter()
                .filter(|(user_id, entry)| {
                    !keep.contains(*user_id) && entry.observed_at <= cutoff
                })
                .map(|(user_id, _)| *user_id)
                .collect();

            for user_id in stale {
                if shard.entries.pop(&user_id).is_some() {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    removed += 1;
                }
            }
        }

        removed
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        for shard in self.shards.iter() {
            let mut shard = shard.lock();
            let expired: Vec<UserId> = shard
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired(now))
                .map(|(user_id, _)| *user_id)
                .collect();

            for user_id in expired {
                if shard.entries.pop(&user_id).is_some() {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    removed += 1;
                }
            }
            shard.expire_tombstones(now, self.config.ttl);
        }

        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Read a cached role without touching LRU order or statistics
    pub fn peek(&self, user_id: UserId) -> Option<Role> {
        let now = Instant::now();
        let shard = self.shard(user_id).lock();
        shard
            .entries
            .peek(&user_id)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.role)
    }

    /// Number of entries currently stored (including not yet purged expired ones)
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Snapshot of cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            capacity: self.config.capacity,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    fn write(&self, user_id: UserId, role: Role, observed_at: Instant, guarded: bool) -> bool {
        let now = Instant::now();

        // Existing user: overwrite in place under the stripe lock only
        {
            let mut shard = self.shard(user_id).lock();
            if guarded && shard.is_superseded(user_id, observed_at) {
                return false;
            }
            if !guarded {
                shard.tombstones.remove(&user_id);
            }
            if shard.entries.contains(&user_id) {
                let entry = self.entry(role, now, observed_at);
                shard.entries.put(user_id, entry);
                return true;
            }
        }

        // New user: make room first so the total never exceeds capacity
        let _admission = self.admission.lock();
        while self.len.load(Ordering::Acquire) >= self.config.capacity {
            if !self.evict_lru() {
                break;
            }
        }

        let mut shard = self.shard(user_id).lock();
        if guarded && shard.is_superseded(user_id, observed_at) {
            return false;
        }
        let entry = self.entry(role, now, observed_at);
        if shard.entries.put(user_id, entry).is_none() {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
        true
    }

    /// Evict the entry with the oldest tick across all stripes.
    /// Caller holds `admission`; at most one stripe lock is held at a time.
    fn evict_lru(&self) -> bool {
        loop {
            let oldest = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(index, shard)| shard.lock().oldest_tick().map(|tick| (tick, index)))
                .min();
            let Some((tick, index)) = oldest else {
                return false;
            };

            let mut shard = self.shards[index].lock();
            // A hit may have promoted the tail since the scan
            if shard.oldest_tick() == Some(tick) {
                shard.entries.pop_lru();
                self.len.fetch_sub(1, Ordering::AcqRel);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                return true;
            }
        }
    }

    /// Build an entry; call with the target stripe locked so ticks stay ordered
    fn entry(&self, role: Role, now: Instant, observed_at: Instant) -> CacheEntry {
        CacheEntry {
            role,
            cached_at: now,
            observed_at,
            ttl: self.config.ttl,
            last_used: self.tick(),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn shard(&self, user_id: UserId) -> &Mutex<Shard> {
        // Fibonacci hashing spreads sequential ids across stripes
        let hash = (user_id.get() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let index = (hash >> 32) as usize % self.shards.len();
        &self.shards[index]
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently stored
    pub size: usize,
    /// Configured capacity
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub expirations: u64,
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate cache hit rate (expired lookups count as misses)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.expirations;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
