//! Resolver metrics: decision counters and latency percentiles per cache path

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::{AuthorizationEvent, CacheState, Decision, PercentileBucket};

/// Default number of latency samples kept per path
const DEFAULT_MAX_SAMPLES: usize = 10_000;

/// Percentile cut points are recomputed after this many new samples
const REFRESH_EVERY: usize = 128;

/// Latency percentiles in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyPercentiles {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub avg_ms: f64,
    pub samples: usize,
}

impl LatencyPercentiles {
    fn from_samples(samples: &VecDeque<f64>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = sorted.iter().sum();

        Self {
            p50_ms: percentile(&sorted, 0.50),
            p95_ms: percentile(&sorted, 0.95),
            p99_ms: percentile(&sorted, 0.99),
            max_ms: sorted[sorted.len() - 1],
            avg_ms: sum / sorted.len() as f64,
            samples: sorted.len(),
        }
    }

    /// Bucket a sample against these cut points
    pub fn bucket(&self, latency_ms: f64) -> PercentileBucket {
        if self.samples == 0 || latency_ms <= self.p50_ms {
            PercentileBucket::P50
        } else if latency_ms <= self.p95_ms {
            PercentileBucket::P95
        } else if latency_ms <= self.p99_ms {
            PercentileBucket::P99
        } else {
            PercentileBucket::Tail
        }
    }
}

/// Calculate percentile from sorted data
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let idx = ((sorted.len() as f64) * p) as usize;
    let idx = idx.min(sorted.len() - 1);
    sorted[idx]
}

/// Ring buffer of recent latency samples with cached cut points
#[derive(Debug)]
struct LatencyWindow {
    samples: VecDeque<f64>,
    max_samples: usize,
    since_refresh: usize,
    cut_points: LatencyPercentiles,
}

impl LatencyWindow {
    fn new(max_samples: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(max_samples.min(1_024)),
            max_samples,
            since_refresh: 0,
            cut_points: LatencyPercentiles::default(),
        }
    }

    /// Record a sample and return its bucket relative to the window
    fn record(&mut self, latency_ms: f64) -> PercentileBucket {
        let bucket = self.cut_points.bucket(latency_ms);

        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);

        self.since_refresh += 1;
        if self.since_refresh >= REFRESH_EVERY || self.samples.len() <= REFRESH_EVERY {
            self.cut_points = LatencyPercentiles::from_samples(&self.samples);
            self.since_refresh = 0;
        }

        bucket
    }

    fn snapshot(&self) -> LatencyPercentiles {
        LatencyPercentiles::from_samples(&self.samples)
    }

    fn clear(&mut self) {
        self.samples.clear();
        self.since_refresh = 0;
        self.cut_points = LatencyPercentiles::default();
    }
}

/// Per-action decision counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionCounters {
    pub granted: u64,
    pub denied: u64,
    pub errors: u64,
}

/// Snapshot of resolver performance
#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    /// Total number of resolutions
    pub total_requests: u64,
    pub granted_decisions: u64,
    pub denied_decisions: u64,
    pub error_decisions: u64,

    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_expired: u64,

    /// Latency of resolutions served from cache
    pub hit_latency: LatencyPercentiles,

    /// Latency of resolutions that went to the role source
    pub miss_latency: LatencyPercentiles,
}

impl EngineMetrics {
    /// Calculate cache hit rate
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses + self.cache_expired;
        if total == 0 {
            0.0
        } else {
            self.cache_hits as f64 / total as f64
        }
    }

    /// Calculate grant rate
    pub fn grant_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.granted_decisions as f64 / self.total_requests as f64
        }
    }
}

/// Metrics collector with Prometheus-compatible export
///
/// Recording never awaits; counters are atomics and each latency window sits
/// behind its own short-lived lock.
pub struct MetricsCollector {
    total_requests: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_expired: AtomicU64,
    hit_latency: Mutex<LatencyWindow>,
    miss_latency: Mutex<LatencyWindow>,
    by_action: DashMap<String, ActionCounters>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::with_max_samples(DEFAULT_MAX_SAMPLES)
    }

    /// Create a collector keeping at most `max_samples` latencies per path
    pub fn with_max_samples(max_samples: usize) -> Self {
        let max_samples = max_samples.max(1);
        Self {
            total_requests: AtomicU64::new(0),
            granted: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            cache_expired: AtomicU64::new(0),
            hit_latency: Mutex::new(LatencyWindow::new(max_samples)),
            miss_latency: Mutex::new(LatencyWindow::new(max_samples)),
            by_action: DashMap::new(),
        }
    }

    /// Record one resolution; returns where its latency falls on its path
    pub fn record(&self, event: &AuthorizationEvent) -> PercentileBucket {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        match event.result {
            Decision::Granted => self.granted.fetch_add(1, Ordering::Relaxed),
            Decision::Denied => self.denied.fetch_add(1, Ordering::Relaxed),
            Decision::Error => self.errors.fetch_add(1, Ordering::Relaxed),
        };

        {
            let mut counters = self.by_action.entry(event.action.clone()).or_default();
            match event.result {
                Decision::Granted => counters.granted += 1,
                Decision::Denied => counters.denied += 1,
                Decision::Error => counters.errors += 1,
            }
        }

        match event.cache_state {
            CacheState::Hit => {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                self.hit_latency.lock().record(event.latency_ms)
            }
            CacheState::Miss => {
                self.cache_misses.fetch_add(1, Ordering::Relaxed);
                self.miss_latency.lock().record(event.latency_ms)
            }
            CacheState::Expired => {
                self.cache_expired.fetch_add(1, Ordering::Relaxed);
                self.miss_latency.lock().record(event.latency_ms)
            }
        }
    }

    /// Get current metrics snapshot
    pub fn get_metrics(&self) -> EngineMetrics {
        EngineMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            granted_decisions: self.granted.load(Ordering::Relaxed),
            denied_decisions: self.denied.load(Ordering::Relaxed),
            error_decisions: self.errors.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            cache_expired: self.cache_expired.load(Ordering::Relaxed),
            hit_latency: self.hit_latency.lock().snapshot(),
            miss_latency: self.miss_latency.lock().snapshot(),
        }
    }

    /// Decision counters for one action
    pub fn action_counters(&self, action: &str) -> ActionCounters {
        self.by_action
            .get(action)
            .map(|counters| *counters)
            .unwrap_or_default()
    }

    /// Reset all metrics
    pub fn reset(&self) {
        for counter in [
            &self.total_requests,
            &self.granted,
            &self.denied,
            &self.errors,
            &self.cache_hits,
            &self.cache_misses,
            &self.cache_expired,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.hit_latency.lock().clear();
        self.miss_latency.lock().clear();
        self.by_action.clear();
    }

    /// Export metrics in Prometheus format
    pub fn export_prometheus(&self) -> String {
        let metrics = self.get_metrics();

        let mut out = format!(
            r#"# HELP roster_authz_requests_total Total number of authorization resolutions
# TYPE roster_authz_requests_total counter
roster_authz_requests_total {}

# HELP roster_authz_decisions_total Decisions by result
# TYPE roster_authz_decisions_total counter
roster_authz_decisions_total{{result="granted"}} {}
roster_authz_decisions_total{{result="denied"}} {}
roster_authz_decisions_total{{result="error"}} {}

# HELP roster_authz_cache_lookups_total Cache lookups by state
# TYPE roster_authz_cache_lookups_total counter
roster_authz_cache_lookups_total{{state="hit"}} {}
roster_authz_cache_lookups_total{{state="miss"}} {}
roster_authz_cache_lookups_total{{state="expired"}} {}

# HELP roster_authz_latency_seconds Resolution latency percentiles by cache path
# TYPE roster_authz_latency_seconds summary
"#,
            metrics.total_requests,
            metrics.granted_decisions,
            metrics.denied_decisions,
            metrics.error_decisions,
            metrics.cache_hits,
            metrics.cache_misses,
            metrics.cache_expired,
        );

        for (path, latency) in [("hit", &metrics.hit_latency), ("miss", &metrics.miss_latency)] {
            for (quantile, value) in [
                ("0.5", latency.p50_ms),
                ("0.95", latency.p95_ms),
                ("0.99", latency.p99_ms),
            ] {
                let _ = writeln!(
                    out,
                    "roster_authz_latency_seconds{{path=\"{}\",quantile=\"{}\"}} {}",
                    path,
                    quantile,
                    value / 1000.0
                );
            }
        }

        out
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
