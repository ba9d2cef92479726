//! Security audit trail
//!
//! Every authorization decision and sync cycle becomes:
//! - a structured `tracing` event with `target: "audit"` at a severity chosen
//!   from latency thresholds and outcome
//! - an [`AuditRecord`] appended to an [`AuditSink`], chained to its
//!   predecessor with a blake3 hash so edits, deletions and reorderings of the
//!   stored trail are detectable with [`verify_chain`]
//!
//! Records are appended by a single writer task that owns the chain, so
//! callers never wait on the sink while the queue has room. Logging never
//! fails the caller. Sink errors are reported through `tracing` and counted in
//! [`SecurityAuditService::sink_failures`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use fs2::FileExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, Mutex, RwLock};

use crate::error::{AuthzError, Result};
use crate::event::{
    AuthorizationEvent, CacheState, Decision, PercentileBucket, PerformanceMetrics, SyncEvent,
    SyncStatus,
};
use crate::types::UserId;

/// `prev_hash` of the first record in a trail
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Default number of records kept by [`MemoryAuditSink`]
const DEFAULT_MEMORY_CAPACITY: usize = 100_000;

macro_rules! audit_event {
    ($severity:expr, $($arg:tt)+) => {
        match $severity {
            Severity::Debug => tracing::debug!(target: "audit", $($arg)+),
            Severity::Info => tracing::info!(target: "audit", $($arg)+),
            Severity::Warn => tracing::warn!(target: "audit", $($arg)+),
            Severity::Error => tracing::error!(target: "audit", $($arg)+),
        }
    };
}

/// Audit severity, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warn,
    Error,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Latency thresholds used to pick severities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Resolutions served from cache slower than this are logged at warn
    #[serde(with = "duration_ms")]
    pub hit_sla: Duration,

    /// Resolutions that went to the role source slower than this are logged at warn
    #[serde(with = "duration_ms")]
    pub miss_sla: Duration,

    /// Sync cycles slower than this are logged at warn
    #[serde(with = "duration_ms")]
    pub sync_sla: Duration,

    /// Records buffered for the writer before logging waits on the sink
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    4096
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            hit_sla: Duration::from_millis(100),
            miss_sla: Duration::from_millis(300),
            sync_sla: Duration::from_secs(30),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl AuditConfig {
    /// Threshold for an operation name as used in [`PerformanceMetrics`]
    pub fn sla_for(&self, operation: &str) -> Duration {
        match operation {
            "resolve.hit" => self.hit_sla,
            "sync" => self.sync_sla,
            _ => self.miss_sla,
        }
    }

    fn sla_for_cache_state(&self, state: CacheState) -> Duration {
        match state {
            CacheState::Hit => self.hit_sla,
            CacheState::Miss | CacheState::Expired => self.miss_sla,
        }
    }

    /// Severity of an authorization decision
    pub fn authorization_severity(&self, event: &AuthorizationEvent) -> Severity {
        let slow = event.latency() > self.sla_for_cache_state(event.cache_state);
        match event.result {
            Decision::Error => Severity::Error,
            _ if slow => Severity::Warn,
            Decision::Denied => Severity::Info,
            Decision::Granted => Severity::Debug,
        }
    }

    /// Severity of a finished sync cycle
    pub fn sync_severity(&self, event: &SyncEvent) -> Severity {
        match event.status() {
            SyncStatus::Failed => Severity::Error,
            SyncStatus::Partial => Severity::Warn,
            SyncStatus::Succeeded if event.duration() > self.sync_sla => Severity::Warn,
            SyncStatus::Succeeded => Severity::Info,
        }
    }

    /// Severity of a latency sample
    pub fn performance_severity(&self, metric: &PerformanceMetrics) -> Severity {
        let sla_ms = self.sla_for(&metric.operation).as_secs_f64() * 1000.0;
        if metric.duration_ms > sla_ms {
            Severity::Warn
        } else if metric.percentile_bucket == PercentileBucket::Tail {
            Severity::Info
        } else {
            Severity::Debug
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Kind of payload carried by an [`AuditRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditRecordKind {
    Authorization,
    Sync,
    Performance,
}

impl AuditRecordKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditRecordKind::Authorization => "authorization",
            AuditRecordKind::Sync => "sync",
            AuditRecordKind::Performance => "performance",
        }
    }
}

/// One entry of the stored audit trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Position in the trail, starting at 0
    pub sequence: u64,

    /// Payload kind
    pub kind: AuditRecordKind,

    /// Severity the event was logged at
    pub severity: Severity,

    /// When the record was appended
    pub recorded_at: DateTime<Utc>,

    /// Serialized event
    pub payload: Value,

    /// Hash of the previous record ([`GENESIS_HASH`] for the first)
    pub prev_hash: String,

    /// blake3 hash over every other field
    pub hash: String,
}

impl AuditRecord {
    fn seal(
        sequence: u64,
        kind: AuditRecordKind,
        severity: Severity,
        payload: Value,
        prev_hash: String,
    ) -> Self {
        let mut record = Self {
            sequence,
            kind,
            severity,
            recorded_at: Utc::now(),
            payload,
            prev_hash,
            hash: String::new(),
        };
        record.hash = record.compute_hash();
        record
    }

    /// Recompute the content hash
    pub fn compute_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.sequence.to_le_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.severity.as_str().as_bytes());
        hasher.update(self.recorded_at.to_rfc3339().as_bytes());
        hasher.update(self.payload.to_string().as_bytes());
        hasher.update(self.prev_hash.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    /// Authorization payload, if this is an authorization record
    pub fn authorization_event(&self) -> Option<AuthorizationEvent> {
        match self.kind {
            AuditRecordKind::Authorization => serde_json::from_value(self.payload.clone()).ok(),
            _ => None,
        }
    }

    /// Sync payload, if this is a sync record
    pub fn sync_event(&self) -> Option<SyncEvent> {
        match self.kind {
            AuditRecordKind::Sync => serde_json::from_value(self.payload.clone()).ok(),
            _ => None,
        }
    }
}

/// Result of [`verify_chain`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    /// Records examined before stopping
    pub records_checked: usize,

    /// Whether the whole slice is intact
    pub valid: bool,

    /// Sequence number of the first bad record
    pub first_break_at: Option<u64>,

    /// What was wrong with it
    pub reason: Option<String>,
}

/// Verify a slice of the trail
///
/// A slice starting at sequence 0 must start from [`GENESIS_HASH`]; a slice
/// starting later (a bounded buffer that dropped old records) is anchored on
/// its first record.
pub fn verify_chain(records: &[AuditRecord]) -> ChainVerification {
    let broken = |index: usize, record: &AuditRecord, reason: String| ChainVerification {
        records_checked: index + 1,
        valid: false,
        first_break_at: Some(record.sequence),
        reason: Some(reason),
    };

    let mut previous: Option<&AuditRecord> = None;
    for (index, record) in records.iter().enumerate() {
        if record.compute_hash() != record.hash {
            return broken(index, record, "content does not match hash".to_string());
        }

        match previous {
            None if record.sequence == 0 && record.prev_hash != GENESIS_HASH => {
                return broken(index, record, "first record not linked to genesis".to_string());
            }
            None => {}
            Some(prev) => {
                if record.sequence != prev.sequence + 1 {
                    return broken(
                        index,
                        record,
                        format!(
                            "expected sequence {}, found {}",
                            prev.sequence + 1,
                            record.sequence
                        ),
                    );
                }
                if record.prev_hash != prev.hash {
                    return broken(index, record, "previous hash mismatch".to_string());
                }
            }
        }
        previous = Some(record);
    }

    ChainVerification {
        records_checked: records.len(),
        valid: true,
        first_break_at: None,
        reason: None,
    }
}

/// Append-only destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist one record
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    /// Last stored record's `(sequence, hash)`, for resuming a chain
    async fn chain_head(&self) -> Result<Option<(u64, String)>> {
        Ok(None)
    }
}

/// Audit statistics over the buffered records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditStats {
    pub total_decisions: usize,
    pub granted: usize,
    pub denied: usize,
    pub errors: usize,
    pub sync_cycles: usize,
    pub avg_latency_ms: f64,
}

/// Bounded in-memory sink; the oldest records are dropped at capacity
pub struct MemoryAuditSink {
    buffer: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// All buffered records, oldest first
    pub async fn records(&self) -> Vec<AuditRecord> {
        self.buffer.read().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.buffer.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffer.read().await.is_empty()
    }

    /// Authorization events for one user, oldest first
    pub async fn query_by_user(&self, user_id: UserId) -> Vec<AuthorizationEvent> {
        self.buffer
            .read()
            .await
            .iter()
            .filter_map(AuditRecord::authorization_event)
            .filter(|event| event.user_id == user_id)
            .collect()
    }

    /// All buffered authorization events
    pub async fn authorization_events(&self) -> Vec<AuthorizationEvent> {
        self.buffer
            .read()
            .await
            .iter()
            .filter_map(AuditRecord::authorization_event)
            .collect()
    }

    /// All buffered sync events
    pub async fn sync_events(&self) -> Vec<SyncEvent> {
        self.buffer
            .read()
            .await
            .iter()
            .filter_map(AuditRecord::sync_event)
            .collect()
    }

    /// Get audit statistics
    pub async fn stats(&self) -> AuditStats {
        let buffer = self.buffer.read().await;
        let decisions: Vec<AuthorizationEvent> = buffer
            .iter()
            .filter_map(AuditRecord::authorization_event)
            .collect();

        let total = decisions.len();
        let count = |decision: Decision| decisions.iter().filter(|e| e.result == decision).count();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            decisions.iter().map(|e| e.latency_ms).sum::<f64>() / total as f64
        };

        AuditStats {
            total_decisions: total,
            granted: count(Decision::Granted),
            denied: count(Decision::Denied),
            errors: count(Decision::Error),
            sync_cycles: buffer
                .iter()
                .filter(|record| record.kind == AuditRecordKind::Sync)
                .count(),
            avg_latency_ms,
        }
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut buffer = self.buffer.write().await;
        if buffer.len() == self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(record.clone());
        Ok(())
    }

    async fn chain_head(&self) -> Result<Option<(u64, String)>> {
        Ok(self
            .buffer
            .read()
            .await
            .back()
            .map(|record| (record.sequence, record.hash.clone())))
    }
}

/// Append-only JSON Lines file sink
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl JsonlAuditSink {
    /// Open (or create) the file for appending
    ///
    /// Takes an exclusive lock held until the sink is dropped. Fails with
    /// [`AuthzError::Sink`] when another writer already holds the trail.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        file.try_lock_exclusive().map_err(|e| {
            AuthzError::Sink(format!(
                "audit trail {} is held by another writer: {}",
                path.display(),
                e
            ))
        })?;

        Ok(Self {
            path,
            file: Mutex::new(tokio::fs::File::from_std(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn chain_head(&self) -> Result<Option<(u64, String)>> {
        let records = read_jsonl(&self.path).await?;
        Ok(records.last().map(|record| (record.sequence, record.hash.clone())))
    }
}

/// Read every record from a JSON Lines audit file
pub async fn read_jsonl(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(AuthzError::from))
        .collect()
}

#[derive(Debug)]
struct ChainState {
    next_sequence: u64,
    last_hash: String,
}

enum AuditCommand {
    Append {
        kind: AuditRecordKind,
        severity: Severity,
        payload: Value,
    },
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

/// Owns the chain and the sink; the only task that appends records
struct AuditWriter {
    sink: Arc<dyn AuditSink>,
    chain: ChainState,
    failures: Arc<AtomicU64>,
}

impl AuditWriter {
    async fn run(mut self, mut queue: mpsc::Receiver<AuditCommand>) {
        while let Some(command) = queue.recv().await {
            match command {
                AuditCommand::Append {
                    kind,
                    severity,
                    payload,
                } => self.append(kind, severity, payload).await,
                AuditCommand::Flush(done) => {
                    let _ = done.send(());
                }
                AuditCommand::Close(done) => {
                    queue.close();
                    let mut waiters = vec![done];
                    while let Ok(command) = queue.try_recv() {
                        match command {
                            AuditCommand::Append {
                                kind,
                                severity,
                                payload,
                            } => self.append(kind, severity, payload).await,
                            AuditCommand::Flush(done) | AuditCommand::Close(done) => {
                                waiters.push(done)
                            }
                        }
                    }

                    // Release the sink (and any file lock) before acknowledging
                    drop(self);
                    for done in waiters {
                        let _ = done.send(());
                    }
                    return;
                }
            }
        }
    }

    async fn append(&mut self, kind: AuditRecordKind, severity: Severity, payload: Value) {
        let record = AuditRecord::seal(
            self.chain.next_sequence,
            kind,
            severity,
            payload,
            self.chain.last_hash.clone(),
        );

        match self.sink.append(&record).await {
            Ok(()) => {
                self.chain.next_sequence += 1;
                self.chain.last_hash = record.hash;
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %e,
                    kind = kind.as_str(),
                    sequence = record.sequence,
                    "audit sink rejected record"
                );
            }
        }
    }
}

/// Severity selection, structured logging and the hash-chained trail
///
/// Records are handed to a background writer over a bounded queue, so
/// logging does not wait for the sink unless the queue is full. Use
/// [`flush`](Self::flush) to wait until everything queued so far is stored.
pub struct SecurityAuditService {
    config: AuditConfig,
    queue: mpsc::Sender<AuditCommand>,
    sink_failures: Arc<AtomicU64>,
}

impl SecurityAuditService {
    /// Start a new trail at sequence 0
    ///
    /// Spawns the writer task, so this must run inside a Tokio runtime.
    pub fn new(config: AuditConfig, sink: Arc<dyn AuditSink>) -> Self {
        Self::spawn(
            config,
            sink,
            ChainState {
                next_sequence: 0,
                last_hash: GENESIS_HASH.to_string(),
            },
        )
    }

    /// Continue the trail already stored in `sink`
    pub async fn resume(config: AuditConfig, sink: Arc<dyn AuditSink>) -> Result<Self> {
        let chain = match sink.chain_head().await? {
            Some((sequence, hash)) => ChainState {
                next_sequence: sequence + 1,
                last_hash: hash,
            },
            None => ChainState {
                next_sequence: 0,
                last_hash: GENESIS_HASH.to_string(),
            },
        };
        Ok(Self::spawn(config, sink, chain))
    }

    fn spawn(config: AuditConfig, sink: Arc<dyn AuditSink>, chain: ChainState) -> Self {
        let (queue, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let sink_failures = Arc::new(AtomicU64::new(0));

        let writer = AuditWriter {
            sink,
            chain,
            failures: Arc::clone(&sink_failures),
        };
        tokio::spawn(writer.run(receiver));

        Self {
            config,
            queue,
            sink_failures,
        }
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Number of records that never reached the sink
    pub fn sink_failures(&self) -> u64 {
        self.sink_failures.load(Ordering::Relaxed)
    }

    /// Wait until every record queued before this call has been appended
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(AuditCommand::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Store everything queued, then stop the writer and release the sink
    ///
    /// Records logged afterwards are counted as sink failures.
    pub async fn close(&self) {
        let (done, wait) = oneshot::channel();
        if self.queue.send(AuditCommand::Close(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Log one authorization decision
    pub async fn log_authorization_event(&self, event: &AuthorizationEvent) {
        let severity = self.config.authorization_severity(event);

        audit_event!(
            severity,
            event = "authorization",
            event_id = %event.event_id,
            user_id = event.user_id.get(),
            action = %event.action,
            result = event.result.as_str(),
            resolved_role = event.resolved_role.as_str(),
            required_role = event.required_role.as_str(),
            cache_state = event.cache_state.as_str(),
            latency_ms = event.latency_ms,
            error_detail = event.error_detail.as_deref().unwrap_or(""),
            "authorization decision"
        );

        self.record(AuditRecordKind::Authorization, severity, event).await;
    }

    /// Log one finished sync cycle
    pub async fn log_sync_event(&self, event: &SyncEvent) {
        let severity = self.config.sync_severity(event);

        audit_event!(
            severity,
            event = "sync",
            event_id = %event.event_id,
            trigger = event.trigger.as_str(),
            records_fetched = event.records_fetched as u64,
            records_failed = event.records_failed as u64,
            failed_ids = ?event.failed_ids,
            pages_failed = event.pages_failed as u64,
            records_pruned = event.records_pruned as u64,
            duration_ms = event.duration_ms,
            error = event.error.as_deref().unwrap_or(""),
            "roster sync finished"
        );

        self.record(AuditRecordKind::Sync, severity, event).await;
    }

    /// Log a latency sample; stored in the trail only at warn or above
    pub async fn log_performance(&self, metric: &PerformanceMetrics) {
        let severity = self.config.performance_severity(metric);

        audit_event!(
            severity,
            event = "performance",
            operation = %metric.operation,
            duration_ms = metric.duration_ms,
            percentile_bucket = metric.percentile_bucket.as_str(),
            "latency sample"
        );

        if severity >= Severity::Warn {
            self.record(AuditRecordKind::Performance, severity, metric).await;
        }
    }

    async fn record<T: Serialize>(&self, kind: AuditRecordKind, severity: Severity, event: &T) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                self.sink_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    error = %e,
                    kind = kind.as_str(),
                    "failed to serialize audit record"
                );
                return;
            }
        };

        let command = AuditCommand::Append {
            kind,
            severity,
            payload,
        };
        let sent = match self.queue.try_send(command) {
            Ok(()) => true,
            // Writer is behind: wait for room instead of dropping the record
            Err(TrySendError::Full(command)) => self.queue.send(command).await.is_ok(),
            Err(TrySendError::Closed(_)) => false,
        };

        if !sent {
            self.sink_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(kind = kind.as_str(), "audit writer closed, record dropped");
        }
    }
}
