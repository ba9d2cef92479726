//! Immutable audit event types
//!
//! One [`AuthorizationEvent`] is produced per resolution, one [`SyncEvent`]
//! per roster sync cycle. [`PerformanceMetrics`] samples are ephemeral and only
//! drive severity selection in the audit service.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::AuthzError;
use crate::types::{Action, Role, UserId};

/// Longest error detail carried into the audit trail
const MAX_ERROR_DETAIL_LEN: usize = 256;

/// Outcome of an authorization check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Role satisfies the action's requirement
    Granted,
    /// Role is insufficient, or the user id is malformed
    Denied,
    /// Role could not be determined (lookup failed or timed out)
    Error,
}

impl Decision {
    /// Only `Granted` lets a protected operation run
    pub fn is_granted(self) -> bool {
        matches!(self, Decision::Granted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Decision::Granted => "granted",
            Decision::Denied => "denied",
            Decision::Error => "error",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    /// Fresh entry found
    Hit,
    /// No entry
    Miss,
    /// Entry found but older than its TTL; it was removed
    Expired,
}

impl CacheState {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheState::Hit => "hit",
            CacheState::Miss => "miss",
            CacheState::Expired => "expired",
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What started a sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncTrigger {
    /// Periodic timer
    Scheduled,
    /// Operator request
    Manual,
}

impl SyncTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncTrigger::Scheduled => "scheduled",
            SyncTrigger::Manual => "manual",
        }
    }
}

/// Record of a single authorization decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorizationEvent {
    /// Unique event ID
    pub event_id: Uuid,

    /// User who attempted the action
    pub user_id: UserId,

    /// Action name
    pub action: String,

    /// Decision returned to the caller
    pub result: Decision,

    /// Role the decision was based on
    pub resolved_role: Role,

    /// Role the action required
    pub required_role: Role,

    /// Cache lookup outcome
    pub cache_state: CacheState,

    /// End-to-end resolution latency in milliseconds
    pub latency_ms: f64,

    /// When the decision was made
    pub timestamp: DateTime<Utc>,

    /// Operator-facing failure detail (never shown to end users)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
}

impl AuthorizationEvent {
    /// Build an event stamped with the current time
    pub fn new(
        user_id: UserId,
        action: &Action,
        result: Decision,
        resolved_role: Role,
        required_role: Role,
        cache_state: CacheState,
        latency: Duration,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            user_id,
            action: action.name.clone(),
            result,
            resolved_role,
            required_role,
            cache_state,
            latency_ms: duration_ms(latency),
            timestamp: Utc::now(),
            error_detail: None,
        }
    }

    /// Attach failure detail, truncated to a bounded length
    pub fn with_error(mut self, error: &AuthzError) -> Self {
        self.error_detail = Some(truncate_detail(&error.to_string()));
        self
    }

    /// Latency as a `Duration`
    pub fn latency(&self) -> Duration {
        Duration::from_secs_f64(self.latency_ms.max(0.0) / 1000.0)
    }
}

/// Summary of one roster sync cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Unique event ID
    pub event_id: Uuid,

    /// Cycle start
    pub started_at: DateTime<Utc>,

    /// Cycle duration in milliseconds
    pub duration_ms: f64,

    /// Records applied to the cache
    pub records_fetched: usize,

    /// Records rejected (malformed, missing fields)
    pub records_failed: usize,

    /// Ids of rejected records whose id was readable
    pub failed_ids: Vec<i64>,

    /// Pages that could not be fetched (timeout or source error)
    #[serde(default)]
    pub pages_failed: usize,

    /// Cached users absent from a clean roster pass, invalidated
    #[serde(default)]
    pub records_pruned: usize,

    /// What started the cycle
    pub trigger: SyncTrigger,

    /// Set when the whole cycle failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Overall status of a finished sync cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Every record and page applied
    Succeeded,
    /// Cycle completed but some records or pages failed
    Partial,
    /// Nothing applied; cache left untouched
    Failed,
}

impl SyncEvent {
    /// Start a new event for a cycle beginning now
    pub fn begin(trigger: SyncTrigger) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_ms: 0.0,
            records_fetched: 0,
            records_failed: 0,
            failed_ids: Vec::new(),
            pages_failed: 0,
            records_pruned: 0,
            trigger,
            error: None,
        }
    }

    /// Cycle status derived from the counters
    pub fn status(&self) -> SyncStatus {
        if self.error.is_some() {
            SyncStatus::Failed
        } else if self.records_failed > 0 || self.pages_failed > 0 {
            SyncStatus::Partial
        } else {
            SyncStatus::Succeeded
        }
    }

    /// Error view of a failed or partial cycle, for callers that want `?`
    pub fn to_error(&self) -> Option<AuthzError> {
        match self.status() {
            SyncStatus::Succeeded => None,
            SyncStatus::Partial => Some(AuthzError::PartialSyncFailure {
                failed: self.records_failed,
                failed_ids: self.failed_ids.clone(),
            }),
            SyncStatus::Failed => Some(AuthzError::TotalSyncFailure(
                self.error.clone().unwrap_or_default(),
            )),
        }
    }

    /// Cycle duration as a `Duration`
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.duration_ms.max(0.0) / 1000.0)
    }
}

/// Where a latency sample falls within the recent distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PercentileBucket {
    /// At or below the median
    P50,
    /// Between p50 and p95
    P95,
    /// Between p95 and p99
    P99,
    /// Slower than p99
    Tail,
}

impl PercentileBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            PercentileBucket::P50 => "p50",
            PercentileBucket::P95 => "p95",
            PercentileBucket::P99 => "p99",
            PercentileBucket::Tail => "tail",
        }
    }
}

/// Ephemeral latency sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Operation name (e.g. `resolve.hit`, `resolve.miss`, `sync`)
    pub operation: String,

    /// Measured duration in milliseconds
    pub duration_ms: f64,

    /// Position in the recent latency distribution
    pub percentile_bucket: PercentileBucket,
}

impl PerformanceMetrics {
    pub fn new(operation: impl Into<String>, duration: Duration, bucket: PercentileBucket) -> Self {
        Self {
            operation: operation.into(),
            duration_ms: duration_ms(duration),
            percentile_bucket: bucket,
        }
    }
}

pub(crate) fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

fn truncate_detail(detail: &str) -> String {
    if detail.len() <= MAX_ERROR_DETAIL_LEN {
        return detail.to_string();
    }
    let mut end = MAX_ERROR_DETAIL_LEN;
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &detail[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_event_creation() {
        let event = AuthorizationEvent::new(
            UserId::new(42),
            &Action::new("export"),
            Decision::Granted,
            Role::Admin,
            Role::Coordinator,
            CacheState::Hit,
            Duration::from_micros(1500),
        );

        assert_eq!(event.action, "export");
        assert!((event.latency_ms - 1.5).abs() < 1e-9);
        assert!(event.error_detail.is_none());
        assert!(event.latency() > Duration::from_millis(1));
    }

    #[test]
    fn test_error_detail_is_truncated() {
        let long = "x".repeat(1000);
        let event = AuthorizationEvent::new(
            UserId::new(1),
            &Action::new("view"),
            Decision::Error,
            Role::None,
            Role::Viewer,
            CacheState::Miss,
            Duration::ZERO,
        )
        .with_error(&AuthzError::LookupFailure(long));

        let detail = event.error_detail.unwrap();
        assert!(detail.len() <= MAX_ERROR_DETAIL_LEN + 3);
        assert!(detail.ends_with("..."));
    }

    #[test]
    fn test_sync_status() {
        let mut event = SyncEvent::begin(SyncTrigger::Scheduled);
        assert_eq!(event.status(), SyncStatus::Succeeded);
        assert!(event.to_error().is_none());

        event.records_failed = 2;
        event.failed_ids = vec![3, 5];
        assert_eq!(event.status(), SyncStatus::Partial);
        assert!(matches!(
            event.to_error(),
            Some(AuthzError::PartialSyncFailure { failed: 2, .. })
        ));

        event.error = Some("store unreachable".into());
        assert_eq!(event.status(), SyncStatus::Failed);
    }

    #[test]
    fn test_event_json_shape() {
        let event = AuthorizationEvent::new(
            UserId::new(7),
            &Action::new("search"),
            Decision::Denied,
            Role::None,
            Role::Viewer,
            CacheState::Miss,
            Duration::from_millis(3),
        );
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["user_id"], 7);
        assert_eq!(value["result"], "denied");
        assert_eq!(value["cache_state"], "miss");
        assert_eq!(value["resolved_role"], "none");
        assert!(value.get("error_detail").is_none());
    }
}
