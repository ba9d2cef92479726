//! External role sources
//!
//! The roster (a spreadsheet export, a database, ...) is the source of truth for
//! roles. The resolver asks it for single users on cache misses; the sync
//! scheduler pages through all of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::error::{AuthzError, Result};
use crate::types::{Role, RoleAssignment, UserId};

/// One roster row as stored, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRoleRecord {
    /// User id, absent or unreadable in malformed rows
    #[serde(default)]
    pub user_id: Option<i64>,

    /// Role name, absent in malformed rows
    #[serde(default)]
    pub role: Option<String>,
}

impl RawRoleRecord {
    /// Well-formed row
    pub fn new(user_id: i64, role: Role) -> Self {
        Self {
            user_id: Some(user_id),
            role: Some(role.as_str().to_string()),
        }
    }

    /// Read a row leniently from JSON; wrong types become missing fields
    pub fn from_value(value: &Value) -> Self {
        Self {
            user_id: value.get("user_id").and_then(Value::as_i64),
            role: value
                .get("role")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    /// Validate into an assignment
    pub fn parse(&self) -> Result<RoleAssignment> {
        let id = self
            .user_id
            .ok_or_else(|| AuthzError::MalformedRecord("missing user_id".to_string()))?;
        let user_id = UserId::parse(id)?;
        // An empty cell is a missing role, not `none`
        let role = self
            .role
            .as_deref()
            .filter(|role| !role.trim().is_empty())
            .ok_or_else(|| AuthzError::MalformedRecord(format!("missing role for user {}", id)))?
            .parse::<Role>()?;
        Ok(RoleAssignment::new(user_id, role))
    }
}

/// A slice of the roster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterPage {
    /// Rows in roster order
    pub records: Vec<RawRoleRecord>,

    /// Total number of rows, when the source knows it
    pub total: Option<usize>,
}

/// Source of truth for role assignments
#[async_trait]
pub trait RoleSource: Send + Sync {
    /// Role of a single user; `Ok(None)` when the user is not on the roster
    async fn fetch_role(&self, user_id: UserId) -> Result<Option<RoleAssignment>>;

    /// Up to `limit` raw rows starting at `offset`
    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<RosterPage>;
}

fn find_assignment(records: &[RawRoleRecord], user_id: UserId) -> Result<Option<RoleAssignment>> {
    // Later rows win, as in a spreadsheet edited by appending.
    match records
        .iter()
        .rev()
        .find(|record| record.user_id == Some(user_id.get()))
    {
        Some(record) => record
            .parse()
            .map(Some)
            .map_err(|e| AuthzError::LookupFailure(e.to_string())),
        None => Ok(None),
    }
}

fn slice_page(records: &[RawRoleRecord], offset: usize, limit: usize) -> RosterPage {
    let start = offset.min(records.len());
    let end = offset.saturating_add(limit).min(records.len());
    RosterPage {
        records: records[start..end].to_vec(),
        total: Some(records.len()),
    }
}

/// In-memory roster with latency and failure injection
#[derive(Clone, Default)]
pub struct InMemoryRoleSource {
    records: Arc<RwLock<Vec<RawRoleRecord>>>,
    latency: Arc<parking_lot::RwLock<Duration>>,
    user_latency: Arc<parking_lot::RwLock<HashMap<UserId, Duration>>>,
    failing_pages: Arc<parking_lot::RwLock<HashSet<usize>>>,
    fail_all: Arc<AtomicBool>,
    lookups: Arc<AtomicUsize>,
    page_fetches: Arc<AtomicUsize>,
}

impl InMemoryRoleSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source holding the given assignments
    pub fn with_assignments(assignments: impl IntoIterator<Item = RoleAssignment>) -> Self {
        let records = assignments
            .into_iter()
            .map(|a| RawRoleRecord::new(a.user_id.get(), a.role))
            .collect();
        Self::with_records(records)
    }

    /// Create a source holding raw rows, malformed ones included
    pub fn with_records(records: Vec<RawRoleRecord>) -> Self {
        Self {
            records: Arc::new(RwLock::new(records)),
            ..Self::default()
        }
    }

    /// Set or replace a user's role
    pub async fn upsert(&self, user_id: impl Into<UserId>, role: Role) {
        let user_id = user_id.into();
        let mut records = self.records.write().await;
        records.retain(|record| record.user_id != Some(user_id.get()));
        records.push(RawRoleRecord::new(user_id.get(), role));
    }

    /// Remove a user from the roster
    pub async fn remove(&self, user_id: impl Into<UserId>) -> bool {
        let user_id = user_id.into();
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|record| record.user_id != Some(user_id.get()));
        records.len() != before
    }

    /// Append a raw row
    pub async fn push_raw(&self, record: RawRoleRecord) {
        self.records.write().await.push(record);
    }

    /// Delay applied to every call
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    /// Delay applied to lookups of one user, overriding the global delay
    pub fn set_user_latency(&self, user_id: impl Into<UserId>, latency: Duration) {
        self.user_latency.write().insert(user_id.into(), latency);
    }

    /// Make every call fail
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Make the page starting at `offset` fail
    pub fn fail_page_at(&self, offset: usize) {
        self.failing_pages.write().insert(offset);
    }

    /// Number of `fetch_role` calls so far
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    /// Number of `fetch_page` calls so far
    pub fn page_fetches(&self) -> usize {
        self.page_fetches.load(Ordering::SeqCst)
    }

    async fn delay(&self, user_id: Option<UserId>) {
        let latency = user_id
            .and_then(|id| self.user_latency.read().get(&id).copied())
            .unwrap_or_else(|| *self.latency.read());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl RoleSource for InMemoryRoleSource {
    async fn fetch_role(&self, user_id: UserId) -> Result<Option<RoleAssignment>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.delay(Some(user_id)).await;

        if self.fail_all.load(Ordering::SeqCst) {
            return Err(AuthzError::LookupFailure("roster unavailable".to_string()));
        }

        let records = self.records.read().await;
        find_assignment(&records, user_id)
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<RosterPage> {
        self.page_fetches.fetch_add(1, Ordering::SeqCst);
        self.delay(None).await;

        if self.fail_all.load(Ordering::SeqCst) || self.failing_pages.read().contains(&offset) {
            return Err(AuthzError::LookupFailure(format!(
                "roster page at offset {} unavailable",
                offset
            )));
        }

        let records = self.records.read().await;
        Ok(slice_page(&records, offset, limit))
    }
}

/// Roster exported as a JSON array of `{"user_id": .., "role": ..}` rows
///
/// The file is re-read on every call so edits show up on the next sync.
#[derive(Debug, Clone)]
pub struct JsonRosterSource {
    path: PathBuf,
}

impl JsonRosterSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<Vec<RawRoleRecord>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        let rows: Vec<Value> = serde_json::from_str(&content)?;
        Ok(rows.iter().map(RawRoleRecord::from_value).collect())
    }
}

#[async_trait]
impl RoleSource for JsonRosterSource {
    async fn fetch_role(&self, user_id: UserId) -> Result<Option<RoleAssignment>> {
        let records = self
            .load()
            .await
            .map_err(|e| AuthzError::LookupFailure(e.to_string()))?;
        find_assignment(&records, user_id)
    }

    async fn fetch_page(&self, offset: usize, limit: usize) -> Result<RosterPage> {
        let records = self
            .load()
            .await
            .map_err(|e| AuthzError::LookupFailure(e.to_string()))?;
        Ok(slice_page(&records, offset, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_raw_record_parse() {
        let record = RawRoleRecord::new(42, Role::Admin);
        assert_eq!(record.parse().unwrap(), RoleAssignment::new(42, Role::Admin));

        let missing_id = RawRoleRecord {
            user_id: None,
            role: Some("viewer".into()),
        };
        assert!(matches!(missing_id.parse(), Err(AuthzError::MalformedRecord(_))));

        let bad_role = RawRoleRecord {
            user_id: Some(7),
            role: Some("overlord".into()),
        };
        assert!(matches!(bad_role.parse(), Err(AuthzError::InvalidRole(_))));

        let bad_id = RawRoleRecord::new(-3, Role::Viewer);
        assert!(matches!(bad_id.parse(), Err(AuthzError::InvalidUserId(-3))));

        let empty_role = RawRoleRecord {
            user_id: Some(5),
            role: Some(" ".into()),
        };
        assert!(matches!(empty_role.parse(), Err(AuthzError::MalformedRecord(_))));

        let explicit_none = RawRoleRecord::new(6, Role::None);
        assert_eq!(explicit_none.parse().unwrap().role, Role::None);
    }

    #[test]
    fn test_raw_record_from_value_is_lenient() {
        let value = serde_json::json!({"user_id": "abc", "role": "admin"});
        let record = RawRoleRecord::from_value(&value);
        assert_eq!(record.user_id, None);
        assert_eq!(record.role.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn test_in_memory_fetch_role() {
        let source = InMemoryRoleSource::with_assignments([
            RoleAssignment::new(1, Role::Viewer),
            RoleAssignment::new(2, Role::Admin),
        ]);

        let found = source.fetch_role(UserId::new(2)).await.unwrap();
        assert_eq!(found.map(|a| a.role), Some(Role::Admin));
        assert!(source.fetch_role(UserId::new(3)).await.unwrap().is_none());
        assert_eq!(source.lookups(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_upsert_and_remove() {
        let source = InMemoryRoleSource::new();
        source.upsert(5, Role::Viewer).await;
        source.upsert(5, Role::Coordinator).await;

        let found = source.fetch_role(UserId::new(5)).await.unwrap();
        assert_eq!(found.map(|a| a.role), Some(Role::Coordinator));

        assert!(source.remove(5).await);
        assert!(source.fetch_role(UserId::new(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_memory_paging() {
        let source = InMemoryRoleSource::with_assignments(
            (1..=25).map(|id| RoleAssignment::new(id, Role::Viewer)),
        );

        let page = source.fetch_page(20, 10).await.unwrap();
        assert_eq!(page.records.len(), 5);
        assert_eq!(page.total, Some(25));

        let past_end = source.fetch_page(100, 10).await.unwrap();
        assert!(past_end.records.is_empty());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let source = InMemoryRoleSource::with_assignments([RoleAssignment::new(1, Role::Admin)]);

        source.fail_page_at(10);
        assert!(source.fetch_page(0, 10).await.is_ok());
        assert!(source.fetch_page(10, 10).await.is_err());

        source.set_failing(true);
        assert!(matches!(
            source.fetch_role(UserId::new(1)).await,
            Err(AuthzError::LookupFailure(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_latency() {
        let source = InMemoryRoleSource::with_assignments([RoleAssignment::new(9, Role::Admin)]);
        source.set_user_latency(9, Duration::from_secs(2));

        let start = tokio::time::Instant::now();
        source.fetch_role(UserId::new(9)).await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_json_roster_source() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[
                {"user_id": 1, "role": "admin"},
                {"user_id": 2},
                {"user_id": 3, "role": "viewer"}
            ]"#,
        )
        .unwrap();

        let source = JsonRosterSource::new(file.path());
        let found = source.fetch_role(UserId::new(3)).await.unwrap();
        assert_eq!(found.map(|a| a.role), Some(Role::Viewer));

        // Row for user 2 has no role.
        assert!(source.fetch_role(UserId::new(2)).await.is_err());

        let page = source.fetch_page(0, 10).await.unwrap();
        assert_eq!(page.records.len(), 3);
        assert!(page.records[1].parse().is_err());
    }

    #[tokio::test]
    async fn test_json_roster_source_missing_file() {
        let source = JsonRosterSource::new("/nonexistent/roster.json");
        assert!(matches!(
            source.fetch_page(0, 10).await,
            Err(AuthzError::LookupFailure(_))
        ));
    }
}
