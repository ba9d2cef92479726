//! Node configuration loading and validation

use anyhow::{Context, Result};
use roster_authz::{ActionPolicy, AuditConfig, CacheConfig, ResolverConfig, Role, SyncConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete node configuration
///
/// Every section has defaults, so a file only needs `[roster] path`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,

    #[serde(default)]
    pub roster: RosterSection,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub resolver: ResolverSection,

    #[serde(default)]
    pub sync: SyncSection,

    #[serde(default)]
    pub audit: AuditSection,

    #[serde(default)]
    pub metrics: MetricsSection,

    /// Action name -> required role, merged over the built-in table
    #[serde(default)]
    pub actions: HashMap<String, Role>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSection {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RosterSection {
    /// JSON roster export
    #[serde(default = "default_roster_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_shards")]
    pub shards: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResolverSection {
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_ms: u64,
    /// Required role for actions missing from `[actions]`
    #[serde(default = "default_fallback_role")]
    pub fallback_role: Role,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SyncSection {
    #[serde(default = "default_sync_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_page_timeout")]
    pub page_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuditSection {
    /// JSON Lines trail; kept in memory when unset
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub thresholds: AuditThresholds,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditThresholds {
    #[serde(default = "default_hit_sla")]
    pub hit_sla_ms: u64,
    #[serde(default = "default_miss_sla")]
    pub miss_sla_ms: u64,
    #[serde(default = "default_sync_sla")]
    pub sync_sla_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsSection {
    /// How often cache and latency stats are logged; 0 disables
    #[serde(default = "default_report_interval")]
    pub report_interval_secs: u64,
}

// Default value functions
fn default_true() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_roster_path() -> PathBuf { PathBuf::from("roster.json") }
fn default_cache_capacity() -> usize { 10_000 }
fn default_cache_ttl() -> u64 { 60 }
fn default_cache_shards() -> usize { 16 }
fn default_lookup_timeout() -> u64 { 250 }
fn default_fallback_role() -> Role { Role::Admin }
fn default_sync_interval() -> u64 { 60 }
fn default_page_size() -> usize { 500 }
fn default_page_timeout() -> u64 { 5_000 }
fn default_hit_sla() -> u64 { 100 }
fn default_miss_sla() -> u64 { 300 }
fn default_sync_sla() -> u64 { 30_000 }
fn default_report_interval() -> u64 { 60 }

impl Default for NodeSection {
    fn default() -> Self {
        Self { log_level: default_log_level(), json_logs: false }
    }
}

impl Default for RosterSection {
    fn default() -> Self {
        Self { path: default_roster_path() }
    }
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
            shards: default_cache_shards(),
        }
    }
}

impl Default for ResolverSection {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout(),
            fallback_role: default_fallback_role(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval(),
            page_size: default_page_size(),
            page_timeout_ms: default_page_timeout(),
            run_on_start: true,
        }
    }
}

impl Default for AuditThresholds {
    fn default() -> Self {
        Self {
            hit_sla_ms: default_hit_sla(),
            miss_sla_ms: default_miss_sla(),
            sync_sla_ms: default_sync_sla(),
        }
    }
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { report_interval_secs: default_report_interval() }
    }
}

impl NodeConfig {
    /// Load configuration from TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read configuration file {:?}", path.as_ref()))?;

        Self::from_toml(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse configuration file")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.cache_config()
            .validate()
            .context("Invalid [cache] section")?;
        self.resolver_config()
            .validate()
            .context("Invalid [resolver] section")?;
        self.sync_config()
            .validate()
            .context("Invalid [sync] section")?;

        if self.audit.thresholds.hit_sla_ms > self.audit.thresholds.miss_sla_ms {
            anyhow::bail!("audit hit_sla_ms must not exceed miss_sla_ms");
        }

        Ok(())
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache.capacity,
            ttl: Duration::from_secs(self.cache.ttl_secs),
            shards: self.cache.shards,
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            lookup_timeout: Duration::from_millis(self.resolver.lookup_timeout_ms),
            policy: self.action_policy(),
            ..Default::default()
        }
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: Duration::from_secs(self.sync.interval_secs),
            page_size: self.sync.page_size,
            page_timeout: Duration::from_millis(self.sync.page_timeout_ms),
            run_on_start: self.sync.run_on_start,
        }
    }

    pub fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            hit_sla: Duration::from_millis(self.audit.thresholds.hit_sla_ms),
            miss_sla: Duration::from_millis(self.audit.thresholds.miss_sla_ms),
            sync_sla: Duration::from_millis(self.audit.thresholds.sync_sla_ms),
            ..AuditConfig::default()
        }
    }

    /// Built-in action table with `[actions]` entries applied on top
    pub fn action_policy(&self) -> ActionPolicy {
        let mut policy = ActionPolicy::default();
        policy.fallback = self.resolver.fallback_role;
        for (action, role) in &self.actions {
            policy.required.insert(action.clone(), *role);
        }
        policy
    }
}
