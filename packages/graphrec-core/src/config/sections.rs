//! Configuration sections
//!
//! Durations are plain integers with the unit in the field name
//! (`ttl_secs`, `call_timeout_ms`) and typed accessors on each section.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::error::{check_range, ConfigResult};
use super::validation::Validatable;

// ═══════════════════════════════════════════════════════════════════════════
// Store
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

/// Retry schedule for transient store failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 50,
            max_backoff_ms: 2_000,
        }
    }
}

impl Validatable for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range("retry.max_attempts", self.max_attempts, 1, 100, "At least one attempt")?;
        check_range(
            "retry.max_backoff_ms",
            self.max_backoff_ms,
            self.base_backoff_ms,
            600_000,
            "Backoff cap must be >= base backoff",
        )
    }

    fn config_name(&self) -> &'static str {
        "retry"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Database file for the SQLite backend
    pub sqlite_path: Option<String>,
    /// Deadline for every store call
    pub call_timeout_ms: u64,
    pub retry: RetryConfig,
    /// Re-read-and-retry bound for optimistic graph writes
    pub max_conflict_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            sqlite_path: None,
            call_timeout_ms: 2_000,
            retry: RetryConfig::default(),
            max_conflict_retries: 8,
        }
    }
}

impl StoreConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Validatable for StoreConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "store.call_timeout_ms",
            self.call_timeout_ms,
            1,
            300_000,
            "Every store call needs a finite deadline",
        )?;
        check_range(
            "store.max_conflict_retries",
            self.max_conflict_retries,
            1,
            1_000,
            "Conflicting writers need at least one retry",
        )?;
        if self.backend == StoreBackend::Sqlite && self.sqlite_path.is_none() {
            return Err(super::ConfigError::Validation(
                "store.sqlite_path is required for the sqlite backend".to_string(),
            ));
        }
        self.retry.validate()
    }

    fn config_name(&self) -> &'static str {
        "store"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lease / ledger / stream
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LeaseConfig {
    pub ttl_secs: u64,
    /// Renew when less than (expected chunk time + margin) remains
    pub renew_margin_secs: u64,
    /// Defaults to `<hostname-ish>-<uuid>` when unset
    pub holder_id: Option<String>,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            renew_margin_secs: 30,
            holder_id: None,
        }
    }
}

impl LeaseConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn renew_margin(&self) -> Duration {
        Duration::from_secs(self.renew_margin_secs)
    }
}

impl Validatable for LeaseConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range("lease.ttl_secs", self.ttl_secs, 1, 86_400, "Lease TTL must be positive")?;
        check_range(
            "lease.renew_margin_secs",
            self.renew_margin_secs,
            0,
            self.ttl_secs.saturating_sub(1),
            "Renew margin must be shorter than the lease TTL",
        )
    }

    fn config_name(&self) -> &'static str {
        "lease"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    /// How long a processed event id is remembered
    pub retention_secs: u64,
    pub purge_interval_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            retention_secs: 7 * 86_400,
            purge_interval_secs: 3_600,
        }
    }
}

impl LedgerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

impl Validatable for LedgerConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "ledger.retention_secs",
            self.retention_secs,
            1,
            365 * 86_400,
            "Retention must be positive",
        )?;
        check_range(
            "ledger.purge_interval_secs",
            self.purge_interval_secs,
            1,
            86_400,
            "Purge at least daily",
        )
    }

    fn config_name(&self) -> &'static str {
        "ledger"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    pub batch_size: usize,
    /// Longest delay after which the stream may still redeliver an event
    pub max_redelivery_delay_secs: u64,
    pub poll_interval_ms: u64,
    pub max_concurrent_partitions: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_redelivery_delay_secs: 86_400,
            poll_interval_ms: 500,
            max_concurrent_partitions: num_cpus::get().max(1),
        }
    }
}

impl StreamConfig {
    pub fn max_redelivery_delay(&self) -> Duration {
        Duration::from_secs(self.max_redelivery_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Validatable for StreamConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range("stream.batch_size", self.batch_size, 1, 10_000, "Batches must hold events")?;
        check_range(
            "stream.poll_interval_ms",
            self.poll_interval_ms,
            1,
            60_000,
            "Poll at least once a minute",
        )?;
        check_range(
            "stream.max_concurrent_partitions",
            self.max_concurrent_partitions,
            1,
            1_024,
            "At least one partition worker",
        )
    }

    fn config_name(&self) -> &'static str {
        "stream"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Search / cache / recommend
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchBackend {
    Memory,
    Tantivy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    pub backend: SearchBackend,
    /// Tantivy directory; RAM index when unset
    pub index_dir: Option<String>,
    /// Write attempts before an entity is recorded as desynced
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Neighbors denormalized into each document
    pub top_neighbors: usize,
    pub writer_heap_bytes: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            backend: SearchBackend::Memory,
            index_dir: None,
            max_retries: 5,
            base_backoff_ms: 100,
            max_backoff_ms: 10_000,
            top_neighbors: 10,
            writer_heap_bytes: 50_000_000,
        }
    }
}

impl SearchConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl Validatable for SearchConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range("search.max_retries", self.max_retries, 0, 100, "Retry bound")?;
        check_range(
            "search.max_backoff_ms",
            self.max_backoff_ms,
            self.base_backoff_ms,
            3_600_000,
            "Backoff cap must be >= base backoff",
        )?;
        check_range("search.top_neighbors", self.top_neighbors, 0, 1_000, "Neighbor fan-out")?;
        check_range(
            "search.writer_heap_bytes",
            self.writer_heap_bytes,
            15_000_000,
            4_000_000_000,
            "Tantivy needs at least 15MB of writer heap",
        )
    }

    fn config_name(&self) -> &'static str {
        "search"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    Memory,
    Moka,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    pub ttl_secs: u64,
    /// Longest cached recommendation list
    pub max_items: usize,
    /// Entity types invalidated synchronously on change
    pub high_value_types: Vec<String>,
    /// Entry capacity of the moka backend
    pub max_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            ttl_secs: 24 * 3_600,
            max_items: 100,
            high_value_types: Vec::new(),
            max_capacity: 100_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Validatable for CacheConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range("cache.ttl_secs", self.ttl_secs, 1, 30 * 86_400, "TTL must be positive")?;
        check_range("cache.max_items", self.max_items, 1, 10_000, "Keep at least one item")?;
        check_range(
            "cache.max_capacity",
            self.max_capacity,
            1,
            u64::MAX,
            "Capacity must be positive",
        )
    }

    fn config_name(&self) -> &'static str {
        "cache"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecommendConfig {
    pub default_limit: usize,
    /// Relationships followed per hop
    pub fanout_limit: usize,
    /// Relationship types followed; all types when empty
    pub rel_types: Vec<String>,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            default_limit: 20,
            fanout_limit: 200,
            rel_types: Vec::new(),
        }
    }
}

impl Validatable for RecommendConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range("recommend.default_limit", self.default_limit, 1, 10_000, "Limit")?;
        check_range(
            "recommend.fanout_limit",
            self.fanout_limit,
            1,
            100_000,
            "Fan-out bounds the traversal",
        )
    }

    fn config_name(&self) -> &'static str {
        "recommend"
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Orchestrator
// ═══════════════════════════════════════════════════════════════════════════

/// One scheduled batch job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobScheduleConfig {
    pub name: String,
    /// `every 10m`, `@hourly`, ...
    pub trigger: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    pub chunk_size: usize,
    /// Seed for the observed chunk duration estimate
    pub expected_chunk_duration_ms: u64,
    pub jobs: Vec<JobScheduleConfig>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            expected_chunk_duration_ms: 5_000,
            jobs: vec![
                JobScheduleConfig {
                    name: "recompute-recommendations".to_string(),
                    trigger: "@hourly".to_string(),
                    enabled: true,
                },
                JobScheduleConfig {
                    name: "reconcile-index".to_string(),
                    trigger: "every 30m".to_string(),
                    enabled: true,
                },
                JobScheduleConfig {
                    name: "warm-cache".to_string(),
                    trigger: "every 10m".to_string(),
                    enabled: true,
                },
            ],
        }
    }
}

impl OrchestratorConfig {
    pub fn expected_chunk_duration(&self) -> Duration {
        Duration::from_millis(self.expected_chunk_duration_ms)
    }

    pub fn job(&self, name: &str) -> Option<&JobScheduleConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }
}

impl Validatable for OrchestratorConfig {
    fn validate(&self) -> ConfigResult<()> {
        check_range(
            "orchestrator.chunk_size",
            self.chunk_size,
            1,
            100_000,
            "Chunks must hold entities",
        )?;
        check_range(
            "orchestrator.expected_chunk_duration_ms",
            self.expected_chunk_duration_ms,
            1,
            3_600_000,
            "Expected chunk duration must be positive",
        )?;
        for job in &self.jobs {
            super::Trigger::parse(&job.trigger)?;
        }
        Ok(())
    }

    fn config_name(&self) -> &'static str {
        "orchestrator"
    }
}
