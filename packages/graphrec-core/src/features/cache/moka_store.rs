//! moka-backed cache store
//!
//! moka enforces capacity and a global TTL; the per-entry `expires_at` is
//! checked against the injected clock on every read.

use async_trait::async_trait;
use graphrec_storage::{CacheEntry, CacheStore, Clock, EntityId};
use moka::future::Cache;
use moka::ops::compute::{CompResult, Op};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CacheConfig;

pub struct MokaCacheStore {
    cache: Cache<EntityId, CacheEntry>,
    clock: Arc<dyn Clock>,
}

impl MokaCacheStore {
    pub fn new(max_capacity: u64, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .eviction_listener(|key, _value, cause| {
                tracing::debug!(entity_id = %key, ?cause, "cache entry evicted");
            })
            .build();
        Self { cache, clock }
    }

    pub fn from_config(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(config.max_capacity, config.ttl(), clock)
    }

    /// Pending maintenance tasks (evictions) are applied first
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

#[async_trait]
impl CacheStore for MokaCacheStore {
    async fn get(&self, entity_id: &str) -> graphrec_storage::Result<Option<CacheEntry>> {
        let Some(entry) = self.cache.get(entity_id).await else {
            return Ok(None);
        };
        if entry.is_expired(self.clock.now()) {
            self.cache.invalidate(entity_id).await;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn put_if_newer(&self, entry: CacheEntry) -> graphrec_storage::Result<bool> {
        let now = self.clock.now();
        let result = self
            .cache
            .entry(entry.entity_id.clone())
            .and_compute_with(|current| {
                let op = match current {
                    Some(existing)
                        if !existing.value().is_expired(now)
                            && existing.value().graph_version > entry.graph_version =>
                    {
                        Op::Nop
                    }
                    _ => Op::Put(entry),
                };
                std::future::ready(op)
            })
            .await;

        Ok(matches!(
            result,
            CompResult::Inserted(_) | CompResult::ReplacedWith(_)
        ))
    }

    async fn invalidate(&self, entity_id: &str) -> graphrec_storage::Result<bool> {
        Ok(self.cache.remove(entity_id).await.is_some())
    }
}
