use graphrec_storage::{CacheEntry, CacheStore, Clock, EntityId};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::metrics::CacheMetrics;
use crate::config::CacheConfig;
use crate::errors::Result;
use crate::features::graph::GraphAdapter;
use crate::shared::CallPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(Vec<EntityId>),
    Miss,
}

/// Version-checked view over a [`CacheStore`]
pub struct RecommendationCache {
    store: Arc<dyn CacheStore>,
    graph: Arc<GraphAdapter>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    max_items: usize,
    policy: CallPolicy,
    metrics: Option<CacheMetrics>,
}

impl RecommendationCache {
    pub fn new(
        store: Arc<dyn CacheStore>,
        graph: Arc<GraphAdapter>,
        config: &CacheConfig,
        policy: CallPolicy,
    ) -> Self {
        Self {
            store,
            clock: graph.clock().clone(),
            graph,
            ttl: config.ttl(),
            max_items: config.max_items,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub fn metrics(&self) -> Option<&CacheMetrics> {
        self.metrics.as_ref()
    }

    pub fn policy(&self) -> CallPolicy {
        self.policy
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    /// Hit only when the entry's stamp equals the live entity version
    pub async fn get(&self, entity_id: &str) -> Result<CacheLookup> {
        let Some(entry) = self.peek(entity_id).await? else {
            if let Some(metrics) = &self.metrics {
                metrics.misses.inc();
            }
            return Ok(CacheLookup::Miss);
        };

        let live_version = self.graph.get_entity(entity_id).await?.map(|e| e.version);
        if live_version != Some(entry.graph_version) {
            debug!(
                entity_id,
                cached_version = entry.graph_version,
                live_version,
                "evicting stale cache entry"
            );
            self.policy
                .call("cache.invalidate", || self.store.invalidate(entity_id))
                .await?;
            if let Some(metrics) = &self.metrics {
                metrics.stale.inc();
                metrics.misses.inc();
            }
            return Ok(CacheLookup::Miss);
        }

        if let Some(metrics) = &self.metrics {
            metrics.hits.inc();
        }
        Ok(CacheLookup::Hit(entry.items))
    }

    /// The stored entry without the version check (expiry still applies)
    pub async fn peek(&self, entity_id: &str) -> Result<Option<CacheEntry>> {
        self.policy
            .call("cache.get", || self.store.get(entity_id))
            .await
    }

    /// Store a list computed against `graph_version`
    ///
    /// Returns false when a newer computation is already cached.
    pub async fn put(
        &self,
        entity_id: &str,
        mut items: Vec<EntityId>,
        graph_version: u64,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        items.truncate(self.max_items);
        let ttl = ttl.unwrap_or(self.ttl);
        let entry = CacheEntry {
            entity_id: entity_id.to_string(),
            items,
            graph_version,
            expires_at: self.clock.now() + graphrec_storage::to_chrono(ttl),
        };

        let stored = self
            .policy
            .call("cache.put", || self.store.put_if_newer(entry.clone()))
            .await?;
        if !stored {
            debug!(entity_id, graph_version, "newer cache entry kept");
        }
        Ok(stored)
    }

    pub async fn invalidate(&self, entity_id: &str) -> Result<bool> {
        let removed = self
            .policy
            .call("cache.invalidate", || self.store.invalidate(entity_id))
            .await?;
        if let (true, Some(metrics)) = (removed, &self.metrics) {
            metrics.invalidations.inc();
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::RetryPolicy;
    use graphrec_storage::{Attributes, InMemoryCacheStore, InMemoryGraphStore, ManualClock};
    use prometheus::Registry;

    struct Fixture {
        graph: Arc<GraphAdapter>,
        cache: RecommendationCache,
        clock: Arc<ManualClock>,
    }

    fn fixture(max_items: usize) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let policy = CallPolicy::new(RetryPolicy::immediate(1), Duration::from_secs(1));
        let graph = Arc::new(GraphAdapter::new(
            Arc::new(InMemoryGraphStore::new()),
            clock.clone(),
            policy,
            3,
        ));
        let config = CacheConfig {
            max_items,
            ttl_secs: 60,
            ..CacheConfig::default()
        };
        let cache = RecommendationCache::new(
            Arc::new(InMemoryCacheStore::new(clock.clone())),
            graph.clone(),
            &config,
            policy,
        )
        .with_metrics(CacheMetrics::new(&Registry::new()).unwrap());
        Fixture {
            graph,
            cache,
            clock,
        }
    }

    fn ids(items: &[&str]) -> Vec<EntityId> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_hit_when_version_matches() {
        let f = fixture(100);
        let user = f.graph.upsert_entity("user", "u1", Attributes::new()).await.unwrap();

        assert_eq!(f.cache.get("u1").await.unwrap(), CacheLookup::Miss);
        assert!(f.cache.put("u1", ids(&["i1", "i2"]), user.version, None).await.unwrap());
        assert_eq!(
            f.cache.get("u1").await.unwrap(),
            CacheLookup::Hit(ids(&["i1", "i2"]))
        );

        let metrics = f.cache.metrics().unwrap();
        assert_eq!(metrics.hits.get(), 1);
        assert_eq!(metrics.misses.get(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_is_miss_and_evicted() {
        let f = fixture(100);
        let user = f.graph.upsert_entity("user", "u1", Attributes::new()).await.unwrap();
        f.cache.put("u1", ids(&["i1"]), user.version, None).await.unwrap();

        f.graph.upsert_relationship("u1", "i9", "viewed", 1.0).await.unwrap();

        assert_eq!(f.cache.get("u1").await.unwrap(), CacheLookup::Miss);
        assert!(f.cache.peek("u1").await.unwrap().is_none());
        assert_eq!(f.cache.metrics().unwrap().stale.get(), 1);
    }

    #[tokio::test]
    async fn test_older_computation_never_overwrites_newer() {
        let f = fixture(100);
        assert!(f.cache.put("u1", ids(&["new"]), 5, None).await.unwrap());
        assert!(!f.cache.put("u1", ids(&["old"]), 4, None).await.unwrap());
        assert_eq!(f.cache.peek("u1").await.unwrap().unwrap().items, ids(&["new"]));
    }

    #[tokio::test]
    async fn test_put_truncates_and_expires() {
        let f = fixture(2);
        let user = f.graph.upsert_entity("user", "u1", Attributes::new()).await.unwrap();
        f.cache
            .put("u1", ids(&["a", "b", "c"]), user.version, None)
            .await
            .unwrap();
        assert_eq!(f.cache.get("u1").await.unwrap(), CacheLookup::Hit(ids(&["a", "b"])));

        f.clock.advance(Duration::from_secs(61));
        assert_eq!(f.cache.get("u1").await.unwrap(), CacheLookup::Miss);
    }

    #[tokio::test]
    async fn test_invalidate_counts_only_removals() {
        let f = fixture(100);
        f.cache.put("u1", ids(&["a"]), 1, None).await.unwrap();
        assert!(f.cache.invalidate("u1").await.unwrap());
        assert!(!f.cache.invalidate("u1").await.unwrap());
        assert_eq!(f.cache.metrics().unwrap().invalidations.get(), 1);
    }
}
