//! Eager invalidation of high-value entity types

use async_trait::async_trait;
use graphrec_storage::{CacheStore, ChangeNotification};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use super::metrics::CacheMetrics;
use super::recommendation_cache::RecommendationCache;
use crate::errors::Result;
use crate::features::graph::ChangeListener;
use crate::shared::CallPolicy;

/// Drops the cached list of a changed entity whose type is high-value
///
/// Holds the cache store, not the [`RecommendationCache`], so registering it
/// on the graph's notifier does not create a reference cycle.
pub struct CacheInvalidationListener {
    store: Arc<dyn CacheStore>,
    high_value_types: HashSet<String>,
    policy: CallPolicy,
    metrics: Option<CacheMetrics>,
}

impl CacheInvalidationListener {
    pub fn new<I, S>(cache: &RecommendationCache, high_value_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            store: cache.store().clone(),
            high_value_types: high_value_types.into_iter().map(Into::into).collect(),
            policy: cache.policy(),
            metrics: cache.metrics().cloned(),
        }
    }
}

#[async_trait]
impl ChangeListener for CacheInvalidationListener {
    async fn on_change(&self, notification: &ChangeNotification) -> Result<()> {
        if !self.high_value_types.contains(&notification.entity_type) {
            return Ok(());
        }
        let removed = self
            .policy
            .call("cache.invalidate", || {
                self.store.invalidate(&notification.entity_id)
            })
            .await?;
        if removed {
            debug!(entity_id = %notification.entity_id, "cache invalidated on change");
            if let Some(metrics) = &self.metrics {
                metrics.invalidations.inc();
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cache-invalidation"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::features::graph::GraphAdapter;
    use crate::shared::RetryPolicy;
    use graphrec_storage::{Attributes, InMemoryCacheStore, InMemoryGraphStore, ManualClock};
    use std::time::Duration;

    #[tokio::test]
    async fn test_only_high_value_types_invalidated_eagerly() {
        let clock = Arc::new(ManualClock::default());
        let policy = CallPolicy::new(RetryPolicy::immediate(1), Duration::from_secs(1));
        let graph = Arc::new(GraphAdapter::new(
            Arc::new(InMemoryGraphStore::new()),
            clock.clone(),
            policy,
            3,
        ));
        let store = InMemoryCacheStore::new(clock.clone());
        let cache = RecommendationCache::new(
            Arc::new(store.clone()),
            graph.clone(),
            &CacheConfig::default(),
            policy,
        );
        graph.add_listener(Arc::new(CacheInvalidationListener::new(&cache, ["user"])));

        let user = graph.upsert_entity("user", "u1", Attributes::new()).await.unwrap();
        let item = graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();
        cache.put("u1", vec!["i1".into()], user.version, None).await.unwrap();
        cache.put("i1", vec!["i2".into()], item.version, None).await.unwrap();

        graph.upsert_entity("user", "u1", Attributes::new()).await.unwrap();
        graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();

        assert!(store.get("u1").await.unwrap().is_none());
        // lazily invalidated: still stored, rejected by the version check
        assert!(store.get("i1").await.unwrap().is_some());
        assert_eq!(
            cache.get("i1").await.unwrap(),
            crate::features::cache::CacheLookup::Miss
        );
    }
}
