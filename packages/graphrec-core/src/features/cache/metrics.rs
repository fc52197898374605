//! Prometheus metrics for the recommendation cache

use prometheus::{register_int_counter_with_registry, IntCounter, Opts, Registry};

#[derive(Clone)]
pub struct CacheMetrics {
    pub hits: IntCounter,
    pub misses: IntCounter,
    /// Entries rejected because the graph moved on
    pub stale: IntCounter,
    pub invalidations: IntCounter,
}

impl CacheMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        Ok(Self {
            hits: register_int_counter_with_registry!(
                Opts::new("recommendation_cache_hits_total", "Recommendation cache hits"),
                registry
            )?,
            misses: register_int_counter_with_registry!(
                Opts::new(
                    "recommendation_cache_misses_total",
                    "Recommendation cache misses"
                ),
                registry
            )?,
            stale: register_int_counter_with_registry!(
                Opts::new(
                    "recommendation_cache_stale_total",
                    "Entries evicted on graph version mismatch"
                ),
                registry
            )?,
            invalidations: register_int_counter_with_registry!(
                Opts::new(
                    "recommendation_cache_invalidations_total",
                    "Eager invalidations"
                ),
                registry
            )?,
        })
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.get() as f64;
        let total = hits + self.misses.get() as f64;
        if total > 0.0 {
            hits / total
        } else {
            0.0
        }
    }
}
