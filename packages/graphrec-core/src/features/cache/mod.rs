//! Recommendation Cache
//!
//! Read-through cache of recommendation lists, stamped with the graph
//! version they were computed from:
//!
//! - a lookup whose stamp differs from the live entity version is a miss
//!   (and the stale entry is evicted)
//! - writes are compare-and-swap on the stamp, so an older computation
//!   never overwrites a newer one
//! - high-value entity types are invalidated eagerly on change; the rest
//!   lazily by the version check

mod invalidation;
mod metrics;
mod moka_store;
mod recommendation_cache;

pub use invalidation::CacheInvalidationListener;
pub use metrics::CacheMetrics;
pub use moka_store::MokaCacheStore;
pub use recommendation_cache::{CacheLookup, RecommendationCache};
