//! Batch job handlers
//!
//! | Job | Per chunk |
//! |-----|-----------|
//! | `recompute-recommendations` | refresh every live entity's cached list |
//! | `reconcile-index` | rewrite missing or stale search documents |
//! | `warm-cache` | fill cache misses for high-value entity types |

mod cache_warm;
mod reconcile;
mod recompute;

pub use cache_warm::CacheWarmJob;
pub use recompute::RecomputeJob;
pub use reconcile::ReconcileJob;
