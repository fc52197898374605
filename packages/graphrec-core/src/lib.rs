/*
 * graphrec core - coordination layer of a recommendation graph
 *
 * Feature-first layout:
 * - config/    : YAML configuration (schema v1) and validation
 * - shared/    : Retry and deadline policy for store calls
 * - features/  : lease, ledger, graph, search, cache, recommend, ingestion
 *
 * Storage backends and port traits live in graphrec-storage.
 */

// ═══════════════════════════════════════════════════════════════════════════
// Module Exports
// ═══════════════════════════════════════════════════════════════════════════

/// Configuration system
pub mod config;

/// Error types
pub mod errors;

/// Feature modules
pub mod features;

/// Retry, backoff and deadlines
pub mod shared;

// ═══════════════════════════════════════════════════════════════════════════
// Re-exports for Public API
// ═══════════════════════════════════════════════════════════════════════════

pub use config::GraphrecConfig;
pub use errors::{CoreError, Result};
pub use features::cache::{CacheLookup, RecommendationCache};
pub use features::graph::{ChangeListener, ChangeNotifier, GraphAdapter};
pub use features::ingestion::{IngestionRunner, Mutation, PartitionConsumer};
pub use features::lease::{AcquireOutcome, LeaseCoordinator, RenewOutcome};
pub use features::ledger::{IdempotencyLedger, MarkOutcome};
pub use features::recommend::{Freshness, RecommendationService, Recommendations};
pub use features::search::{SearchSynchronizer, SyncOutcome};
pub use shared::{CallPolicy, RetryPolicy};
