//! Search Index Synchronizer
//!
//! Keeps the denormalized search index in line with the graph:
//!
//! - change notifications are re-derived from the live entity and written
//!   with a version stamp (older notifications are discarded)
//! - failed writes are requeued with exponential backoff, then parked in the
//!   [`DesyncRegistry`] for the reconciliation sweep
//! - [`TantivySearchIndex`] is the on-disk / in-RAM full-text backend

mod desync;
mod document;
mod metrics;
mod synchronizer;
mod tantivy_index;

pub use desync::{DesyncRecord, DesyncRegistry};
pub use document::build_document;
pub use metrics::SearchSyncMetrics;
pub use synchronizer::{ReconcileReport, SearchSynchronizer, SyncOutcome, SyncSettings};
pub use tantivy_index::TantivySearchIndex;
