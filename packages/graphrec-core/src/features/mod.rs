//! Feature modules
//!
//! Each feature owns one coordination concern and talks to storage only
//! through the `graphrec-storage` ports.
//!
//! ```text
//! ingestion ─► ledger (dedup) ─► graph adapter ─► change notifier
//!                                                   ├─► search synchronizer
//!                                                   └─► cache invalidation
//! recommend ─► cache ─► graph adapter
//! lease: used by the batch orchestrator
//! ```

pub mod cache;
pub mod graph;
pub mod ingestion;
pub mod lease;
pub mod ledger;
pub mod recommend;
pub mod search;
