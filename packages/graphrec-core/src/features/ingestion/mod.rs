//! Event Ingestion Consumer
//!
//! Per partition, strictly in offset order:
//!
//! ```text
//! Idle ─► Fetching ─► Applying ─► Committed ─► Idle
//!                        │
//!   invalid ─► dead letter + commit
//!   valid   ─► ledger.try_mark ─► Fresh: apply + commit
//!                              └► Duplicate: commit
//!   transient apply failure ─► release mark, stop batch (no commit)
//! ```
//!
//! Partitions run concurrently under [`IngestionRunner`].

mod consumer;
mod metrics;
mod mutation;
mod runner;

pub use consumer::{BatchReport, ConsumerState, IngestionContext, PartitionConsumer};
pub use metrics::IngestionMetrics;
pub use mutation::{Mutation, ADD_RELATIONSHIP, TOMBSTONE_ENTITY, UPSERT_ENTITY};
pub use runner::IngestionRunner;
