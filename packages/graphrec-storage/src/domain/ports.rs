//! Port traits for every external store
//!
//! Components depend on these traits only. Each port has an in-memory
//! backend; durable ones (graph, lease, ledger, checkpoint) also have a
//! SQLite backend. Search and cache engines live in `graphrec-core`.

use super::models::*;
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// Graph store
// ═══════════════════════════════════════════════════════════════════════════

/// Canonical relationship graph with optimistic concurrency
///
/// Writes never overwrite blindly: `conditional_write` commits only when
/// the stored entity version matches `expected_version`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn get_entity(&self, id: &str) -> Result<Option<Entity>>;

    /// Commit an entity (and optionally one relationship) atomically.
    ///
    /// A relationship whose target entity does not exist is rejected with
    /// a `NotFound` error.
    async fn conditional_write(&self, write: ConditionalWrite) -> Result<WriteOutcome>;

    async fn get_relationship(&self, key: &RelationshipKey) -> Result<Option<Relationship>>;

    /// Outgoing relationships, optionally filtered by type
    async fn relationships_from(
        &self,
        source: &str,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>>;

    /// Incoming relationships, optionally filtered by type
    async fn relationships_to(
        &self,
        target: &str,
        rel_type: Option<&str>,
    ) -> Result<Vec<Relationship>>;

    /// Entities ordered by id, strictly after `after`
    async fn scan_entities(&self, after: Option<&str>, limit: usize) -> Result<Vec<Entity>>;

    async fn count_entities(&self) -> Result<usize>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Coordination stores
// ═══════════════════════════════════════════════════════════════════════════

/// Named leases with store-side expiry
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Grant the lease unless another holder has a non-expired one.
    ///
    /// The same holder re-acquiring an unexpired lease extends it and keeps
    /// its fencing token.
    async fn try_acquire(&self, job_name: &str, holder_id: &str, ttl: Duration)
        -> Result<Option<Lease>>;

    /// Extend a lease that is still held (same holder and token, unexpired)
    async fn try_renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>>;

    /// Returns false when the lease was no longer held
    async fn release(&self, lease: &Lease) -> Result<bool>;

    /// The currently valid lease, if any
    async fn current(&self, job_name: &str) -> Result<Option<Lease>>;
}

/// Processed-event ledger
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomic insert-if-absent. Expired marks count as absent.
    ///
    /// Returns true when this call created the mark.
    async fn insert_if_absent(&self, event_id: &str, retention: Duration) -> Result<bool>;

    async fn remove(&self, event_id: &str) -> Result<bool>;

    async fn contains(&self, event_id: &str) -> Result<bool>;

    async fn purge_expired(&self) -> Result<usize>;
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, job_name: &str) -> Result<Option<Checkpoint>>;

    /// Write unless the stored checkpoint carries a newer fencing token.
    /// Returns false when the write was fenced out.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool>;

    /// Delete unless the stored checkpoint carries a newer fencing token
    async fn clear(&self, job_name: &str, fencing_token: u64) -> Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Derived read models
// ═══════════════════════════════════════════════════════════════════════════

/// Denormalized search index, versioned per document
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn get(&self, entity_id: &str) -> Result<Option<IndexDocument>>;

    async fn get_version(&self, entity_id: &str) -> Result<Option<u64>>;

    /// Write only if absent or strictly newer than the indexed version
    async fn upsert_if_newer(&self, doc: IndexDocument) -> Result<bool>;

    async fn delete(&self, entity_id: &str) -> Result<bool>;

    /// `upsert_if_newer` for each document; returns how many were written
    async fn bulk_upsert(&self, docs: Vec<IndexDocument>) -> Result<usize>;

    /// `(entity_id, version)` pairs ordered by id with `after < id <= until`
    async fn keys_in_range(
        &self,
        after: Option<&str>,
        until: Option<&str>,
        limit: usize,
    ) -> Result<Vec<(EntityId, u64)>>;

    /// Full-text search over live (non-tombstoned) documents
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<EntityId>>;
}

/// Recommendation cache backend
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Expired entries are never returned
    async fn get(&self, entity_id: &str) -> Result<Option<CacheEntry>>;

    /// Compare-and-swap on the version stamp: writes when absent or when
    /// the stored `graph_version` is not newer than the entry's
    async fn put_if_newer(&self, entry: CacheEntry) -> Result<bool>;

    async fn invalidate(&self, entity_id: &str) -> Result<bool>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Event stream
// ═══════════════════════════════════════════════════════════════════════════

/// Ordered, replayable, partitioned event stream
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn partitions(&self) -> Result<Vec<String>>;

    /// Up to `max` events with offset >= `from`, in offset order
    async fn fetch(&self, partition: &str, from: u64, max: usize) -> Result<Vec<RawEvent>>;

    /// Next offset to read
    async fn committed_offset(&self, partition: &str) -> Result<u64>;

    async fn commit(&self, partition: &str, next_offset: u64) -> Result<()>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: DeadLetter) -> Result<()>;
}
