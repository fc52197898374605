use async_trait::async_trait;
use graphrec_storage::Entity;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Context passed to a handler with each chunk
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub job_name: String,
    /// Scan cursor the chunk was read from (None = first chunk)
    pub after: Option<String>,
    /// Zero-based index of the chunk within this cycle
    pub index: u64,
}

/// Outcome of one chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub processed: u64,
    /// Entities that failed individually; the chunk still commits
    pub failed: u64,
}

impl ChunkReport {
    pub fn merge(&mut self, other: ChunkReport) {
        self.processed += other.processed;
        self.failed += other.failed;
    }
}

/// A chunked batch job
///
/// Returning `Err` from `process_chunk` aborts the chunk (not committed) and
/// fails the cycle; per-entity problems belong in [`ChunkReport::failed`].
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Lease and checkpoint key
    fn name(&self) -> &str;

    /// Runs once per cycle after the lease is acquired
    async fn prepare(&self) -> Result<ChunkReport> {
        Ok(ChunkReport::default())
    }

    async fn process_chunk(&self, ctx: &ChunkContext, entities: &[Entity]) -> Result<ChunkReport>;
}
