use async_trait::async_trait;
use graphrec_core::features::search::ReconcileReport;
use graphrec_core::SearchSynchronizer;
use graphrec_storage::Entity;
use std::sync::Arc;
use tracing::info;

use crate::error::Result;
use crate::handler::{ChunkContext, ChunkReport, JobHandler};
use crate::job::RECONCILE_INDEX;

/// Bring the search index back in line with the graph
///
/// Each cycle first retries the entities parked as desynced, then walks
/// the whole entity range.
pub struct ReconcileJob {
    sync: Arc<SearchSynchronizer>,
}

impl ReconcileJob {
    pub fn new(sync: Arc<SearchSynchronizer>) -> Self {
        Self { sync }
    }
}

fn to_chunk_report(report: ReconcileReport) -> ChunkReport {
    ChunkReport {
        processed: report.checked as u64,
        failed: report.failed as u64,
    }
}

#[async_trait]
impl JobHandler for ReconcileJob {
    fn name(&self) -> &str {
        RECONCILE_INDEX
    }

    async fn prepare(&self) -> Result<ChunkReport> {
        let report = self.sync.retry_desynced().await?;
        if report.checked > 0 {
            info!(
                checked = report.checked,
                repaired = report.repaired,
                failed = report.failed,
                "retried desynced entities"
            );
        }
        Ok(to_chunk_report(report))
    }

    async fn process_chunk(&self, ctx: &ChunkContext, entities: &[Entity]) -> Result<ChunkReport> {
        let report = self
            .sync
            .reconcile_chunk(ctx.after.as_deref(), entities)
            .await?;
        Ok(to_chunk_report(report))
    }
}
