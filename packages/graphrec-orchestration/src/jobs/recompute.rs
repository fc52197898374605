use async_trait::async_trait;
use graphrec_core::{CoreError, RecommendationService};
use graphrec_storage::Entity;
use std::sync::Arc;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::handler::{ChunkContext, ChunkReport, JobHandler};
use crate::job::RECOMPUTE_RECOMMENDATIONS;

/// Recompute and re-cache recommendations for every live entity
pub struct RecomputeJob {
    service: Arc<RecommendationService>,
}

impl RecomputeJob {
    pub fn new(service: Arc<RecommendationService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl JobHandler for RecomputeJob {
    fn name(&self) -> &str {
        RECOMPUTE_RECOMMENDATIONS
    }

    async fn process_chunk(&self, _ctx: &ChunkContext, entities: &[Entity]) -> Result<ChunkReport> {
        let mut report = ChunkReport::default();
        for entity in entities {
            let outcome = if entity.tombstoned {
                self.service.cache().invalidate(&entity.id).await.map(|_| ())
            } else {
                self.service.refresh(&entity.id).await.map(|_| ())
            };
            match outcome {
                Ok(()) => report.processed += 1,
                // the store is down for everyone: abort the chunk
                Err(err @ CoreError::Unavailable(_)) => return Err(OrchestratorError::Core(err)),
                Err(err) => {
                    warn!(entity_id = %entity.id, error = %err, "recompute failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
