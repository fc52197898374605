use async_trait::async_trait;
use graphrec_core::features::cache::CacheLookup;
use graphrec_core::{CoreError, RecommendationService};
use graphrec_storage::Entity;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;

use crate::error::{OrchestratorError, Result};
use crate::handler::{ChunkContext, ChunkReport, JobHandler};
use crate::job::WARM_CACHE;

/// Precompute lists that are missing or stale for selected entity types
pub struct CacheWarmJob {
    service: Arc<RecommendationService>,
    /// Empty means every type
    types: HashSet<String>,
}

impl CacheWarmJob {
    pub fn new<I, S>(service: Arc<RecommendationService>, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            service,
            types: types.into_iter().map(Into::into).collect(),
        }
    }

    fn wanted(&self, entity: &Entity) -> bool {
        !entity.tombstoned && (self.types.is_empty() || self.types.contains(&entity.entity_type))
    }

    async fn warm(&self, entity_id: &str) -> graphrec_core::Result<()> {
        if let CacheLookup::Miss = self.service.cache().get(entity_id).await? {
            self.service.refresh(entity_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobHandler for CacheWarmJob {
    fn name(&self) -> &str {
        WARM_CACHE
    }

    async fn process_chunk(&self, _ctx: &ChunkContext, entities: &[Entity]) -> Result<ChunkReport> {
        let mut report = ChunkReport::default();
        for entity in entities.iter().filter(|e| self.wanted(e)) {
            match self.warm(&entity.id).await {
                Ok(()) => report.processed += 1,
                Err(err @ CoreError::Unavailable(_)) => return Err(OrchestratorError::Core(err)),
                Err(err) => {
                    warn!(entity_id = %entity.id, error = %err, "cache warm failed");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }
}
