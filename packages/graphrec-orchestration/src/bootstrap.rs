//! Wiring from a [`GraphrecConfig`] to running components
//!
//! Backends are picked per section (`store.backend`, `search.backend`,
//! `cache.backend`); everything else is shared. Events enter through the
//! in-process [`InMemoryEventLog`].

use graphrec_core::config::{CacheBackend, GraphrecConfig, SearchBackend, StoreBackend, Trigger};
use graphrec_core::features::cache::{CacheInvalidationListener, CacheMetrics, MokaCacheStore};
use graphrec_core::features::ingestion::IngestionMetrics;
use graphrec_core::features::search::{SearchSyncMetrics, SyncSettings, TantivySearchIndex};
use graphrec_core::{
    CallPolicy, CoreError, GraphAdapter, IdempotencyLedger, IngestionRunner, LeaseCoordinator,
    RecommendationCache, RecommendationService, SearchSynchronizer,
};
use graphrec_storage::{
    CacheStore, CheckpointStore, Clock, GraphStore, IdempotencyStore, InMemoryCacheStore,
    InMemoryCheckpointStore, InMemoryDeadLetters, InMemoryEventLog, InMemoryGraphStore,
    InMemoryIdempotencyStore, InMemoryLeaseStore, InMemorySearchIndex, LeaseStore, SearchIndex,
    SqliteCheckpointStore, SqliteGraphStore, SqliteIdempotencyStore, SqliteLeaseStore,
    StorageError, SystemClock,
};
use prometheus::Registry;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::checkpoint::CheckpointManager;
use crate::error::{OrchestratorError, Result};
use crate::handler::JobHandler;
use crate::job::{RECOMPUTE_RECOMMENDATIONS, RECONCILE_INDEX, WARM_CACHE};
use crate::jobs::{CacheWarmJob, RecomputeJob, ReconcileJob};
use crate::orchestrator::{BatchOrchestrator, CycleSettings};
use crate::scheduler::Scheduler;

/// Every component a batch node runs
pub struct Runtime {
    pub config: GraphrecConfig,
    pub graph: Arc<GraphAdapter>,
    pub cache: Arc<RecommendationCache>,
    pub service: Arc<RecommendationService>,
    pub sync: Arc<SearchSynchronizer>,
    pub orchestrator: Arc<BatchOrchestrator>,
    pub ledger: IdempotencyLedger,
    /// Producers append here; the ingestion runner consumes it
    pub events: InMemoryEventLog,
    pub dead_letters: InMemoryDeadLetters,
    pub ingestion: Arc<IngestionRunner>,
}

struct Stores {
    graph: Arc<dyn GraphStore>,
    leases: Arc<dyn LeaseStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    marks: Arc<dyn IdempotencyStore>,
}

fn open_stores(config: &GraphrecConfig, clock: &Arc<dyn Clock>) -> Result<Stores> {
    Ok(match config.store.backend {
        StoreBackend::Memory => Stores {
            graph: Arc::new(InMemoryGraphStore::new()),
            leases: Arc::new(InMemoryLeaseStore::new(clock.clone())),
            checkpoints: Arc::new(InMemoryCheckpointStore::new()),
            marks: Arc::new(InMemoryIdempotencyStore::new(clock.clone())),
        },
        StoreBackend::Sqlite => {
            let path = config
                .store
                .sqlite_path
                .as_deref()
                .ok_or_else(|| StorageError::config("store.sqlite_path is not set"))?;
            info!(path, "opening SQLite stores");
            Stores {
                graph: Arc::new(SqliteGraphStore::open(path)?),
                leases: Arc::new(SqliteLeaseStore::open(path, clock.clone())?),
                checkpoints: Arc::new(SqliteCheckpointStore::open(path)?),
                marks: Arc::new(SqliteIdempotencyStore::open(path, clock.clone())?),
            }
        }
    })
}

fn open_index(config: &GraphrecConfig) -> Result<Arc<dyn SearchIndex>> {
    let search = &config.search;
    Ok(match search.backend {
        SearchBackend::Memory => Arc::new(InMemorySearchIndex::new()),
        SearchBackend::Tantivy => match &search.index_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                Arc::new(TantivySearchIndex::open_in_dir(dir, search.writer_heap_bytes)?)
            }
            None => Arc::new(TantivySearchIndex::in_memory(search.writer_heap_bytes)?),
        },
    })
}

impl Runtime {
    pub fn build(config: GraphrecConfig, registry: &Registry) -> Result<Self> {
        Self::build_with_clock(config, registry, Arc::new(SystemClock))
    }

    pub fn build_with_clock(
        config: GraphrecConfig,
        registry: &Registry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let policy = CallPolicy::from_config(&config.store);
        let stores = open_stores(&config, &clock)?;

        let graph = Arc::new(GraphAdapter::from_config(
            stores.graph,
            clock.clone(),
            &config.store,
        ));

        let cache_store: Arc<dyn CacheStore> = match config.cache.backend {
            CacheBackend::Memory => Arc::new(InMemoryCacheStore::new(clock.clone())),
            CacheBackend::Moka => Arc::new(MokaCacheStore::from_config(&config.cache, clock.clone())),
        };
        let cache = Arc::new(
            RecommendationCache::new(cache_store, graph.clone(), &config.cache, policy)
                .with_metrics(CacheMetrics::new(registry).map_err(CoreError::from)?),
        );
        graph.add_listener(Arc::new(CacheInvalidationListener::new(
            &cache,
            config.cache.high_value_types.iter().cloned(),
        )));

        let service = Arc::new(RecommendationService::new(
            graph.clone(),
            cache.clone(),
            config.recommend.clone(),
        ));

        let sync = Arc::new(
            SearchSynchronizer::new(
                graph.clone(),
                open_index(&config)?,
                SyncSettings::from_config(&config.search),
                policy,
            )
            .with_metrics(SearchSyncMetrics::new(registry).map_err(CoreError::from)?),
        );

        let ledger = IdempotencyLedger::from_config(stores.marks, &config.ledger, policy);
        let events = InMemoryEventLog::new();
        let dead_letters = InMemoryDeadLetters::new();
        let ingestion = Arc::new(
            IngestionRunner::new(
                Arc::new(events.clone()),
                Arc::new(dead_letters.clone()),
                ledger.clone(),
                graph.clone(),
                &config.stream,
                policy,
            )
            .with_metrics(IngestionMetrics::new(registry).map_err(CoreError::from)?)?,
        );

        let holder_id = config
            .lease
            .holder_id
            .clone()
            .unwrap_or_else(|| format!("batch-{}", Uuid::new_v4()));
        let orchestrator = Arc::new(BatchOrchestrator::new(
            LeaseCoordinator::new(stores.leases, policy),
            CheckpointManager::new(stores.checkpoints, policy),
            graph.clone(),
            holder_id,
            CycleSettings::from_config(&config),
        ));

        Ok(Self {
            config,
            graph,
            cache,
            service,
            sync,
            orchestrator,
            ledger,
            events,
            dead_letters,
            ingestion,
        })
    }

    /// Handler for one of the known job names
    pub fn handler(&self, name: &str) -> Result<Arc<dyn JobHandler>> {
        Ok(match name {
            RECOMPUTE_RECOMMENDATIONS => Arc::new(RecomputeJob::new(self.service.clone())),
            RECONCILE_INDEX => Arc::new(ReconcileJob::new(self.sync.clone())),
            WARM_CACHE => Arc::new(CacheWarmJob::new(
                self.service.clone(),
                self.config.cache.high_value_types.iter().cloned(),
            )),
            other => return Err(OrchestratorError::JobNotFound(other.to_string())),
        })
    }

    /// Scheduler with every enabled job from `orchestrator.jobs`
    pub fn scheduler(&self) -> Result<Scheduler> {
        let mut scheduler = Scheduler::new(self.orchestrator.clone());
        for job in self.config.orchestrator.jobs.iter().filter(|j| j.enabled) {
            scheduler.register(self.handler(&job.name)?, Trigger::parse(&job.trigger)?);
        }
        Ok(scheduler)
    }

    /// Feed graph change notifications to the search index until cancelled
    pub fn spawn_search_sync(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.sync.clone().run(self.graph.subscribe(), cancel))
    }

    /// Apply events from [`Runtime::events`] until cancelled
    pub fn spawn_ingestion(&self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.ingestion.clone().run(cancel))
    }

    /// Drop expired ledger marks every `ledger.purge_interval_secs`
    pub fn spawn_ledger_purge(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let every = self.config.ledger.purge_interval();
        tokio::spawn(self.ledger.clone().run_purge(every, cancel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrec_storage::{ManualClock, RawEvent};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_default_config_wires_every_job() {
        let runtime = Runtime::build(GraphrecConfig::default(), &Registry::new()).unwrap();
        for name in [RECOMPUTE_RECOMMENDATIONS, RECONCILE_INDEX, WARM_CACHE] {
            assert_eq!(runtime.handler(name).unwrap().name(), name);
        }
        assert!(matches!(
            runtime.handler("compact"),
            Err(OrchestratorError::JobNotFound(_))
        ));
        assert_eq!(runtime.scheduler().unwrap().job_count(), 3);
    }

    #[tokio::test]
    async fn test_sqlite_and_tantivy_backends() {
        let dir = TempDir::new().unwrap();
        let yaml = format!(
            r#"
version: 1
store:
  backend: sqlite
  sqlite_path: "{db}"
search:
  backend: tantivy
  index_dir: "{index}"
cache:
  backend: moka
orchestrator:
  jobs:
    - name: reconcile-index
      trigger: every 5m
      enabled: true
    - name: warm-cache
      trigger: "@hourly"
      enabled: false
"#,
            db = dir.path().join("graph.db").display(),
            index = dir.path().join("index").display(),
        );
        let config = GraphrecConfig::from_yaml_str(&yaml).unwrap();
        let runtime = Runtime::build(config, &Registry::new()).unwrap();

        runtime
            .graph
            .upsert_relationship("u1", "i1", "viewed", 1.0)
            .await
            .unwrap();
        assert_eq!(runtime.graph.outgoing("u1", None).await.unwrap().len(), 1);
        assert_eq!(runtime.scheduler().unwrap().job_count(), 1);

        // ledger marks share the SQLite file
        assert_eq!(runtime.ledger.try_mark("e9").await.unwrap(), graphrec_core::MarkOutcome::Fresh);
        assert!(runtime.ledger.is_marked("e9").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ingestion_and_ledger_purge_are_wired() {
        let clock = Arc::new(ManualClock::default());
        let mut config = GraphrecConfig::default();
        config.ledger.retention_secs = 120;
        config.ledger.purge_interval_secs = 30;
        config.stream.max_redelivery_delay_secs = 60;
        let runtime = Runtime::build_with_clock(config, &Registry::new(), clock.clone()).unwrap();

        let e1 = RawEvent::new(
            "e1",
            "u42",
            "addRelationship",
            json!({"src": "u42", "dst": "item7", "type": "viewed", "weight": 1}),
        );
        runtime.events.append(e1.clone());
        runtime.events.append(e1);

        let cancel = CancellationToken::new();
        let ingestion = runtime.spawn_ingestion(cancel.clone());
        let purge = runtime.spawn_ledger_purge(cancel.clone());
        while runtime.events.lag("u42") > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runtime.graph.outgoing("u42", None).await.unwrap().len(), 1);
        assert!(runtime.ledger.is_marked("e1").await.unwrap());

        clock.advance(Duration::from_secs(121));
        tokio::time::sleep(Duration::from_secs(31)).await;
        // the purge task already removed the expired mark
        assert_eq!(runtime.ledger.purge_expired().await.unwrap(), 0);

        cancel.cancel();
        ingestion.await.unwrap();
        purge.await.unwrap();
    }
}
