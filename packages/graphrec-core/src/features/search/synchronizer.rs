use chrono::Utc;
use graphrec_storage::{ChangeNotification, Entity, SearchIndex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::desync::{DesyncRecord, DesyncRegistry};
use super::document::build_document;
use super::metrics::SearchSyncMetrics;
use crate::config::SearchConfig;
use crate::errors::{CoreError, Result};
use crate::features::graph::GraphAdapter;
use crate::shared::CallPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Written { version: u64 },
    /// The index already holds this version or a newer one
    Discarded { indexed_version: u64 },
}

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub top_neighbors: usize,
}

impl SyncSettings {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_backoff: config.base_backoff(),
            max_backoff: config.max_backoff(),
            top_neighbors: config.top_neighbors,
        }
    }

    /// `base_backoff * 2^attempt`, capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&SearchConfig::default())
    }
}

/// Result of one reconciliation pass over a chunk of entities
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub repaired: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: ReconcileReport) {
        self.checked += other.checked;
        self.repaired += other.repaired;
        self.failed += other.failed;
    }
}

/// Graph → search index projection
pub struct SearchSynchronizer {
    graph: Arc<GraphAdapter>,
    index: Arc<dyn SearchIndex>,
    desync: Arc<DesyncRegistry>,
    settings: SyncSettings,
    policy: CallPolicy,
    metrics: Option<SearchSyncMetrics>,
}

impl SearchSynchronizer {
    pub fn new(
        graph: Arc<GraphAdapter>,
        index: Arc<dyn SearchIndex>,
        settings: SyncSettings,
        policy: CallPolicy,
    ) -> Self {
        Self {
            graph,
            index,
            desync: Arc::new(DesyncRegistry::new()),
            settings,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SearchSyncMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn desync_registry(&self) -> &Arc<DesyncRegistry> {
        &self.desync
    }

    pub fn index(&self) -> &Arc<dyn SearchIndex> {
        &self.index
    }

    /// One attempt at bringing the entity's document up to `notification`
    pub async fn sync(&self, notification: &ChangeNotification) -> Result<SyncOutcome> {
        let indexed = self.indexed_version(&notification.entity_id).await?;
        if let Some(indexed_version) = indexed.filter(|v| *v >= notification.version) {
            return Ok(self.discarded(&notification.entity_id, indexed_version));
        }

        // Re-derive from the live graph; it may already be past the notification.
        let entity = self
            .graph
            .get_entity(&notification.entity_id)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("entity {}", notification.entity_id)))?;
        self.write_entity(&entity, indexed).await
    }

    /// Write the entity's document unless the index is already current
    pub async fn sync_entity(&self, entity: &Entity) -> Result<SyncOutcome> {
        let indexed = self.indexed_version(&entity.id).await?;
        self.write_entity(entity, indexed).await
    }

    /// `sync` with inline backoff retries; exhausted retries park the entity
    pub async fn handle(&self, notification: &ChangeNotification) -> Result<SyncOutcome> {
        let mut attempt = 0;
        loop {
            match self.sync(notification).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff(attempt);
                    self.note_retry(notification, attempt, delay, &err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(self.mark_desync(notification, &err)),
            }
        }
    }

    /// Consume notifications until the channel closes or `cancel` fires
    ///
    /// A failed write is requeued after its backoff without holding up
    /// later notifications. Whatever is still waiting for a retry when the
    /// loop stops is parked in the desync registry for reconciliation.
    pub async fn run(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<ChangeNotification>,
        cancel: CancellationToken,
    ) {
        // ticket -> (notification, next attempt) while its backoff runs
        let mut waiting: HashMap<u64, (ChangeNotification, u32)> = HashMap::new();
        let mut timers: JoinSet<u64> = JoinSet::new();
        let mut next_ticket = 0u64;
        let mut source_open = true;
        info!("search synchronizer started");

        loop {
            if !source_open && timers.is_empty() {
                break;
            }
            let (notification, attempt) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = notifications.recv(), if source_open => match received {
                    Some(notification) => (notification, 0),
                    None => {
                        source_open = false;
                        continue;
                    }
                },
                Some(fired) = timers.join_next(), if !timers.is_empty() => {
                    match fired.ok().and_then(|ticket| waiting.remove(&ticket)) {
                        Some(task) => task,
                        None => continue,
                    }
                }
            };

            match self.sync(&notification).await {
                Ok(_) => {}
                Err(err) if attempt < self.settings.max_retries => {
                    let delay = self.settings.backoff(attempt);
                    self.note_retry(&notification, attempt, delay, &err);
                    let ticket = next_ticket;
                    next_ticket += 1;
                    waiting.insert(ticket, (notification, attempt + 1));
                    timers.spawn(async move {
                        tokio::time::sleep(delay).await;
                        ticket
                    });
                }
                Err(err) => {
                    self.mark_desync(&notification, &err);
                }
            }
        }

        timers.abort_all();
        let parked = waiting.len();
        for (notification, attempt) in waiting.into_values() {
            let err = CoreError::Unavailable(format!("stopped before retry {attempt}"));
            self.mark_desync(&notification, &err);
        }
        info!(parked, "search synchronizer stopped");
    }

    /// Compare a chunk of entities with the index and rewrite stale documents
    ///
    /// `after` is the scan cursor the chunk was read from.
    pub async fn reconcile_chunk(
        &self,
        after: Option<&str>,
        entities: &[Entity],
    ) -> Result<ReconcileReport> {
        let Some(last) = entities.last() else {
            return Ok(ReconcileReport::default());
        };
        let indexed: HashMap<String, u64> = self
            .policy
            .call("search.keys_in_range", || {
                self.index
                    .keys_in_range(after, Some(last.id.as_str()), usize::MAX)
            })
            .await?
            .into_iter()
            .collect();

        let mut report = ReconcileReport::default();
        for entity in entities {
            report.checked += 1;
            let current = indexed.get(&entity.id).copied();
            if current.is_some_and(|v| v >= entity.version) {
                continue;
            }
            match self.write_entity(entity, current).await {
                Ok(SyncOutcome::Written { .. }) => {
                    report.repaired += 1;
                    self.desync.remove(&entity.id);
                }
                Ok(SyncOutcome::Discarded { .. }) => {
                    self.desync.remove(&entity.id);
                }
                Err(err) => {
                    warn!(entity_id = %entity.id, error = %err, "reconcile write failed");
                    report.failed += 1;
                }
            }
        }
        self.refresh_pending_gauge();
        Ok(report)
    }

    /// Retry every parked entity once against the live graph
    pub async fn retry_desynced(&self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        for record in self.desync.drain() {
            report.checked += 1;
            let entity = match self.graph.get_entity(&record.entity_id).await {
                Ok(Some(entity)) => entity,
                Ok(None) => continue,
                Err(err) => {
                    self.desync.record(record);
                    report.failed += 1;
                    if err.is_transient() {
                        continue;
                    }
                    return Err(err);
                }
            };
            match self.sync_entity(&entity).await {
                Ok(SyncOutcome::Written { .. }) => report.repaired += 1,
                Ok(SyncOutcome::Discarded { .. }) => {}
                Err(err) => {
                    debug!(entity_id = %entity.id, error = %err, "still desynced");
                    self.desync.record(DesyncRecord {
                        reason: err.to_string(),
                        recorded_at: Utc::now(),
                        ..record
                    });
                    report.failed += 1;
                }
            }
        }
        self.refresh_pending_gauge();
        Ok(report)
    }

    async fn indexed_version(&self, entity_id: &str) -> Result<Option<u64>> {
        self.policy.once(self.index.get_version(entity_id)).await
    }

    async fn write_entity(&self, entity: &Entity, indexed: Option<u64>) -> Result<SyncOutcome> {
        if let Some(indexed_version) = indexed.filter(|v| *v >= entity.version) {
            return Ok(self.discarded(&entity.id, indexed_version));
        }

        let neighbors = self
            .graph
            .neighbors(&entity.id, None, self.settings.top_neighbors)
            .await?;
        let doc = build_document(entity, &neighbors);

        let written = self.policy.once(self.index.upsert_if_newer(doc)).await?;
        if !written {
            // a concurrent writer got there first
            return Ok(self.discarded(&entity.id, entity.version));
        }

        debug!(entity_id = %entity.id, version = entity.version, "index document written");
        if let Some(metrics) = &self.metrics {
            metrics.written.inc();
        }
        Ok(SyncOutcome::Written {
            version: entity.version,
        })
    }

    fn discarded(&self, entity_id: &str, indexed_version: u64) -> SyncOutcome {
        debug!(entity_id, indexed_version, "stale notification discarded");
        if let Some(metrics) = &self.metrics {
            metrics.discarded.inc();
        }
        SyncOutcome::Discarded { indexed_version }
    }

    fn note_retry(
        &self,
        notification: &ChangeNotification,
        attempt: u32,
        delay: Duration,
        err: &CoreError,
    ) {
        warn!(
            entity_id = %notification.entity_id,
            version = notification.version,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "index write failed, requeueing"
        );
        if let Some(metrics) = &self.metrics {
            metrics.retries.inc();
        }
    }

    fn mark_desync(&self, notification: &ChangeNotification, err: &CoreError) -> CoreError {
        error!(
            entity_id = %notification.entity_id,
            version = notification.version,
            error = %err,
            "permanent index desync"
        );
        self.desync.record(DesyncRecord {
            entity_id: notification.entity_id.clone(),
            version: notification.version,
            reason: err.to_string(),
            recorded_at: Utc::now(),
        });
        if let Some(metrics) = &self.metrics {
            metrics.desyncs.inc();
        }
        self.refresh_pending_gauge();
        CoreError::PermanentDesync {
            entity_id: notification.entity_id.clone(),
            reason: err.to_string(),
        }
    }

    fn refresh_pending_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.desync_pending.set(self.desync.len() as i64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::RetryPolicy;
    use graphrec_storage::{
        Attributes, InMemoryGraphStore, InMemorySearchIndex, ManualClock, MutationKind,
    };
    use prometheus::Registry;

    struct Fixture {
        graph: Arc<GraphAdapter>,
        index: InMemorySearchIndex,
        sync: Arc<SearchSynchronizer>,
    }

    fn fixture(max_retries: u32) -> Fixture {
        let policy = CallPolicy::new(RetryPolicy::immediate(1), Duration::from_secs(1));
        let graph = Arc::new(GraphAdapter::new(
            Arc::new(InMemoryGraphStore::new()),
            Arc::new(ManualClock::default()),
            policy,
            3,
        ));
        let index = InMemorySearchIndex::new();
        let settings = SyncSettings {
            max_retries,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            top_neighbors: 3,
        };
        let sync = SearchSynchronizer::new(graph.clone(), Arc::new(index.clone()), settings, policy)
            .with_metrics(SearchSyncMetrics::new(&Registry::new()).unwrap());
        Fixture {
            graph,
            index,
            sync: Arc::new(sync),
        }
    }

    fn notification(id: &str, version: u64) -> ChangeNotification {
        ChangeNotification {
            entity_id: id.into(),
            entity_type: "item".into(),
            version,
            kind: MutationKind::EntityUpserted,
        }
    }

    #[test]
    fn test_backoff_schedule() {
        let settings = SyncSettings {
            max_retries: 5,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            top_neighbors: 10,
        };
        assert_eq!(settings.backoff(0), Duration::from_millis(100));
        assert_eq!(settings.backoff(2), Duration::from_millis(400));
        assert_eq!(settings.backoff(3), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_sync_writes_document_with_neighbors() {
        let f = fixture(2);
        f.graph.upsert_entity("user", "u1", Attributes::new()).await.unwrap();
        f.graph.upsert_relationship("u1", "i1", "viewed", 2.0).await.unwrap();

        let outcome = f.sync.sync(&notification("u1", 2)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Written { version: 2 });

        let doc = f.index.get("u1").await.unwrap().unwrap();
        assert_eq!(doc.top_neighbors, vec!["i1"]);
        assert_eq!(doc.entity_type, "user");
    }

    #[tokio::test]
    async fn test_stale_notification_discarded() {
        let f = fixture(2);
        f.graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();
        f.graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();

        assert_eq!(
            f.sync.sync(&notification("i1", 2)).await.unwrap(),
            SyncOutcome::Written { version: 2 }
        );
        assert_eq!(
            f.sync.sync(&notification("i1", 1)).await.unwrap(),
            SyncOutcome::Discarded { indexed_version: 2 }
        );
    }

    #[tokio::test]
    async fn test_tombstoned_entity_indexed_as_tombstone() {
        let f = fixture(2);
        f.graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();
        f.graph.tombstone_entity("i1").await.unwrap();

        f.sync.sync(&notification("i1", 2)).await.unwrap();
        assert!(f.index.get("i1").await.unwrap().unwrap().tombstoned);
        assert!(f.index.search("i1", 10).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_retries_then_parks_entity() {
        let f = fixture(2);
        f.graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();
        f.index.faults().set_down(true);

        let err = f.sync.handle(&notification("i1", 1)).await.unwrap_err();
        assert!(matches!(err, CoreError::PermanentDesync { .. }));
        assert!(f.sync.desync_registry().contains("i1"));

        f.index.faults().set_down(false);
        let report = f.sync.retry_desynced().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert!(f.sync.desync_registry().is_empty());
        assert_eq!(f.index.get_version("i1").await.unwrap(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handle_recovers_within_retries() {
        let f = fixture(3);
        f.graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();
        f.index.faults().fail_next(2);

        let outcome = f.sync.handle(&notification("i1", 1)).await.unwrap();
        assert_eq!(outcome, SyncOutcome::Written { version: 1 });
        assert!(f.sync.desync_registry().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_requeues_failed_write() {
        let f = fixture(3);
        let rx = f.graph.subscribe();
        f.index.faults().fail_next(1);

        f.graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();
        f.graph.upsert_entity("item", "i2", Attributes::new()).await.unwrap();
        // redelivered notification for an already indexed version
        f.graph.notifier().publish(notification("i2", 1)).await;

        let handle = tokio::spawn(f.sync.clone().run(rx, CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(f.index.get_version("i1").await.unwrap(), Some(1));
        assert_eq!(f.index.get_version("i2").await.unwrap(), Some(1));
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_parks_notifications_awaiting_retry() {
        let f = fixture(3);
        let rx = f.graph.subscribe();
        f.index.faults().fail_next(1);
        f.graph.upsert_entity("item", "i1", Attributes::new()).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.sync.clone().run(rx, cancel.clone()));
        // first attempt fails; the 10ms backoff has not elapsed yet
        tokio::time::sleep(Duration::from_millis(1)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(f.index.get_version("i1").await.unwrap(), None);
        assert_eq!(f.sync.desync_registry().len(), 1);
        assert!(f.sync.desync_registry().contains("i1"));

        // the reconciliation pass repairs it
        let report = f.sync.retry_desynced().await.unwrap();
        assert_eq!(report.repaired, 1);
        assert_eq!(f.index.get_version("i1").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let f = fixture(1);
        let rx = f.graph.subscribe();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.sync.clone().run(rx, cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_chunk_repairs_missing_and_stale() {
        let f = fixture(1);
        for id in ["a", "b", "c"] {
            f.graph.upsert_entity("item", id, Attributes::new()).await.unwrap();
        }
        f.sync.sync(&notification("a", 1)).await.unwrap();
        f.sync.sync(&notification("b", 1)).await.unwrap();
        f.graph.upsert_entity("item", "b", Attributes::new()).await.unwrap();

        let entities = f.graph.scan_entities(None, 10).await.unwrap();
        let report = f.sync.reconcile_chunk(None, &entities).await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                checked: 3,
                repaired: 2,
                failed: 0
            }
        );
        assert_eq!(f.index.get_version("b").await.unwrap(), Some(2));
        assert_eq!(f.index.get_version("c").await.unwrap(), Some(1));
    }
}
