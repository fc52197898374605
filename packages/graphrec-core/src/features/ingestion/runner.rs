use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use graphrec_storage::{DeadLetterSink, EventSource};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::consumer::{BatchReport, IngestionContext, PartitionConsumer};
use super::metrics::IngestionMetrics;
use crate::config::StreamConfig;
use crate::errors::{CoreError, Result};
use crate::features::graph::GraphAdapter;
use crate::features::ledger::IdempotencyLedger;
use crate::shared::CallPolicy;

/// Drives one [`PartitionConsumer`] per partition
///
/// A partition is never processed by two tasks at once; distinct
/// partitions run concurrently up to `max_concurrent_partitions`.
pub struct IngestionRunner {
    ctx: Arc<IngestionContext>,
    consumers: DashMap<String, Arc<Mutex<PartitionConsumer>>>,
    max_concurrent: usize,
    poll_interval: Duration,
}

impl IngestionRunner {
    pub fn new(
        source: Arc<dyn EventSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        ledger: IdempotencyLedger,
        graph: Arc<GraphAdapter>,
        config: &StreamConfig,
        policy: CallPolicy,
    ) -> Self {
        Self {
            ctx: Arc::new(IngestionContext {
                source,
                dead_letters,
                ledger,
                graph,
                batch_size: config.batch_size,
                policy,
                metrics: None,
            }),
            consumers: DashMap::new(),
            max_concurrent: config.max_concurrent_partitions.max(1),
            poll_interval: config.poll_interval(),
        }
    }

    /// Attach metrics. Fails once the context has been handed out (a
    /// consumer or a [`context`](Self::context) clone would miss them).
    pub fn with_metrics(mut self, metrics: IngestionMetrics) -> Result<Self> {
        let ctx = Arc::get_mut(&mut self.ctx).ok_or_else(|| {
            CoreError::validation("ingestion metrics must be attached before the runner is shared")
        })?;
        ctx.metrics = Some(metrics);
        Ok(self)
    }

    pub fn context(&self) -> &Arc<IngestionContext> {
        &self.ctx
    }

    fn consumer(&self, partition: &str) -> Arc<Mutex<PartitionConsumer>> {
        self.consumers
            .entry(partition.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(PartitionConsumer::new(partition, self.ctx.clone())))
            })
            .clone()
    }

    /// One batch for every partition; a failing partition does not hold up
    /// the others
    pub async fn poll_once(&self) -> Result<Vec<BatchReport>> {
        let partitions = self
            .ctx
            .policy
            .call("stream.partitions", || self.ctx.source.partitions())
            .await?;

        let reports = stream::iter(partitions)
            .map(|partition| async move {
                let consumer = self.consumer(&partition);
                let mut consumer = consumer.lock().await;
                let outcome = consumer.poll_once().await;
                (partition, outcome)
            })
            .buffer_unordered(self.max_concurrent)
            .collect::<Vec<_>>()
            .await;

        let mut batches = Vec::with_capacity(reports.len());
        for (partition, outcome) in reports {
            match outcome {
                Ok(report) => batches.push(report),
                Err(err) => warn!(partition = %partition, error = %err, "partition poll failed"),
            }
        }
        batches.sort_by(|a, b| a.partition.cmp(&b.partition));
        Ok(batches)
    }

    /// Poll until cancelled; sleeps only when a round made no progress
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(max_concurrent = self.max_concurrent, "ingestion runner started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let progressed = match self.poll_once().await {
                Ok(reports) => reports
                    .iter()
                    .any(|r| r.fetched > 0 && !r.stopped_early()),
                Err(err) => {
                    warn!(error = %err, "listing partitions failed");
                    false
                }
            };
            if progressed {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!("ingestion runner stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::RetryPolicy;
    use graphrec_storage::{
        InMemoryDeadLetters, InMemoryEventLog, InMemoryGraphStore, InMemoryIdempotencyStore,
        ManualClock, RawEvent,
    };
    use prometheus::Registry;
    use serde_json::json;

    fn runner(log: &InMemoryEventLog, store: &InMemoryGraphStore) -> IngestionRunner {
        let clock = Arc::new(ManualClock::default());
        let policy = CallPolicy::new(RetryPolicy::immediate(1), Duration::from_secs(1));
        let graph = Arc::new(GraphAdapter::new(
            Arc::new(store.clone()),
            clock.clone(),
            policy,
            3,
        ));
        IngestionRunner::new(
            Arc::new(log.clone()),
            Arc::new(InMemoryDeadLetters::new()),
            IdempotencyLedger::new(
                Arc::new(InMemoryIdempotencyStore::new(clock)),
                Duration::from_secs(3600),
                policy,
            ),
            graph,
            &StreamConfig {
                max_concurrent_partitions: 2,
                ..StreamConfig::default()
            },
            policy,
        )
    }

    fn viewed(id: &str, partition: &str, user: &str, item: &str) -> RawEvent {
        RawEvent::new(
            id,
            partition,
            "addRelationship",
            json!({"src": user, "dst": item, "type": "viewed", "weight": 1}),
        )
    }

    #[tokio::test]
    async fn test_poll_once_covers_every_partition() {
        let log = InMemoryEventLog::new();
        let store = InMemoryGraphStore::new();
        for p in ["p0", "p1", "p2"] {
            log.append(viewed(&format!("{}-e", p), p, &format!("u-{}", p), "i1"));
        }
        let runner = runner(&log, &store);

        let reports = runner.poll_once().await.unwrap();
        let partitions: Vec<&str> = reports.iter().map(|r| r.partition.as_str()).collect();
        assert_eq!(partitions, vec!["p0", "p1", "p2"]);
        assert!(reports.iter().all(|r| r.applied == 1));
        assert_eq!(store.relationship_count(), 3);
    }

    #[tokio::test]
    async fn test_metrics_attach_before_sharing_only() {
        let log = InMemoryEventLog::new();
        let store = InMemoryGraphStore::new();
        let registry = Registry::new();

        log.append(viewed("e1", "p0", "u1", "i1"));
        let runner = runner(&log, &store)
            .with_metrics(IngestionMetrics::new(&registry).unwrap())
            .unwrap();
        runner.poll_once().await.unwrap();
        let metrics = runner.context().metrics.as_ref().unwrap();
        assert_eq!(metrics.applied.get(), 1);

        let shared = self::runner(&log, &store);
        let _held = shared.context().clone();
        let err = shared
            .with_metrics(IngestionMetrics::new(&Registry::new()).unwrap())
            .err()
            .unwrap();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_drains_then_stops_on_cancel() {
        let log = InMemoryEventLog::new();
        let store = InMemoryGraphStore::new();
        for i in 0..250 {
            log.append(viewed(&format!("e{}", i), "p0", "u1", &format!("i{}", i)));
        }
        let runner = Arc::new(runner(&log, &store));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(runner.clone().run(cancel.clone()));

        while log.lag("p0") > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(store.relationship_count(), 250);
    }
}
