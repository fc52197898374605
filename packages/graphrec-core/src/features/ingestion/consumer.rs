use graphrec_storage::{Clock, DeadLetter, DeadLetterSink, EventSource, RawEvent};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::metrics::IngestionMetrics;
use super::mutation::Mutation;
use crate::errors::{CoreError, Result};
use crate::features::graph::GraphAdapter;
use crate::features::ledger::{IdempotencyLedger, MarkOutcome};
use crate::shared::CallPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Idle,
    Fetching,
    Applying,
    Committed,
}

/// Everything a partition consumer needs, shared by all partitions
pub struct IngestionContext {
    pub source: Arc<dyn EventSource>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub ledger: IdempotencyLedger,
    pub graph: Arc<GraphAdapter>,
    pub batch_size: usize,
    pub policy: CallPolicy,
    pub metrics: Option<IngestionMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub partition: String,
    pub fetched: usize,
    pub applied: usize,
    pub duplicates: usize,
    pub dead_lettered: usize,
    /// Next offset to read after this batch
    pub committed_offset: u64,
    /// Set when the batch stopped early; the rest is redelivered next poll
    pub failure: Option<String>,
}

impl BatchReport {
    pub fn stopped_early(&self) -> bool {
        self.failure.is_some()
    }
}

enum Step {
    Applied,
    Duplicate,
    DeadLettered,
}

/// Sequential consumer for one partition
pub struct PartitionConsumer {
    partition: String,
    ctx: Arc<IngestionContext>,
    state: ConsumerState,
}

impl PartitionConsumer {
    pub fn new(partition: impl Into<String>, ctx: Arc<IngestionContext>) -> Self {
        Self {
            partition: partition.into(),
            ctx,
            state: ConsumerState::Idle,
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Fetch and process one batch from the committed offset
    ///
    /// Fetch errors propagate; a failure while processing an event stops the
    /// batch at that event and is reported in [`BatchReport::failure`].
    pub async fn poll_once(&mut self) -> Result<BatchReport> {
        let ctx = self.ctx.clone();
        let partition = self.partition.clone();

        self.transition(ConsumerState::Fetching);
        let fetched = async {
            let from = ctx
                .policy
                .call("stream.committed_offset", || {
                    ctx.source.committed_offset(&partition)
                })
                .await?;
            let events = ctx
                .policy
                .call("stream.fetch", || {
                    ctx.source.fetch(&partition, from, ctx.batch_size)
                })
                .await?;
            Ok::<_, CoreError>((from, events))
        }
        .await;
        let (from, events) = match fetched {
            Ok(fetched) => fetched,
            Err(err) => {
                self.transition(ConsumerState::Idle);
                return Err(err);
            }
        };

        let mut report = BatchReport {
            partition: partition.clone(),
            fetched: events.len(),
            committed_offset: from,
            ..BatchReport::default()
        };
        if events.is_empty() {
            self.transition(ConsumerState::Idle);
            return Ok(report);
        }

        for event in &events {
            self.transition(ConsumerState::Applying);
            match self.process(event).await {
                Ok(step) => {
                    match step {
                        Step::Applied => report.applied += 1,
                        Step::Duplicate => report.duplicates += 1,
                        Step::DeadLettered => report.dead_lettered += 1,
                    }
                    report.committed_offset = event.offset + 1;
                    self.transition(ConsumerState::Committed);
                }
                Err(err) => {
                    warn!(
                        partition = %partition,
                        event_id = %event.event_id,
                        offset = event.offset,
                        error = %err,
                        "stopping batch, event will be redelivered"
                    );
                    report.failure = Some(err.to_string());
                    break;
                }
            }
        }

        self.transition(ConsumerState::Idle);
        debug!(
            partition = %partition,
            fetched = report.fetched,
            applied = report.applied,
            duplicates = report.duplicates,
            dead_lettered = report.dead_lettered,
            "batch processed"
        );
        Ok(report)
    }

    async fn process(&self, event: &RawEvent) -> Result<Step> {
        let mutation = match Mutation::parse(event) {
            Ok(mutation) => mutation,
            Err(err) => {
                self.dead_letter(event, err.to_string()).await?;
                self.commit(event).await?;
                return Ok(Step::DeadLettered);
            }
        };

        if self.ctx.ledger.try_mark(&event.event_id).await? == MarkOutcome::Duplicate {
            debug!(event_id = %event.event_id, "duplicate delivery skipped");
            self.commit(event).await?;
            if let Some(metrics) = &self.ctx.metrics {
                metrics.duplicates.inc();
            }
            return Ok(Step::Duplicate);
        }

        match mutation.apply(&self.ctx.graph).await {
            Ok(()) => {}
            Err(err) if err.is_transient() => {
                if let Some(metrics) = &self.ctx.metrics {
                    metrics.apply_failures.inc();
                }
                if let Err(release_err) = self.ctx.ledger.release(&event.event_id).await {
                    // the redelivery will be skipped as a duplicate
                    error!(
                        event_id = %event.event_id,
                        error = %release_err,
                        "could not release idempotency mark"
                    );
                }
                return Err(err);
            }
            Err(err) => {
                // rejected by the graph (e.g. tombstone of an unknown id):
                // replaying can never succeed
                self.dead_letter(event, err.to_string()).await?;
                self.commit(event).await?;
                return Ok(Step::DeadLettered);
            }
        }

        self.commit(event).await?;
        if let Some(metrics) = &self.ctx.metrics {
            metrics.applied.inc();
        }
        Ok(Step::Applied)
    }

    async fn dead_letter(&self, event: &RawEvent, reason: String) -> Result<()> {
        warn!(
            partition = %self.partition,
            event_id = %event.event_id,
            reason = %reason,
            "dead-lettering event"
        );
        let letter = DeadLetter {
            event: event.clone(),
            reason,
            dead_lettered_at: self.ctx.graph.clock().now(),
        };
        self.ctx
            .policy
            .call("dead_letters.publish", || {
                self.ctx.dead_letters.publish(letter.clone())
            })
            .await?;
        if let Some(metrics) = &self.ctx.metrics {
            metrics.dead_lettered.inc();
        }
        Ok(())
    }

    async fn commit(&self, event: &RawEvent) -> Result<()> {
        self.ctx
            .policy
            .call("stream.commit", || {
                self.ctx.source.commit(&self.partition, event.offset + 1)
            })
            .await
    }

    fn transition(&mut self, next: ConsumerState) {
        if self.state != next {
            tracing::trace!(partition = %self.partition, from = ?self.state, to = ?next, "consumer state");
            self.state = next;
        }
    }
}
