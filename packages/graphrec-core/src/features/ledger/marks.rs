use graphrec_storage::IdempotencyStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::errors::Result;
use crate::shared::CallPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// First sighting; the caller owns applying the event
    Fresh,
    Duplicate,
}

/// At-most-once gate for event application
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn IdempotencyStore>,
    retention: Duration,
    policy: CallPolicy,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn IdempotencyStore>, retention: Duration, policy: CallPolicy) -> Self {
        Self {
            store,
            retention,
            policy,
        }
    }

    pub fn from_config(
        store: Arc<dyn IdempotencyStore>,
        config: &LedgerConfig,
        policy: CallPolicy,
    ) -> Self {
        Self::new(store, config.retention(), policy)
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Atomic insert-if-absent of the event id
    pub async fn try_mark(&self, event_id: &str) -> Result<MarkOutcome> {
        let inserted = self
            .policy
            .call("ledger.try_mark", || {
                self.store.insert_if_absent(event_id, self.retention)
            })
            .await?;

        if inserted {
            Ok(MarkOutcome::Fresh)
        } else {
            debug!(event_id, "duplicate event");
            Ok(MarkOutcome::Duplicate)
        }
    }

    /// Forget a mark whose apply step failed, so redelivery applies it
    pub async fn release(&self, event_id: &str) -> Result<()> {
        self.policy
            .call("ledger.release", || self.store.remove(event_id))
            .await?;
        Ok(())
    }

    pub async fn is_marked(&self, event_id: &str) -> Result<bool> {
        self.policy
            .call("ledger.contains", || self.store.contains(event_id))
            .await
    }

    pub async fn purge_expired(&self) -> Result<usize> {
        let purged = self
            .policy
            .call("ledger.purge", || self.store.purge_expired())
            .await?;
        if purged > 0 {
            info!(purged, "purged expired ledger marks");
        }
        Ok(purged)
    }

    /// Purge every `every` until cancelled; a failed purge waits for the
    /// next tick
    pub async fn run_purge(self, every: Duration, cancel: CancellationToken) {
        let mut ticks = tokio::time::interval(every.max(Duration::from_secs(1)));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticks.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticks.tick() => {
                    if let Err(err) = self.purge_expired().await {
                        warn!(error = %err, "ledger purge failed");
                    }
                }
            }
        }
        debug!("ledger purge stopped");
    }
}
