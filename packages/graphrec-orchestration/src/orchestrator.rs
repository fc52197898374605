use chrono::{DateTime, Utc};
use graphrec_core::config::GraphrecConfig;
use graphrec_core::{AcquireOutcome, GraphAdapter, LeaseCoordinator, RenewOutcome};
use graphrec_storage::{to_chrono, Clock, Cursor, Lease};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointManager;
use crate::error::{OrchestratorError, Result};
use crate::handler::{ChunkContext, ChunkReport, JobHandler};
use crate::job::{JobRun, JobStateMachine};

/// Timing knobs for one orchestrator
#[derive(Debug, Clone, Copy)]
pub struct CycleSettings {
    pub lease_ttl: Duration,
    pub renew_margin: Duration,
    pub chunk_size: usize,
    /// Seed for the moving max of observed chunk durations
    pub expected_chunk_duration: Duration,
}

impl CycleSettings {
    pub fn from_config(config: &GraphrecConfig) -> Self {
        Self {
            lease_ttl: config.lease.ttl(),
            renew_margin: config.lease.renew_margin(),
            chunk_size: config.orchestrator.chunk_size,
            expected_chunk_duration: config.orchestrator.expected_chunk_duration(),
        }
    }
}

/// A granted lease plus this node's own estimate of when it runs out
///
/// `lease.expires_at` is on the store's clock and is never compared with
/// ours; `deadline` is local time just before the grant was requested plus
/// the TTL.
struct Held {
    lease: Lease,
    deadline: DateTime<Utc>,
}

/// Why the chunk loop stopped early
enum Stop {
    LeaseLost,
    Cancelled,
    Failed(OrchestratorError),
}

/// Runs chunked jobs under an exclusive lease with checkpoint/resume
///
/// One cycle: acquire → load checkpoint → (renew?, scan chunk, handle,
/// commit checkpoint)* → reset checkpoint and release on completion.
pub struct BatchOrchestrator {
    leases: LeaseCoordinator,
    checkpoints: CheckpointManager,
    graph: Arc<GraphAdapter>,
    clock: Arc<dyn Clock>,
    holder_id: String,
    settings: CycleSettings,
}

impl BatchOrchestrator {
    pub fn new(
        leases: LeaseCoordinator,
        checkpoints: CheckpointManager,
        graph: Arc<GraphAdapter>,
        holder_id: impl Into<String>,
        settings: CycleSettings,
    ) -> Self {
        Self {
            leases,
            checkpoints,
            clock: graph.clock().clone(),
            graph,
            holder_id: holder_id.into(),
            settings,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Execute one cycle of `handler` (main entry point)
    pub async fn run_cycle(&self, handler: &dyn JobHandler, cancel: &CancellationToken) -> JobRun {
        let job = handler.name().to_string();
        let mut sm = JobStateMachine::new(JobRun::new_pending(&job, &self.holder_id));

        let requested_at = self.clock.now();
        let lease = match self
            .leases
            .acquire(&job, &self.holder_id, self.settings.lease_ttl)
            .await
        {
            Ok(AcquireOutcome::Acquired(lease)) => lease,
            Ok(AcquireOutcome::Busy) => {
                info!(job = %job, holder = %self.holder_id, "another holder runs this job, skipping");
                return settle(sm, |sm| sm.skip());
            }
            Err(err) => {
                let err = OrchestratorError::from(err);
                error!(job = %job, error = %err, "could not acquire lease");
                let category = err.category();
                return settle(sm, |sm| sm.fail(err.to_string(), category));
            }
        };
        if let Err(err) = sm.start(lease.fencing_token) {
            warn!(job = %job, error = %err, "unexpected run state");
        }

        let mut held = Held {
            deadline: requested_at + to_chrono(self.settings.lease_ttl),
            lease,
        };
        let mut failures = 0u64;
        let outcome = self
            .chunk_loop(handler, &mut sm, &mut held, &mut failures, cancel)
            .await;
        let lease = held.lease;

        match outcome {
            Ok(()) => {
                info!(job = %job, failures, "job run complete");
                self.release(&lease).await;
                settle(sm, |sm| sm.finish(failures))
            }
            Err(Stop::LeaseLost) => {
                // the lease may already belong to the next holder: no release
                warn!(job = %job, holder = %self.holder_id, "lease lost, stopping");
                settle(sm, |sm| sm.abort("lease lost".to_string()))
            }
            Err(Stop::Cancelled) => {
                info!(job = %job, "cancelled, checkpoint kept");
                self.release(&lease).await;
                settle(sm, |sm| sm.abort("cancelled".to_string()))
            }
            Err(Stop::Failed(err)) => {
                error!(job = %job, error = %err, "job run failed");
                self.release(&lease).await;
                let category = err.category();
                settle(sm, |sm| sm.fail(err.to_string(), category))
            }
        }
    }

    async fn chunk_loop(
        &self,
        handler: &dyn JobHandler,
        sm: &mut JobStateMachine,
        held: &mut Held,
        failures: &mut u64,
        cancel: &CancellationToken,
    ) -> std::result::Result<(), Stop> {
        let job = handler.name();
        let prepared = handler.prepare().await.map_err(Stop::Failed)?;
        *failures += prepared.failed;

        let mut checkpoint = self.checkpoints.load(job).await.map_err(Stop::Failed)?;
        let mut expected_chunk = self.settings.expected_chunk_duration;
        let mut index = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            self.renew_if_needed(held, expected_chunk).await?;

            let after = checkpoint.cursor.entity_after().map(str::to_string);
            let started = self.clock.now();
            let entities = self
                .graph
                .scan_entities(after.as_deref(), self.settings.chunk_size)
                .await
                .map_err(|e| Stop::Failed(e.into()))?;

            let Some(last) = entities.last() else {
                self.confirm_held(held).await?;
                let token = held.lease.fencing_token;
                if !self.checkpoints.reset(job, token).await.map_err(Stop::Failed)? {
                    return Err(Stop::LeaseLost);
                }
                return Ok(());
            };
            let last_id = last.id.clone();

            let ctx = ChunkContext {
                job_name: job.to_string(),
                after,
                index,
            };
            let report: ChunkReport = handler
                .process_chunk(&ctx, &entities)
                .await
                .map_err(Stop::Failed)?;

            // a chunk that outlived the lease must not be committed: the next
            // holder may already be past our checkpoint
            self.confirm_held(held).await?;
            checkpoint = self
                .checkpoints
                .commit(
                    &checkpoint,
                    Cursor::EntityAfter(last_id),
                    entities.len() as u64,
                    held.lease.fencing_token,
                )
                .await
                .map_err(Stop::Failed)?
                .ok_or(Stop::LeaseLost)?;
            if let Err(err) = sm.record_chunk(entities.len() as u64) {
                warn!(job, error = %err, "unexpected run state");
            }
            *failures += report.failed;
            index += 1;

            let took = elapsed(started, self.clock.now());
            expected_chunk = expected_chunk.max(took);
        }
    }

    /// Renew when the next chunk might not finish inside the lease
    async fn renew_if_needed(&self, held: &mut Held, expected_chunk: Duration) -> std::result::Result<(), Stop> {
        let remaining = elapsed(self.clock.now(), held.deadline);
        if expected_chunk + self.settings.renew_margin < remaining {
            return Ok(());
        }
        let requested_at = self.clock.now();
        match self.leases.renew(&held.lease, self.settings.lease_ttl).await {
            Ok(RenewOutcome::Renewed(renewed)) => {
                held.lease = renewed;
                held.deadline = requested_at + to_chrono(self.settings.lease_ttl);
                Ok(())
            }
            Ok(RenewOutcome::Lost) => Err(Stop::LeaseLost),
            // cannot tell whether the lease survived: stop without writing
            Err(err) => Err(Stop::Failed(err.into())),
        }
    }

    /// The store must still show this exact grant; the local deadline alone
    /// cannot see a takeover judged by the store's clock
    async fn confirm_held(&self, held: &Held) -> std::result::Result<(), Stop> {
        if self.clock.now() >= held.deadline {
            return Err(Stop::LeaseLost);
        }
        match self.leases.current(&held.lease.job_name).await {
            Ok(Some(current)) if current.same_grant(&held.lease) => Ok(()),
            Ok(_) => Err(Stop::LeaseLost),
            Err(err) => Err(Stop::Failed(err.into())),
        }
    }

    async fn release(&self, lease: &Lease) {
        if let Err(err) = self.leases.release(lease).await {
            // expiry frees it eventually
            warn!(job = %lease.job_name, error = %err, "lease release failed");
        }
    }
}

/// `to - from`, zero when negative
fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

fn settle(mut sm: JobStateMachine, transition: impl FnOnce(&mut JobStateMachine) -> Result<()>) -> JobRun {
    if let Err(err) = transition(&mut sm) {
        warn!(error = %err, "unexpected run state");
    }
    sm.into_run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::RunState;
    use async_trait::async_trait;
    use graphrec_core::{CallPolicy, RetryPolicy};
    use graphrec_storage::{
        Attributes, Entity, InMemoryCheckpointStore, InMemoryGraphStore, InMemoryLeaseStore,
        CheckpointStore, LeaseStore, ManualClock,
    };
    use parking_lot::Mutex;

    fn policy() -> CallPolicy {
        CallPolicy::new(RetryPolicy::immediate(1), Duration::from_secs(1))
    }

    fn settings() -> CycleSettings {
        CycleSettings {
            lease_ttl: Duration::from_secs(60),
            renew_margin: Duration::from_secs(5),
            chunk_size: 2,
            expected_chunk_duration: Duration::from_secs(1),
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        leases: InMemoryLeaseStore,
        checkpoints: InMemoryCheckpointStore,
        graph: Arc<GraphAdapter>,
    }

    async fn fixture(entities: usize) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let graph = Arc::new(GraphAdapter::new(
            Arc::new(InMemoryGraphStore::new()),
            clock.clone(),
            policy(),
            3,
        ));
        for i in 0..entities {
            graph
                .upsert_entity("item", &format!("e{:02}", i), Attributes::new())
                .await
                .unwrap();
        }
        Fixture {
            leases: InMemoryLeaseStore::new(clock.clone()),
            checkpoints: InMemoryCheckpointStore::new(),
            clock,
            graph,
        }
    }

    impl Fixture {
        fn orchestrator(&self, holder: &str, leases: Arc<dyn LeaseStore>) -> BatchOrchestrator {
            BatchOrchestrator::new(
                LeaseCoordinator::new(leases, policy()),
                CheckpointManager::new(Arc::new(self.checkpoints.clone()), policy()),
                self.graph.clone(),
                holder,
                settings(),
            )
        }

        fn default_orchestrator(&self, holder: &str) -> BatchOrchestrator {
            self.orchestrator(holder, Arc::new(self.leases.clone()))
        }
    }

    /// Records every entity it sees; can stall the clock or fail entities
    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        fail_ids: Vec<String>,
        stall: Option<(u64, Arc<ManualClock>, Duration)>,
        error_on_chunk: Option<u64>,
    }

    #[async_trait]
    impl JobHandler for Recording {
        fn name(&self) -> &str {
            "test-job"
        }

        async fn process_chunk(&self, ctx: &ChunkContext, entities: &[Entity]) -> Result<ChunkReport> {
            if self.error_on_chunk == Some(ctx.index) {
                return Err(OrchestratorError::chunk_failed("boom"));
            }
            if let Some((chunk, clock, by)) = &self.stall {
                if *chunk == ctx.index {
                    clock.advance(*by);
                }
            }
            let mut report = ChunkReport::default();
            for entity in entities {
                self.seen.lock().push(entity.id.clone());
                if self.fail_ids.contains(&entity.id) {
                    report.failed += 1;
                } else {
                    report.processed += 1;
                }
            }
            Ok(report)
        }
    }

    #[tokio::test]
    async fn test_full_run_completes_and_releases() {
        let f = fixture(5).await;
        let handler = Recording::default();
        let run = f
            .default_orchestrator("a")
            .run_cycle(&handler, &CancellationToken::new())
            .await;

        assert!(matches!(run.state, RunState::Completed { chunks: 3, items: 5, .. }));
        assert_eq!(handler.seen.lock().len(), 5);
        assert!(f.leases.current("test-job").await.unwrap().is_none());
        assert!(f.checkpoints.load("test-job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_busy_lease_skips() {
        let f = fixture(3).await;
        f.leases
            .try_acquire("test-job", "other", Duration::from_secs(60))
            .await
            .unwrap();
        let handler = Recording::default();
        let run = f
            .default_orchestrator("a")
            .run_cycle(&handler, &CancellationToken::new())
            .await;
        assert!(matches!(run.state, RunState::Skipped { .. }));
        assert_eq!(run.exit_code(), 0);
        assert!(handler.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_entity_failures_report_partial() {
        let f = fixture(4).await;
        let handler = Recording {
            fail_ids: vec!["e01".into()],
            ..Recording::default()
        };
        let run = f
            .default_orchestrator("a")
            .run_cycle(&handler, &CancellationToken::new())
            .await;
        assert!(matches!(run.state, RunState::Partial { failures: 1, .. }));
        assert_eq!(run.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_handler_error_fails_and_keeps_earlier_chunks() {
        let f = fixture(6).await;
        let handler = Recording {
            error_on_chunk: Some(1),
            ..Recording::default()
        };
        let run = f
            .default_orchestrator("a")
            .run_cycle(&handler, &CancellationToken::new())
            .await;
        assert!(matches!(run.state, RunState::Failed { .. }));
        assert_eq!(run.exit_code(), 1);

        let checkpoint = f.checkpoints.load("test-job").await.unwrap().unwrap();
        assert_eq!(checkpoint.cursor, Cursor::EntityAfter("e01".into()));
        assert!(f.leases.current("test-job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_releases_and_keeps_checkpoint() {
        let f = fixture(4).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handler = Recording::default();
        let run = f.default_orchestrator("a").run_cycle(&handler, &cancel).await;

        assert!(matches!(run.state, RunState::Aborted { .. }));
        assert!(handler.seen.lock().is_empty());
        assert!(f.leases.current("test-job").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_slow_chunks_trigger_renewal() {
        let f = fixture(6).await;
        // chunk 0 takes 50s of a 60s lease; the loop must renew before chunk 1
        let handler = Recording {
            stall: Some((0, f.clock.clone(), Duration::from_secs(50))),
            ..Recording::default()
        };
        let run = f
            .default_orchestrator("a")
            .run_cycle(&handler, &CancellationToken::new())
            .await;
        assert!(matches!(run.state, RunState::Completed { items: 6, .. }));
    }

    /// Lease store whose renewals always fail, as after a takeover
    struct Stolen(InMemoryLeaseStore);

    #[async_trait]
    impl LeaseStore for Stolen {
        async fn try_acquire(
            &self,
            job_name: &str,
            holder_id: &str,
            ttl: Duration,
        ) -> graphrec_storage::Result<Option<Lease>> {
            self.0.try_acquire(job_name, holder_id, ttl).await
        }
        async fn try_renew(&self, _lease: &Lease, _ttl: Duration) -> graphrec_storage::Result<Option<Lease>> {
            Ok(None)
        }
        async fn release(&self, lease: &Lease) -> graphrec_storage::Result<bool> {
            self.0.release(lease).await
        }
        async fn current(&self, job_name: &str) -> graphrec_storage::Result<Option<Lease>> {
            self.0.current(job_name).await
        }
    }

    #[tokio::test]
    async fn test_lost_renewal_aborts_without_release() {
        let f = fixture(6).await;
        let handler = Recording {
            stall: Some((0, f.clock.clone(), Duration::from_secs(56))),
            ..Recording::default()
        };
        let orchestrator = f.orchestrator("a", Arc::new(Stolen(f.leases.clone())));
        let run = orchestrator.run_cycle(&handler, &CancellationToken::new()).await;

        assert!(matches!(run.state, RunState::Aborted { .. }));
        assert_eq!(handler.seen.lock().len(), 2);
        // still recorded as ours until expiry: nobody released it
        assert!(f.leases.current("test-job").await.unwrap().is_some());
    }
}
