use graphrec_core::config::Trigger;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::handler::JobHandler;
use crate::job::JobRun;
use crate::orchestrator::BatchOrchestrator;

struct ScheduledJob {
    handler: Arc<dyn JobHandler>,
    trigger: Trigger,
}

/// Runs every registered job on its trigger until cancelled
///
/// Jobs tick independently; a tick that arrives while the previous cycle
/// of the same job is still running is skipped.
pub struct Scheduler {
    orchestrator: Arc<BatchOrchestrator>,
    jobs: Vec<ScheduledJob>,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<BatchOrchestrator>) -> Self {
        Self {
            orchestrator,
            jobs: Vec::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>, trigger: Trigger) {
        info!(job = handler.name(), trigger = %trigger, "job scheduled");
        self.jobs.push(ScheduledJob { handler, trigger });
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Returns once `cancel` fires and every in-flight cycle has stopped
    pub async fn run(self, cancel: CancellationToken) {
        let mut tasks = JoinSet::new();
        for job in self.jobs {
            let orchestrator = self.orchestrator.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let mut ticks = tokio::time::interval(job.trigger.period());
                ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticks.tick() => {}
                    }
                    let run = orchestrator.run_cycle(job.handler.as_ref(), &cancel).await;
                    log_run(&run);
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "scheduled job task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

fn log_run(run: &JobRun) {
    match run.exit_code() {
        0 => info!(job = %run.job_name, state = run.state.state_name(), "cycle finished"),
        _ => warn!(job = %run.job_name, state = run.state.state_name(), "cycle finished"),
    }
}
