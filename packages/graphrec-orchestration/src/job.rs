use crate::error::{ErrorCategory, OrchestratorError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Batch jobs the orchestrator knows how to run
pub const RECOMPUTE_RECOMMENDATIONS: &str = "recompute-recommendations";
pub const RECONCILE_INDEX: &str = "reconcile-index";
pub const WARM_CACHE: &str = "warm-cache";

/// Lifecycle of one orchestrator cycle
///
/// ```text
/// Pending ─► Running ─► Completed | Partial | Failed | Aborted
///    └─────► Skipped
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunState {
    Pending {
        queued_at: DateTime<Utc>,
    },
    Running {
        started_at: DateTime<Utc>,
        fencing_token: u64,
        chunks: u64,
        items: u64,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        chunks: u64,
        items: u64,
    },
    /// Ran to the end but some entities failed
    Partial {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        chunks: u64,
        items: u64,
        failures: u64,
    },
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
        error_category: ErrorCategory,
    },
    /// Lease lost or cancellation; the checkpoint is kept
    Aborted {
        aborted_at: DateTime<Utc>,
        reason: String,
    },
    /// Another holder had the lease
    Skipped {
        skipped_at: DateTime<Utc>,
    },
}

impl RunState {
    pub fn state_name(&self) -> &'static str {
        match self {
            RunState::Pending { .. } => "pending",
            RunState::Running { .. } => "running",
            RunState::Completed { .. } => "completed",
            RunState::Partial { .. } => "partial",
            RunState::Failed { .. } => "failed",
            RunState::Aborted { .. } => "aborted",
            RunState::Skipped { .. } => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Pending { .. } | RunState::Running { .. })
    }

    /// Process exit status for a single-cycle CLI run
    pub fn exit_code(&self) -> i32 {
        match self {
            RunState::Completed { .. } | RunState::Skipped { .. } => 0,
            RunState::Partial { .. } => 2,
            _ => 1,
        }
    }
}

/// One cycle of a named job on this holder
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: Uuid,
    pub job_name: String,
    pub holder_id: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRun {
    pub fn new_pending(job_name: impl Into<String>, holder_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_name: job_name.into(),
            holder_id: holder_id.into(),
            state: RunState::Pending { queued_at: now },
            created_at: now,
            updated_at: now,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.state.exit_code()
    }
}

/// Enforces the legal [`RunState`] transitions
pub struct JobStateMachine {
    run: JobRun,
}

impl JobStateMachine {
    pub fn new(run: JobRun) -> Self {
        Self { run }
    }

    pub fn run(&self) -> &JobRun {
        &self.run
    }

    pub fn into_run(self) -> JobRun {
        self.run
    }

    fn invalid(&self, to: &str) -> OrchestratorError {
        OrchestratorError::InvalidStateTransition {
            from: self.run.state.state_name().to_string(),
            to: to.to_string(),
        }
    }

    fn set(&mut self, state: RunState) {
        self.run.state = state;
        self.run.updated_at = Utc::now();
    }

    /// Transition: PENDING → RUNNING
    pub fn start(&mut self, fencing_token: u64) -> Result<()> {
        match &self.run.state {
            RunState::Pending { .. } => {
                self.set(RunState::Running {
                    started_at: Utc::now(),
                    fencing_token,
                    chunks: 0,
                    items: 0,
                });
                Ok(())
            }
            _ => Err(self.invalid("running")),
        }
    }

    /// Transition: PENDING → SKIPPED
    pub fn skip(&mut self) -> Result<()> {
        match &self.run.state {
            RunState::Pending { .. } => {
                self.set(RunState::Skipped {
                    skipped_at: Utc::now(),
                });
                Ok(())
            }
            _ => Err(self.invalid("skipped")),
        }
    }

    /// Count a committed chunk (RUNNING only)
    pub fn record_chunk(&mut self, items: u64) -> Result<()> {
        match &mut self.run.state {
            RunState::Running {
                chunks,
                items: total,
                ..
            } => {
                *chunks += 1;
                *total += items;
                self.run.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid("record_chunk")),
        }
    }

    /// Transition: RUNNING → COMPLETED, or PARTIAL when `failures > 0`
    pub fn finish(&mut self, failures: u64) -> Result<()> {
        match &self.run.state {
            RunState::Running {
                started_at,
                chunks,
                items,
                ..
            } => {
                let (started_at, chunks, items) = (*started_at, *chunks, *items);
                let completed_at = Utc::now();
                self.set(if failures == 0 {
                    RunState::Completed {
                        started_at,
                        completed_at,
                        chunks,
                        items,
                    }
                } else {
                    RunState::Partial {
                        started_at,
                        completed_at,
                        chunks,
                        items,
                        failures,
                    }
                });
                Ok(())
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// Transition: RUNNING → FAILED
    pub fn fail(&mut self, error: String, error_category: ErrorCategory) -> Result<()> {
        match &self.run.state {
            RunState::Running { started_at, .. } => {
                let started_at = *started_at;
                self.set(RunState::Failed {
                    started_at,
                    failed_at: Utc::now(),
                    error,
                    error_category,
                });
                Ok(())
            }
            // lease acquisition itself failed
            RunState::Pending { queued_at } => {
                let started_at = *queued_at;
                self.set(RunState::Failed {
                    started_at,
                    failed_at: Utc::now(),
                    error,
                    error_category,
                });
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }

    /// Transition: RUNNING → ABORTED
    pub fn abort(&mut self, reason: String) -> Result<()> {
        match &self.run.state {
            RunState::Running { .. } => {
                self.set(RunState::Aborted {
                    aborted_at: Utc::now(),
                    reason,
                });
                Ok(())
            }
            _ => Err(self.invalid("aborted")),
        }
    }
}
