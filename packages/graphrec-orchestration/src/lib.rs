/*
 * Graphrec Orchestration - leased, checkpointed batch jobs
 *
 * Architecture:
 * - Single-holder leases with fencing tokens (one runner per job)
 * - Chunked scans with per-chunk checkpoints (resume after crash)
 * - Run state machine (Pending -> Running -> terminal)
 * - Interval scheduler for recurring jobs
 */

pub mod bootstrap;
pub mod checkpoint;
pub mod error;
pub mod handler;
pub mod job;
pub mod jobs;
pub mod orchestrator;
pub mod scheduler;

pub use bootstrap::Runtime;
pub use checkpoint::CheckpointManager;
pub use error::{ErrorCategory, OrchestratorError, Result};
pub use handler::{ChunkContext, ChunkReport, JobHandler};
pub use job::{JobRun, JobStateMachine, RunState};
pub use jobs::{CacheWarmJob, RecomputeJob, ReconcileJob};
pub use orchestrator::{BatchOrchestrator, CycleSettings};
pub use scheduler::Scheduler;
