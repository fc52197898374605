use graphrec_core::CallPolicy;
use graphrec_storage::{Checkpoint, CheckpointStore, Cursor};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;

/// Per-job resume positions on top of a [`CheckpointStore`]
#[derive(Clone)]
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    policy: CallPolicy,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, policy: CallPolicy) -> Self {
        Self { store, policy }
    }

    /// Stored checkpoint, or a fresh one at [`Cursor::Start`]
    pub async fn load(&self, job_name: &str) -> Result<Checkpoint> {
        let stored = self
            .policy
            .call("checkpoint.load", || self.store.load(job_name))
            .await?;
        Ok(match stored {
            Some(checkpoint) => {
                debug!(
                    job = job_name,
                    cursor = ?checkpoint.cursor,
                    chunks = checkpoint.chunks_committed,
                    "resuming from checkpoint"
                );
                checkpoint
            }
            None => Checkpoint::start(job_name),
        })
    }

    /// Persist the position after a committed chunk, written under
    /// `fencing_token`. None when a newer holder has already written.
    pub async fn commit(
        &self,
        current: &Checkpoint,
        cursor: Cursor,
        items: u64,
        fencing_token: u64,
    ) -> Result<Option<Checkpoint>> {
        let next = current.clone().fenced(fencing_token).advance(cursor, items);
        let written = self
            .policy
            .call("checkpoint.save", || self.store.save(&next))
            .await?;
        if !written {
            warn!(job = %next.job_name, fencing_token, "checkpoint write fenced out");
            return Ok(None);
        }
        Ok(Some(next))
    }

    /// Forget the position after a completed run. False when a newer holder
    /// owns the checkpoint.
    pub async fn reset(&self, job_name: &str, fencing_token: u64) -> Result<bool> {
        let cleared = self
            .policy
            .call("checkpoint.clear", || self.store.clear(job_name, fencing_token))
            .await?;
        if !cleared {
            warn!(job = job_name, fencing_token, "checkpoint clear fenced out");
        }
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphrec_core::RetryPolicy;
    use graphrec_storage::InMemoryCheckpointStore;
    use std::time::Duration;

    fn manager() -> CheckpointManager {
        CheckpointManager::new(
            Arc::new(InMemoryCheckpointStore::new()),
            CallPolicy::new(RetryPolicy::immediate(1), Duration::from_secs(1)),
        )
    }

    #[tokio::test]
    async fn test_missing_checkpoint_starts_at_beginning() {
        let checkpoint = manager().load("reconcile-index").await.unwrap();
        assert_eq!(checkpoint.cursor, Cursor::Start);
        assert_eq!(checkpoint.chunks_committed, 0);
    }

    #[tokio::test]
    async fn test_commit_then_reset() {
        let mgr = manager();
        let start = mgr.load("warm-cache").await.unwrap();
        let first = mgr
            .commit(&start, Cursor::EntityAfter("e100".into()), 100, 1)
            .await
            .unwrap()
            .unwrap();
        mgr.commit(&first, Cursor::EntityAfter("e200".into()), 100, 1)
            .await
            .unwrap()
            .unwrap();

        let loaded = mgr.load("warm-cache").await.unwrap();
        assert_eq!(loaded.cursor.entity_after(), Some("e200"));
        assert_eq!((loaded.chunks_committed, loaded.items_processed), (2, 200));
        assert_eq!(loaded.fencing_token, 1);

        assert!(mgr.reset("warm-cache", 1).await.unwrap());
        assert_eq!(mgr.load("warm-cache").await.unwrap().cursor, Cursor::Start);
    }

    #[tokio::test]
    async fn test_resumed_checkpoint_takes_new_token() {
        let mgr = manager();
        let start = mgr.load("warm-cache").await.unwrap();
        let old = mgr
            .commit(&start, Cursor::EntityAfter("e100".into()), 100, 1)
            .await
            .unwrap()
            .unwrap();

        // holder 2 resumes from holder 1's position
        let resumed = mgr.load("warm-cache").await.unwrap();
        mgr.commit(&resumed, Cursor::EntityAfter("e200".into()), 100, 2)
            .await
            .unwrap()
            .unwrap();

        // holder 1 wakes up late: its write and its reset are refused
        let late = mgr
            .commit(&old, Cursor::EntityAfter("e300".into()), 100, 1)
            .await
            .unwrap();
        assert!(late.is_none());
        assert!(!mgr.reset("warm-cache", 1).await.unwrap());

        let loaded = mgr.load("warm-cache").await.unwrap();
        assert_eq!(loaded.cursor.entity_after(), Some("e200"));
        assert_eq!(loaded.fencing_token, 2);
    }
}
