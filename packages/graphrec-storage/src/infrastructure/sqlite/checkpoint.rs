//! SQLite checkpoint store

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::{from_millis, open_connection, to_millis, SharedConnection};
use crate::domain::models::Checkpoint;
use crate::domain::ports::CheckpointStore;
use crate::error::Result;

#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: SharedConnection,
}

impl SqliteCheckpointStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            conn: open_connection(Some(db_path.as_ref()))?,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: open_connection(None)?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                job_name TEXT PRIMARY KEY,
                cursor TEXT NOT NULL,
                chunks_committed INTEGER NOT NULL,
                items_processed INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                fencing_token INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, job_name: &str) -> Result<Option<Checkpoint>> {
        let row: Option<(String, String, i64, i64, i64, i64)> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT job_name, cursor, chunks_committed, items_processed, updated_at, fencing_token
                 FROM checkpoints WHERE job_name = ?1",
                params![job_name],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?
        };

        row.map(|(job_name, cursor, chunks, items, updated_at, token)| {
            Ok(Checkpoint {
                job_name,
                cursor: serde_json::from_str(&cursor)?,
                chunks_committed: chunks as u64,
                items_processed: items as u64,
                updated_at: from_millis(updated_at),
                fencing_token: token as u64,
            })
        })
        .transpose()
    }

    async fn save(&self, checkpoint: &Checkpoint) -> Result<bool> {
        let cursor = serde_json::to_string(&checkpoint.cursor)?;
        let conn = self.conn.lock();
        let written = conn.execute(
            "INSERT INTO checkpoints
                (job_name, cursor, chunks_committed, items_processed, updated_at, fencing_token)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(job_name) DO UPDATE SET
                cursor = excluded.cursor,
                chunks_committed = excluded.chunks_committed,
                items_processed = excluded.items_processed,
                updated_at = excluded.updated_at,
                fencing_token = excluded.fencing_token
             WHERE excluded.fencing_token >= checkpoints.fencing_token",
            params![
                checkpoint.job_name,
                cursor,
                checkpoint.chunks_committed as i64,
                checkpoint.items_processed as i64,
                to_millis(checkpoint.updated_at),
                checkpoint.fencing_token as i64,
            ],
        )?;
        Ok(written == 1)
    }

    async fn clear(&self, job_name: &str, fencing_token: u64) -> Result<bool> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM checkpoints WHERE job_name = ?1 AND fencing_token <= ?2",
            params![job_name, fencing_token as i64],
        )?;
        let newer: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM checkpoints WHERE job_name = ?1)",
            params![job_name],
            |row| row.get(0),
        )?;
        Ok(!newer)
    }
}
