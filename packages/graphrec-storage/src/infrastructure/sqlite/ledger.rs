//! SQLite idempotency ledger

use async_trait::async_trait;
use rusqlite::params;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{open_connection, to_millis, SharedConnection};
use crate::domain::clock::{to_chrono, Clock, SystemClock};
use crate::domain::ports::IdempotencyStore;
use crate::error::Result;

#[derive(Clone)]
pub struct SqliteIdempotencyStore {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
}

impl SqliteIdempotencyStore {
    pub fn open(db_path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self {
            conn: open_connection(Some(db_path.as_ref()))?,
            clock,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Result<Self> {
        let store = Self {
            conn: open_connection(None)?,
            clock,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS processed_events (
                event_id TEXT PRIMARY KEY,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processed_events_expiry
                ON processed_events(expires_at);",
        )?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyStore for SqliteIdempotencyStore {
    async fn insert_if_absent(&self, event_id: &str, retention: Duration) -> Result<bool> {
        let now = self.clock.now();
        let expires_at = to_millis(now + to_chrono(retention));
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT INTO processed_events (event_id, expires_at) VALUES (?1, ?2)
             ON CONFLICT(event_id) DO UPDATE SET expires_at = excluded.expires_at
             WHERE processed_events.expires_at <= ?3",
            params![event_id, expires_at, to_millis(now)],
        )?;
        Ok(changed == 1)
    }

    async fn remove(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "DELETE FROM processed_events WHERE event_id = ?1",
            params![event_id],
        )?;
        Ok(changed > 0)
    }

    async fn contains(&self, event_id: &str) -> Result<bool> {
        let now = to_millis(self.clock.now());
        let conn = self.conn.lock();
        let found: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = ?1 AND expires_at > ?2)",
            params![event_id, now],
            |row| row.get(0),
        )?;
        Ok(found)
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = to_millis(self.clock.now());
        let conn = self.conn.lock();
        let purged = conn.execute(
            "DELETE FROM processed_events WHERE expires_at <= ?1",
            params![now],
        )?;
        Ok(purged)
    }
}
