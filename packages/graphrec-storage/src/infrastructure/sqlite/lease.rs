//! SQLite lease store
//!
//! Acquisition is one `INSERT .. ON CONFLICT DO UPDATE .. WHERE` statement,
//! so two processes sharing the database file cannot both win.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::{from_millis, open_connection, to_millis, SharedConnection};
use crate::domain::clock::{to_chrono, Clock, SystemClock};
use crate::domain::models::Lease;
use crate::domain::ports::LeaseStore;
use crate::error::Result;

#[derive(Clone)]
pub struct SqliteLeaseStore {
    conn: SharedConnection,
    clock: Arc<dyn Clock>,
}

impl SqliteLeaseStore {
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
        conn.execute(
            "CREATE TABLE IF NOT EXISTS leases (
                job_name TEXT PRIMARY KEY,
                holder_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                fencing_token INTEGER NOT NULL
            )",
            [],
        )?;
        Ok(())
    }

    fn read_lease(conn: &rusqlite::Connection, job_name: &str) -> Result<Option<Lease>> {
        let lease = conn
            .query_row(
                "SELECT job_name, holder_id, expires_at, fencing_token
                 FROM leases WHERE job_name = ?1",
                params![job_name],
                |row| {
                    Ok(Lease {
                        job_name: row.get(0)?,
                        holder_id: row.get(1)?,
                        expires_at: from_millis(row.get(2)?),
                        fencing_token: row.get::<_, i64>(3)? as u64,
                    })
                },
            )
            .optional()?;
        Ok(lease)
    }
}

#[async_trait]
impl LeaseStore for SqliteLeaseStore {
    async fn try_acquire(
        &self,
        job_name: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let now = to_millis(self.clock.now());
        let expires_at = to_millis(self.clock.now() + to_chrono(ttl));
        let conn = self.conn.lock();

        // Right-hand sides see the old row, so the CASE compares against the
        // previous holder.
        let changed = conn.execute(
            "INSERT INTO leases (job_name, holder_id, expires_at, fencing_token)
             VALUES (?1, ?2, ?3, 1)
             ON CONFLICT(job_name) DO UPDATE SET
                fencing_token = CASE
                    WHEN leases.holder_id = excluded.holder_id AND leases.expires_at > ?4
                    THEN leases.fencing_token
                    ELSE leases.fencing_token + 1
                END,
                holder_id = excluded.holder_id,
                expires_at = excluded.expires_at
             WHERE leases.expires_at <= ?4 OR leases.holder_id = excluded.holder_id",
            params![job_name, holder_id, expires_at, now],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        Self::read_lease(&conn, job_name)
    }

    async fn try_renew(&self, lease: &Lease, ttl: Duration) -> Result<Option<Lease>> {
        let now = to_millis(self.clock.now());
        let expires_at = to_millis(self.clock.now() + to_chrono(ttl));
        let conn = self.conn.lock();

        let changed = conn.execute(
            "UPDATE leases SET expires_at = ?1
             WHERE job_name = ?2 AND holder_id = ?3 AND fencing_token = ?4 AND expires_at > ?5",
            params![
                expires_at,
                lease.job_name,
                lease.holder_id,
                lease.fencing_token as i64,
                now
            ],
        )?;

        if changed == 0 {
            return Ok(None);
        }
        Self::read_lease(&conn, &lease.job_name)
    }

    async fn release(&self, lease: &Lease) -> Result<bool> {
        let now = to_millis(self.clock.now());
        let conn = self.conn.lock();

        // Expire in place; the row keeps the fencing token counting
        let changed = conn.execute(
            "UPDATE leases SET expires_at = ?1
             WHERE job_name = ?2 AND holder_id = ?3 AND fencing_token = ?4 AND expires_at > ?1",
            params![
                now,
                lease.job_name,
                lease.holder_id,
                lease.fencing_token as i64
            ],
        )?;
        Ok(changed > 0)
    }

    async fn current(&self, job_name: &str) -> Result<Option<Lease>> {
        let now = self.clock.now();
        let conn = self.conn.lock();
        Ok(Self::read_lease(&conn, job_name)?.filter(|lease| lease.is_valid_at(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;

    const TTL: Duration = Duration::from_secs(30);

    fn store() -> (Arc<ManualClock>, SqliteLeaseStore) {
        let clock = Arc::new(ManualClock::default());
        let store = SqliteLeaseStore::in_memory_with_clock(clock.clone()).unwrap();
        (clock, store)
    }

    #[tokio::test]
    async fn test_acquire_busy_then_takeover() {
        let (clock, store) = store();
        let a = store.try_acquire("job", "A", TTL).await.unwrap().unwrap();
        assert_eq!(a.fencing_token, 1);
        assert!(store.try_acquire("job", "B", TTL).await.unwrap().is_none());

        clock.advance(Duration::from_secs(31));
        let b = store.try_acquire("job", "B", TTL).await.unwrap().unwrap();
        assert_eq!(b.holder_id, "B");
        assert_eq!(b.fencing_token, 2);
        assert!(store.try_renew(&a, TTL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_same_holder_keeps_token() {
        let (clock, store) = store();
        let first = store.try_acquire("job", "A", TTL).await.unwrap().unwrap();
        clock.advance(Duration::from_secs(5));
        let again = store.try_acquire("job", "A", TTL).await.unwrap().unwrap();
        assert_eq!(again.fencing_token, first.fencing_token);
        assert!(again.expires_at > first.expires_at);
    }

    #[tokio::test]
    async fn test_release_is_noop_when_not_held() {
        let (_clock, store) = store();
        let lease = store.try_acquire("job", "A", TTL).await.unwrap().unwrap();
        assert!(store.release(&lease).await.unwrap());
        assert!(!store.release(&lease).await.unwrap());
        assert!(store.current("job").await.unwrap().is_none());

        let next = store.try_acquire("job", "B", TTL).await.unwrap().unwrap();
        assert_eq!(next.fencing_token, 2);
    }

    #[tokio::test]
    async fn test_shared_file_single_winner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.db");
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let first = SqliteLeaseStore::open(&path, clock.clone()).unwrap();
        let second = SqliteLeaseStore::open(&path, clock).unwrap();

        let a = first.try_acquire("job", "A", TTL).await.unwrap();
        let b = second.try_acquire("job", "B", TTL).await.unwrap();
        assert!(a.is_some());
        assert!(b.is_none());
        assert_eq!(second.current("job").await.unwrap().unwrap().holder_id, "A");
    }
}
