//! SQLite backends for the durable ports
//!
//! Each store owns one connection behind a mutex and creates its tables on
//! open. Timestamps are stored as Unix milliseconds.

mod checkpoint;
mod graph;
mod lease;
mod ledger;

pub use checkpoint::SqliteCheckpointStore;
pub use graph::SqliteGraphStore;
pub use lease::SqliteLeaseStore;
pub use ledger::SqliteIdempotencyStore;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;

pub(crate) type SharedConnection = Arc<Mutex<Connection>>;

/// Open a file database (or `:memory:` when `path` is None)
pub(crate) fn open_connection(path: Option<&Path>) -> Result<SharedConnection> {
    let conn = match path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    // WAL lets several store connections share one file
    if path.is_some() {
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
    }
    Ok(Arc::new(Mutex::new(conn)))
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
