//! Infrastructure layer - storage adapters
//!
//! - `memory`: every port, for tests and single-process runs
//! - `sqlite`: graph, lease, ledger and checkpoint stores

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{
    FaultSwitch, InMemoryCacheStore, InMemoryCheckpointStore, InMemoryDeadLetters,
    InMemoryEventLog, InMemoryGraphStore, InMemoryIdempotencyStore, InMemoryLeaseStore,
    InMemorySearchIndex,
};

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteCheckpointStore, SqliteGraphStore, SqliteIdempotencyStore, SqliteLeaseStore};
