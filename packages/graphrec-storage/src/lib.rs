//! graphrec-storage - domain models and store ports
//!
//! Everything the recommendation core shares with the outside world goes
//! through the port traits in [`domain::ports`]:
//!
//! | Port | Backends |
//! |------|----------|
//! | `GraphStore` | in-memory, SQLite |
//! | `LeaseStore` | in-memory, SQLite |
//! | `IdempotencyStore` | in-memory, SQLite |
//! | `CheckpointStore` | in-memory, SQLite |
//! | `SearchIndex` | in-memory (Tantivy lives in `graphrec-core`) |
//! | `CacheStore` | in-memory (moka lives in `graphrec-core`) |
//! | `EventSource` / `DeadLetterSink` | in-memory |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use graphrec_storage::{InMemoryLeaseStore, LeaseStore, SystemClock};
//!
//! let leases = InMemoryLeaseStore::new(Arc::new(SystemClock));
//! if let Some(lease) = leases.try_acquire("recompute", "node-1", ttl).await? {
//!     // exclusive until lease.expires_at
//! }
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    to_chrono, AttrValue, Attributes, CacheEntry, CacheStore, ChangeNotification, Checkpoint,
    CheckpointStore, Clock, ConditionalWrite, Cursor, DeadLetter, DeadLetterSink, Entity,
    EntityId, EventId, EventSource, GraphStore, IdempotencyStore, IndexDocument, Lease,
    LeaseStore, ManualClock, MutationKind, RawEvent, Relationship, RelationshipKey, SearchIndex,
    SystemClock, WriteOutcome, UNKNOWN_ENTITY_TYPE,
};

pub use infrastructure::*;
