//! Graph Store Adapter
//!
//! Linearizes mutations per entity with read-modify-conditional-write and
//! fans change notifications out after each commit.
//!
//! ```text
//! upsert_* / tombstone ──► GraphStore::conditional_write ──► ChangeNotifier
//!                              ▲        │ Conflict                 ├─► ChangeListener (inline)
//!                              └─ re-read ◄┘                       └─► subscribe() channels
//! ```

mod adapter;
mod notifier;

pub use adapter::GraphAdapter;
pub use notifier::{ChangeListener, ChangeNotifier};
