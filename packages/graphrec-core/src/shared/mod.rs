//! Shared module - helpers used by every feature

pub mod retry;

pub use retry::{with_deadline, CallPolicy, RetryPolicy};
