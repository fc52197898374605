//! Lock Coordinator
//!
//! Named leases that give one instance exclusive use of a recurring job.
//! Expiry is judged by the lease store's clock, never the caller's.

mod coordinator;

pub use coordinator::{AcquireOutcome, LeaseCoordinator, RenewOutcome};
