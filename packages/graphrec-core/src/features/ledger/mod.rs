//! Idempotency Ledger
//!
//! Processed-event marks with a retention window. Events redelivered after
//! their mark expired are applied again; config validation keeps the window
//! at least as long as the stream's redelivery delay.

mod marks;

pub use marks::{IdempotencyLedger, MarkOutcome};
