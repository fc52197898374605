//! Domain layer (models, ports, time)

pub mod clock;
pub mod models;
pub mod ports;

pub use clock::{to_chrono, Clock, ManualClock, SystemClock};
pub use models::*;
pub use ports::*;
