//! Configuration system
//!
//! One YAML document (schema v1) with a section per component. Every
//! field has a default, unknown fields are rejected, and loading runs the
//! range and cross-section checks.
//!
//! ```rust,ignore
//! use graphrec_core::config::GraphrecConfig;
//!
//! let config = GraphrecConfig::from_yaml_file("graphrec.yaml")?;
//! let ttl = config.lease.ttl();
//! ```

pub mod error;
pub mod io;
pub mod sections;
pub mod trigger;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use io::{GraphrecConfig, SUPPORTED_VERSIONS};
pub use sections::{
    CacheBackend, CacheConfig, JobScheduleConfig, LeaseConfig, LedgerConfig, OrchestratorConfig,
    RecommendConfig, RetryConfig, SearchBackend, SearchConfig, StoreBackend, StoreConfig,
    StreamConfig,
};
pub use trigger::Trigger;
pub use validation::{CrossSectionValidator, Validatable};
