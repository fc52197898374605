//! Configuration validation
//!
//! Every section implements [`Validatable`]; [`GraphrecConfig`] adds the
//! cross-section checks.

use super::error::{ConfigError, ConfigResult};
use super::io::{GraphrecConfig, SUPPORTED_VERSIONS};

/// Trait for validatable configuration objects
pub trait Validatable {
    /// Returns `Ok(())` if valid, `Err(ConfigError)` with details if invalid.
    fn validate(&self) -> ConfigResult<()>;

    /// Configuration name for error messages
    fn config_name(&self) -> &'static str {
        "Config"
    }
}

impl Validatable for GraphrecConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !SUPPORTED_VERSIONS.contains(&self.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: self.version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        self.store.validate()?;
        self.lease.validate()?;
        self.ledger.validate()?;
        self.stream.validate()?;
        self.search.validate()?;
        self.cache.validate()?;
        self.recommend.validate()?;
        self.orchestrator.validate()?;

        CrossSectionValidator::validate(self)
    }

    fn config_name(&self) -> &'static str {
        "graphrec"
    }
}

/// Checks that span sections
pub struct CrossSectionValidator;

impl CrossSectionValidator {
    pub fn validate(config: &GraphrecConfig) -> ConfigResult<()> {
        // A redelivery arriving after its ledger mark expired would be
        // applied twice.
        if config.ledger.retention_secs < config.stream.max_redelivery_delay_secs {
            return Err(ConfigError::CrossSectionConflict {
                issue: format!(
                    "ledger.retention_secs ({}) is shorter than stream.max_redelivery_delay_secs ({})",
                    config.ledger.retention_secs, config.stream.max_redelivery_delay_secs
                ),
                fix: "raise ledger.retention_secs to at least the stream's redelivery window"
                    .to_string(),
            });
        }

        let expected_chunk_secs = config.orchestrator.expected_chunk_duration_ms.div_ceil(1_000);
        if expected_chunk_secs + config.lease.renew_margin_secs >= config.lease.ttl_secs {
            return Err(ConfigError::CrossSectionConflict {
                issue: format!(
                    "a chunk ({}s) plus renew margin ({}s) does not fit in the lease TTL ({}s)",
                    expected_chunk_secs, config.lease.renew_margin_secs, config.lease.ttl_secs
                ),
                fix: "lower orchestrator.chunk_size or raise lease.ttl_secs".to_string(),
            });
        }

        Ok(())
    }
}
