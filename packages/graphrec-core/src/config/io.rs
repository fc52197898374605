//! Configuration I/O (YAML schema v1)

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, ConfigResult};
use super::sections::*;
use super::validation::Validatable;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Root configuration (YAML schema v1)
///
/// ```yaml
/// version: 1
/// store:
///   backend: sqlite
///   sqlite_path: /var/lib/graphrec/graph.db
/// cache:
///   high_value_types: [user]
/// orchestrator:
///   jobs:
///     - name: recompute-recommendations
///       trigger: "@hourly"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GraphrecConfig {
    /// Schema version (always 1 for v1)
    pub version: u32,
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub ledger: LedgerConfig,
    pub stream: StreamConfig,
    pub search: SearchConfig,
    pub cache: CacheConfig,
    pub recommend: RecommendConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for GraphrecConfig {
    fn default() -> Self {
        Self {
            version: 1,
            store: StoreConfig::default(),
            lease: LeaseConfig::default(),
            ledger: LedgerConfig::default(),
            stream: StreamConfig::default(),
            search: SearchConfig::default(),
            cache: CacheConfig::default(),
            recommend: RecommendConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl GraphrecConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        if raw.get("version").is_none() {
            return Err(ConfigError::MissingVersion);
        }

        let config: GraphrecConfig = serde_yaml::from_value(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}
