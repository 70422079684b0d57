pub mod scheduler;
pub mod storage;

use quarry_error::{Result, ResultExt};
use serde::{Deserialize, Serialize};

use self::scheduler::SchedulerConfig;
use self::storage::{HashTableConfig, NumaConfig};

/// Top-level configuration passed to the components at construction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub scheduler: SchedulerConfig,
    pub hash_table: HashTableConfig,
    pub numa: NumaConfig,
}

impl EngineConfig {
    /// Parse a config from JSON. Missing fields take their defaults.
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_json::from_str(s).context("Failed to parse engine config")?;
        config.hash_table.validate()?;
        Ok(config)
    }
}
