use quarry_error::{DbError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the compact key hash table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashTableConfig {
    /// Ratio of slots to expected entries.
    pub load_factor: f64,
    /// Number of workers participating in parallel initialization and
    /// finalization.
    pub num_workers: usize,
    /// Bytes of slot/bucket memory handled by a single initialization
    /// partition.
    pub init_block_size: usize,
    /// Upper bound on the number of initialization partitions.
    pub max_init_partitions: usize,
    /// Minimum number of entries in a single initialization partition.
    pub init_min_partition_length: usize,
    /// Minimum number of buckets in a single finalization partition.
    pub final_min_partition_length: usize,
}

impl Default for HashTableConfig {
    fn default() -> Self {
        HashTableConfig {
            load_factor: 2.0,
            num_workers: num_cpus::get(),
            init_block_size: 4 * 1024 * 1024,
            max_init_partitions: 80,
            init_min_partition_length: 256 * 1024,
            final_min_partition_length: 4 * 1024,
        }
    }
}

impl HashTableConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.load_factor >= 1.0) {
            return Err(DbError::new("Hash table load factor must be at least 1.0")
                .with_field("load_factor", self.load_factor));
        }
        if self.num_workers == 0 {
            return Err(DbError::new("Hash table requires at least one worker"));
        }
        if self.init_block_size == 0
            || self.max_init_partitions == 0
            || self.init_min_partition_length == 0
            || self.final_min_partition_length == 0
        {
            return Err(DbError::new("Hash table partitioning sizes must be non-zero"));
        }
        Ok(())
    }
}

/// NUMA related configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NumaConfig {
    /// Explicit number of NUMA nodes. Detected from the OS when not set.
    pub num_numa_nodes: Option<usize>,
}
