//! Relation level metadata used by the scheduler for locality decisions.

pub mod numa_placement;
pub mod partition_scheme;
pub mod topology;

/// Identifier for a storage block.
pub type BlockId = u64;

/// Identifier for a partition within a relation.
pub type PartitionId = usize;
