use quarry_error::{DbError, Result};
use serde::{Deserialize, Serialize};

use super::{BlockId, PartitionId};

/// Serializable snapshot of a [`PartitionScheme`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionSchemeProto {
    pub num_partitions: usize,
    /// Blocks in each partition, indexed by partition id.
    pub partitions: Vec<Vec<BlockId>>,
}

/// How a relation's blocks are split into partitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionScheme {
    partitions: Vec<Vec<BlockId>>,
}

impl PartitionScheme {
    pub fn new(num_partitions: usize) -> Result<Self> {
        if num_partitions == 0 {
            return Err(DbError::new("Partition scheme requires at least one partition"));
        }
        Ok(PartitionScheme {
            partitions: vec![Vec::new(); num_partitions],
        })
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn add_block_to_partition(&mut self, block: BlockId, partition: PartitionId) -> Result<()> {
        let num_partitions = self.partitions.len();
        let blocks = self.partitions.get_mut(partition).ok_or_else(|| {
            DbError::new("Partition out of range")
                .with_field("partition", partition)
                .with_field("num_partitions", num_partitions)
        })?;
        blocks.push(block);
        Ok(())
    }

    pub fn blocks_in_partition(&self, partition: PartitionId) -> Result<&[BlockId]> {
        self.partitions
            .get(partition)
            .map(|blocks| blocks.as_slice())
            .ok_or_else(|| DbError::new("Partition out of range").with_field("partition", partition))
    }

    pub fn to_proto(&self) -> PartitionSchemeProto {
        PartitionSchemeProto {
            num_partitions: self.partitions.len(),
            partitions: self.partitions.clone(),
        }
    }

    pub fn proto_is_valid(proto: &PartitionSchemeProto) -> bool {
        proto.num_partitions > 0 && proto.partitions.len() == proto.num_partitions
    }

    pub fn try_from_proto(proto: &PartitionSchemeProto) -> Result<Self> {
        if !Self::proto_is_valid(proto) {
            return Err(DbError::new("Invalid partition scheme snapshot")
                .with_field("num_partitions", proto.num_partitions)
                .with_field("partitions", proto.partitions.len()));
        }
        Ok(PartitionScheme {
            partitions: proto.partitions.clone(),
        })
    }
}
