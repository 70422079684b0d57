use hashbrown::HashMap;
use quarry_error::{DbError, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::partition_scheme::{PartitionScheme, PartitionSchemeProto};
use super::topology::detect_num_numa_nodes;
use super::{BlockId, PartitionId};
use crate::config::storage::NumaConfig;

/// Placement of a single block in a [`NumaPlacementSchemeProto`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockNumaNodeEntry {
    pub block_id: BlockId,
    pub numa_node: usize,
}

/// Serializable snapshot of a [`NumaPlacementScheme`].
///
/// Doesn't include the number of partitions, that comes from the relation's
/// partition scheme snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaPlacementSchemeProto {
    pub num_numa_nodes: usize,
    pub block_to_numa_node_map: Vec<BlockNumaNodeEntry>,
}

/// Maps partitions and blocks of a relation to NUMA nodes.
///
/// Partitions are assigned to nodes round-robin when the scheme is created.
/// Blocks are registered as they're allocated, and never move.
///
/// Block registration needs `&mut self`, callers sharing a scheme across
/// threads need to synchronize externally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaPlacementScheme {
    num_numa_nodes: usize,
    partition_to_numa_node: Vec<usize>,
    block_to_numa_node: HashMap<BlockId, usize>,
}

impl NumaPlacementScheme {
    /// Create a placement scheme using the configured (or detected) number of
    /// NUMA nodes.
    pub fn new(num_partitions: usize, config: &NumaConfig) -> Result<Self> {
        let num_numa_nodes = config
            .num_numa_nodes
            .unwrap_or_else(detect_num_numa_nodes);
        Self::with_num_numa_nodes(num_partitions, num_numa_nodes)
    }

    pub fn with_num_numa_nodes(num_partitions: usize, num_numa_nodes: usize) -> Result<Self> {
        if num_numa_nodes == 0 {
            return Err(DbError::new("Number of NUMA nodes must be non-zero"));
        }

        let partition_to_numa_node = (0..num_partitions)
            .map(|partition| partition % num_numa_nodes)
            .collect();

        debug!(num_partitions, num_numa_nodes, "created numa placement scheme");

        Ok(NumaPlacementScheme {
            num_numa_nodes,
            partition_to_numa_node,
            block_to_numa_node: HashMap::new(),
        })
    }

    pub fn num_numa_nodes(&self) -> usize {
        self.num_numa_nodes
    }

    pub fn num_partitions(&self) -> usize {
        self.partition_to_numa_node.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.block_to_numa_node.len()
    }

    /// Record the NUMA node a newly allocated block lives on.
    ///
    /// Each block can only be registered once.
    pub fn add_block_to_numa_node_map(&mut self, block: BlockId, numa_node: usize) -> Result<()> {
        if numa_node >= self.num_numa_nodes {
            return Err(DbError::new("NUMA node out of range")
                .with_field("block", block)
                .with_field("numa_node", numa_node)
                .with_field("num_numa_nodes", self.num_numa_nodes));
        }
        if let Some(existing) = self.block_to_numa_node.get(&block) {
            return Err(DbError::new("Block already has a NUMA node mapping")
                .with_field("block", block)
                .with_field("existing_numa_node", existing)
                .with_field("numa_node", numa_node));
        }
        self.block_to_numa_node.insert(block, numa_node);
        Ok(())
    }

    pub fn numa_node_for_partition(&self, partition: PartitionId) -> Result<usize> {
        self.partition_to_numa_node
            .get(partition)
            .copied()
            .ok_or_else(|| {
                DbError::new("Partition out of range")
                    .with_field("partition", partition)
                    .with_field("num_partitions", self.num_partitions())
            })
    }

    pub fn numa_node_for_block(&self, block: BlockId) -> Result<usize> {
        self.block_to_numa_node
            .get(&block)
            .copied()
            .ok_or_else(|| DbError::new("Block has no NUMA node mapping").with_field("block", block))
    }

    pub fn has_block(&self, block: BlockId) -> bool {
        self.block_to_numa_node.contains_key(&block)
    }

    /// Blocks placed on a node, in ascending block id order.
    pub fn blocks_on_numa_node(&self, numa_node: usize) -> Vec<BlockId> {
        let mut blocks: Vec<_> = self
            .block_to_numa_node
            .iter()
            .filter(|(_, node)| **node == numa_node)
            .map(|(block, _)| *block)
            .collect();
        blocks.sort_unstable();
        blocks
    }

    /// Snapshot the scheme. Block entries are ordered by block id.
    pub fn to_proto(&self) -> NumaPlacementSchemeProto {
        let mut block_to_numa_node_map: Vec<_> = self
            .block_to_numa_node
            .iter()
            .map(|(&block_id, &numa_node)| BlockNumaNodeEntry {
                block_id,
                numa_node,
            })
            .collect();
        block_to_numa_node_map.sort_unstable();

        NumaPlacementSchemeProto {
            num_numa_nodes: self.num_numa_nodes,
            block_to_numa_node_map,
        }
    }

    /// Check that a snapshot can be used to rebuild a scheme.
    pub fn proto_is_valid(proto: &NumaPlacementSchemeProto) -> bool {
        if proto.num_numa_nodes == 0 {
            return false;
        }
        let mut seen = hashbrown::HashSet::with_capacity(proto.block_to_numa_node_map.len());
        proto
            .block_to_numa_node_map
            .iter()
            .all(|entry| entry.numa_node < proto.num_numa_nodes && seen.insert(entry.block_id))
    }

    /// Rebuild a scheme from its snapshot along with the relation's partition
    /// scheme snapshot.
    pub fn try_from_proto(
        proto: &NumaPlacementSchemeProto,
        partition_scheme_proto: &PartitionSchemeProto,
    ) -> Result<Self> {
        if !Self::proto_is_valid(proto) {
            return Err(DbError::new("Invalid NUMA placement scheme snapshot")
                .with_field("num_numa_nodes", proto.num_numa_nodes));
        }
        let partition_scheme = PartitionScheme::try_from_proto(partition_scheme_proto)?;

        let mut scheme =
            Self::with_num_numa_nodes(partition_scheme.num_partitions(), proto.num_numa_nodes)?;
        for entry in &proto.block_to_numa_node_map {
            scheme.add_block_to_numa_node_map(entry.block_id, entry.numa_node)?;
        }

        Ok(scheme)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_round_robin() {
        let scheme = NumaPlacementScheme::new(64, &NumaConfig::default()).unwrap();
        assert_eq!(64, scheme.num_partitions());
        for partition in 0..64 {
            assert_eq!(
                partition % scheme.num_numa_nodes(),
                scheme.numa_node_for_partition(partition).unwrap()
            );
        }
        scheme.numa_node_for_partition(64).unwrap_err();
    }

    #[test]
    fn explicit_node_count() {
        let config = NumaConfig {
            num_numa_nodes: Some(3),
        };
        let scheme = NumaPlacementScheme::new(7, &config).unwrap();
        assert_eq!(3, scheme.num_numa_nodes());
        let nodes: Vec<_> = (0..7)
            .map(|p| scheme.numa_node_for_partition(p).unwrap())
            .collect();
        assert_eq!(vec![0, 1, 2, 0, 1, 2, 0], nodes);

        NumaPlacementScheme::with_num_numa_nodes(4, 0).unwrap_err();
    }

    #[test]
    fn block_mappings() {
        let mut scheme = NumaPlacementScheme::with_num_numa_nodes(8, 2).unwrap();
        scheme.add_block_to_numa_node_map(5, 1).unwrap();
        scheme.add_block_to_numa_node_map(3, 1).unwrap();
        scheme.add_block_to_numa_node_map(4, 0).unwrap();

        assert_eq!(3, scheme.num_blocks());
        assert_eq!(1, scheme.numa_node_for_block(5).unwrap());
        assert_eq!(vec![3, 5], scheme.blocks_on_numa_node(1));
        assert_eq!(vec![4], scheme.blocks_on_numa_node(0));

        // Duplicate block, even with the same node.
        scheme.add_block_to_numa_node_map(5, 1).unwrap_err();
        // Node out of range.
        scheme.add_block_to_numa_node_map(6, 2).unwrap_err();
        assert!(!scheme.has_block(6));
        scheme.numa_node_for_block(6).unwrap_err();
    }

    #[test]
    fn snapshot_round_trip() {
        let mut scheme = NumaPlacementScheme::with_num_numa_nodes(64, 4).unwrap();
        let partition_proto = PartitionScheme::new(64).unwrap().to_proto();
        for block in 0..10 {
            scheme.add_block_to_numa_node_map(block, (block as usize * 3) % 4).unwrap();
        }

        // Goes through the serialized form.
        let json = serde_json::to_string(&scheme.to_proto()).unwrap();
        let proto: NumaPlacementSchemeProto = serde_json::from_str(&json).unwrap();
        assert!(NumaPlacementScheme::proto_is_valid(&proto));

        let rebuilt = NumaPlacementScheme::try_from_proto(&proto, &partition_proto).unwrap();
        assert_eq!(scheme.num_numa_nodes(), rebuilt.num_numa_nodes());
        assert_eq!(scheme.num_partitions(), rebuilt.num_partitions());
        for partition in 0..64 {
            assert_eq!(
                scheme.numa_node_for_partition(partition).unwrap(),
                rebuilt.numa_node_for_partition(partition).unwrap()
            );
        }
        for block in 0..10 {
            assert_eq!(
                scheme.numa_node_for_block(block).unwrap(),
                rebuilt.numa_node_for_block(block).unwrap()
            );
        }
        assert_eq!(scheme, rebuilt);
    }

    #[test]
    fn invalid_snapshots() {
        let partition_proto = PartitionScheme::new(4).unwrap().to_proto();

        let zero_nodes = NumaPlacementSchemeProto {
            num_numa_nodes: 0,
            block_to_numa_node_map: Vec::new(),
        };
        assert!(!NumaPlacementScheme::proto_is_valid(&zero_nodes));

        let out_of_range = NumaPlacementSchemeProto {
            num_numa_nodes: 2,
            block_to_numa_node_map: vec![BlockNumaNodeEntry {
                block_id: 1,
                numa_node: 2,
            }],
        };
        assert!(!NumaPlacementScheme::proto_is_valid(&out_of_range));
        NumaPlacementScheme::try_from_proto(&out_of_range, &partition_proto).unwrap_err();

        let duplicate = NumaPlacementSchemeProto {
            num_numa_nodes: 2,
            block_to_numa_node_map: vec![
                BlockNumaNodeEntry {
                    block_id: 1,
                    numa_node: 0,
                },
                BlockNumaNodeEntry {
                    block_id: 1,
                    numa_node: 1,
                },
            ],
        };
        assert!(!NumaPlacementScheme::proto_is_valid(&duplicate));
    }
}
