use serde::{Deserialize, Serialize};

/// Aggregate function computed per group.
///
/// The compact key hash table only stores group keys, passing any handles to
/// it is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregationHandle {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}
