use serde::{Deserialize, Serialize};

use super::{OperatorIndex, PriorityLevel, QueryId};

/// Scheduling relevant information about a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryHandle {
    pub query_id: QueryId,
    pub priority: PriorityLevel,
    /// Estimated peak memory usage of the query.
    pub estimated_max_memory_bytes: u64,
}

impl QueryHandle {
    pub fn new(query_id: QueryId, priority: PriorityLevel) -> Self {
        QueryHandle {
            query_id,
            priority,
            estimated_max_memory_bytes: 0,
        }
    }
}

/// Feedback sent by a worker when it completes a work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrderCompletion {
    pub query_id: QueryId,
    pub operator_index: OperatorIndex,
    pub worker_thread_index: usize,
    pub execution_time_micros: u64,
    /// Timestamp (microseconds) when execution finished.
    pub execution_end_timestamp_micros: u64,
}
