use serde::{Deserialize, Serialize};

/// Configuration for the work order scheduling policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of past work order execution times kept per operator.
    pub max_past_entries: usize,
    /// Maximum number of work orders handed out in a single dispatch round.
    pub max_msgs_per_dispatch_round: usize,
    /// If the learner should reweight queries within a priority level using
    /// completion feedback. When false, queries in a level are always picked
    /// uniformly.
    pub dynamic_probabilities: bool,
    /// Always dispatch from the highest active priority level instead of
    /// picking a level probabilistically.
    pub highest_priority_first: bool,
    /// Maximum number of concurrently admitted queries. Queries over this
    /// limit wait for admission in arrival order.
    pub max_admitted_queries: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_past_entries: 10,
            max_msgs_per_dispatch_round: 40,
            dynamic_probabilities: true,
            highest_priority_first: false,
            max_admitted_queries: 64,
        }
    }
}
