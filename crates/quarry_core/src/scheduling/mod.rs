//! Adaptive work order scheduling.
//!
//! The [`learner::Learner`] keeps a probability distribution over priority
//! levels and, within each level, over the active queries. Distributions start
//! uniform and are reweighted from work order completion feedback so that
//! queries with cheaper work orders get picked more often.

pub mod execution_stats;
pub mod learner;
pub mod policy_enforcer;
pub mod probability_store;
pub mod query_handle;
pub mod worker_directory;
pub mod worker_selection;

/// Identifier for a query.
pub type QueryId = u64;

/// Priority level of a query. Valid levels are non-zero, larger values are
/// more important.
pub type PriorityLevel = u64;

/// Index of an operator within a query plan.
pub type OperatorIndex = usize;
