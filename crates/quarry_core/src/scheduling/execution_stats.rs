use std::collections::VecDeque;

use hashbrown::HashMap;
use quarry_error::{DbError, Result};

use super::OperatorIndex;

/// Bounded window of execution times for a single operator.
#[derive(Debug, Clone)]
pub struct OperatorStats {
    max_entries: usize,
    /// Execution times in microseconds, oldest first.
    times: VecDeque<u64>,
    /// Running sum of `times`.
    sum: u64,
}

impl OperatorStats {
    pub fn new(max_entries: usize) -> Self {
        OperatorStats {
            max_entries,
            times: VecDeque::with_capacity(max_entries),
            sum: 0,
        }
    }

    /// Add a sample, evicting the oldest one if at capacity.
    pub fn add_entry(&mut self, value: u64) {
        if self.times.len() == self.max_entries {
            if let Some(oldest) = self.times.pop_front() {
                self.sum -= oldest;
            }
        }
        self.times.push_back(value);
        self.sum += value;
        debug_assert!(self.times.len() <= self.max_entries);
    }

    /// Returns (sum of samples, number of samples).
    pub fn current_stats(&self) -> (u64, usize) {
        (self.sum, self.times.len())
    }
}

/// Per-query execution statistics.
///
/// Tracks a sliding window of work order execution times for every active
/// operator in the query.
#[derive(Debug, Clone)]
pub struct ExecutionStats {
    max_entries: usize,
    active_operators: HashMap<OperatorIndex, OperatorStats>,
    /// Set on the first sample, survives operator removal.
    received_feedback: bool,
}

impl ExecutionStats {
    /// Create stats keeping at most `max_entries` samples per operator.
    ///
    /// A window of zero is bumped to one.
    pub fn new(max_entries: usize) -> Self {
        ExecutionStats {
            max_entries: max_entries.max(1),
            active_operators: HashMap::new(),
            received_feedback: false,
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn num_operators(&self) -> usize {
        self.active_operators.len()
    }

    pub fn has_operator(&self, operator_index: OperatorIndex) -> bool {
        self.active_operators.contains_key(&operator_index)
    }

    /// If any operator in this query has at least one sample.
    pub fn has_stats(&self) -> bool {
        self.active_operators
            .values()
            .any(|stats| !stats.times.is_empty())
    }

    /// If a sample was ever recorded for this query, including samples for
    /// operators that have since been removed.
    pub fn has_received_feedback(&self) -> bool {
        self.received_feedback
    }

    /// Add an execution time (in microseconds) for an operator.
    pub fn add_entry(&mut self, value: u64, operator_index: OperatorIndex) {
        self.received_feedback = true;
        let max_entries = self.max_entries;
        self.active_operators
            .entry(operator_index)
            .or_insert_with(|| OperatorStats::new(max_entries))
            .add_entry(value);
    }

    /// Returns (sum of samples, number of samples) for an operator.
    pub fn current_stats_for_operator(&self, operator_index: OperatorIndex) -> Result<(u64, usize)> {
        let stats = self.active_operators.get(&operator_index).ok_or_else(|| {
            DbError::new("Missing stats for operator").with_field("operator_index", operator_index)
        })?;
        Ok(stats.current_stats())
    }

    /// Returns (sum of samples, number of samples) across all active
    /// operators.
    pub fn current_stats(&self) -> (u64, usize) {
        self.active_operators
            .values()
            .fold((0, 0), |(sum, count), stats| {
                let (s, c) = stats.current_stats();
                (sum + s, count + c)
            })
    }

    /// Mean execution time across all active operators, zero if there's no
    /// samples.
    pub fn mean_time(&self) -> f64 {
        let (sum, count) = self.current_stats();
        if count == 0 {
            0.0
        } else {
            sum as f64 / count as f64
        }
    }

    /// Stop tracking an operator.
    pub fn remove_operator(&mut self, operator_index: OperatorIndex) -> Result<()> {
        if self.active_operators.remove(&operator_index).is_none() {
            return Err(DbError::new("Cannot remove untracked operator")
                .with_field("operator_index", operator_index));
        }
        Ok(())
    }
}
