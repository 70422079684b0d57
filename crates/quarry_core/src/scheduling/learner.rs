use std::collections::BTreeMap;

use hashbrown::HashMap;
use quarry_error::{DbError, OptionExt, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use super::execution_stats::ExecutionStats;
use super::probability_store::ProbabilityStore;
use super::query_handle::{QueryHandle, WorkOrderCompletion};
use super::{OperatorIndex, PriorityLevel, QueryId};
use crate::config::scheduler::SchedulerConfig;

/// Whether a priority level has enough feedback to use feedback-weighted
/// probabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedbackState {
    /// At least one query in the level hasn't reported any work order
    /// completions yet. Queries are picked uniformly.
    Cold,
    /// Every query in the level has at least one sample.
    Warm,
}

#[derive(Debug)]
struct PriorityLevelState {
    /// Queries in this level in admission order, along with their stats.
    queries: Vec<(QueryId, ExecutionStats)>,
    /// Feedback-weighted probabilities.
    current: ProbabilityStore,
    /// Uniform probabilities used until the level is warm.
    default: ProbabilityStore,
    feedback: FeedbackState,
}

impl PriorityLevelState {
    fn stats(&self, query_id: QueryId) -> Option<&ExecutionStats> {
        self.queries
            .iter()
            .find(|(id, _)| *id == query_id)
            .map(|(_, stats)| stats)
    }

    fn stats_mut(&mut self, query_id: QueryId) -> Option<&mut ExecutionStats> {
        self.queries
            .iter_mut()
            .find(|(id, _)| *id == query_id)
            .map(|(_, stats)| stats)
    }

    fn all_queries_have_feedback(&self) -> bool {
        self.queries
            .iter()
            .all(|(_, stats)| stats.has_received_feedback())
    }

    /// Mean work order time per query, in admission order.
    fn mean_work_order_times(&self) -> Vec<(QueryId, f64)> {
        self.queries
            .iter()
            .map(|(id, stats)| (*id, stats.mean_time()))
            .collect()
    }

    fn refresh_feedback_state(&mut self) {
        self.feedback = if self.all_queries_have_feedback() {
            FeedbackState::Warm
        } else {
            FeedbackState::Cold
        };
    }
}

/// Learns how to split work order dispatch between active queries.
///
/// Two levels of probability distributions are maintained:
///
/// - Over priority levels. Initially proportional to the level's value. Once
///   every level has feedback, proportional to `level / sum(levels) /
///   predicted_work_order_time`.
/// - Over queries within a level. Initially uniform. Once every query in a
///   level has feedback, proportional to `1 / mean_work_order_time`, which
///   favors queries with shorter work orders.
///
/// Not thread safe, callers serialize access.
#[derive(Debug)]
pub struct Learner {
    config: SchedulerConfig,
    levels: BTreeMap<PriorityLevel, PriorityLevelState>,
    query_priorities: HashMap<QueryId, PriorityLevel>,
    priority_level_probabilities: ProbabilityStore,
    /// Seeds new probability stores when deterministic picks are wanted.
    seeder: Option<StdRng>,
}

impl Learner {
    pub fn new(config: SchedulerConfig) -> Self {
        Learner {
            config,
            levels: BTreeMap::new(),
            query_priorities: HashMap::new(),
            priority_level_probabilities: ProbabilityStore::new(),
            seeder: None,
        }
    }

    /// Create a learner where all random picks are derived from `seed`.
    pub fn with_seed(config: SchedulerConfig, seed: u64) -> Self {
        let mut seeder = StdRng::seed_from_u64(seed);
        let priority_level_probabilities = ProbabilityStore::with_seed(seeder.random());
        Learner {
            config,
            levels: BTreeMap::new(),
            query_priorities: HashMap::new(),
            priority_level_probabilities,
            seeder: Some(seeder),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a newly admitted query.
    pub fn add_query(&mut self, handle: &QueryHandle) -> Result<()> {
        if handle.priority == 0 {
            return Err(DbError::new("Priority level must be non-zero")
                .with_field("query_id", handle.query_id));
        }
        if self.query_priorities.contains_key(&handle.query_id) {
            return Err(DbError::new("Query already registered with learner")
                .with_field("query_id", handle.query_id));
        }

        if !self.levels.contains_key(&handle.priority) {
            debug!(priority_level = handle.priority, "adding priority level");
            let state = PriorityLevelState {
                queries: Vec::new(),
                current: self.new_store(),
                default: self.new_store(),
                feedback: FeedbackState::Cold,
            };
            self.levels.insert(handle.priority, state);
        }

        let max_entries = self.config.max_past_entries;
        let state = self.level_mut(handle.priority)?;
        state
            .queries
            .push((handle.query_id, ExecutionStats::new(max_entries)));
        // New query has no feedback.
        state.feedback = FeedbackState::Cold;

        self.query_priorities
            .insert(handle.query_id, handle.priority);

        self.relearn()
    }

    /// Ingest feedback for a completed work order.
    pub fn add_completion_feedback(&mut self, completion: &WorkOrderCompletion) -> Result<()> {
        let query_id = completion.query_id;
        let priority_level = self.query_priority(query_id).ok_or_else(|| {
            DbError::new("Feedback for unknown query").with_field("query_id", query_id)
        })?;

        trace!(
            query_id,
            operator_index = completion.operator_index,
            worker_thread_index = completion.worker_thread_index,
            execution_time_micros = completion.execution_time_micros,
            execution_end_timestamp_micros = completion.execution_end_timestamp_micros,
            "work order completed"
        );

        let state = self.level_mut(priority_level)?;
        let stats = state.stats_mut(query_id).required("execution stats for query")?;
        stats.add_entry(completion.execution_time_micros, completion.operator_index);

        if state.feedback == FeedbackState::Cold {
            state.refresh_feedback_state();
            if state.feedback == FeedbackState::Warm {
                debug!(priority_level, "all queries in priority level have feedback");
            }
        }

        if self.config.dynamic_probabilities {
            self.update_probabilities_for_queries_in_priority_level(priority_level, query_id)?;
        }
        self.update_probabilities_of_all_priority_levels()?;

        if tracing::enabled!(tracing::Level::TRACE) {
            self.trace_predicted_work_order_times();
        }

        Ok(())
    }

    /// Reweight the queries within a priority level using their mean work
    /// order times.
    ///
    /// `query_id` is the query whose feedback triggered the update.
    pub fn update_probabilities_for_queries_in_priority_level(
        &mut self,
        priority_level: PriorityLevel,
        query_id: QueryId,
    ) -> Result<()> {
        let state = self.level_mut(priority_level)?;

        match state.queries.len() {
            0 => {
                warn!(
                    query_id,
                    priority_level, "updating probabilities for a priority level with no queries"
                );
                Ok(())
            }
            1 => {
                // No choice to make, lone query always gets picked.
                let (lone_query, _) = state.queries[0];
                let denominator = state.current.denominator();
                state.current.add_or_update_object(lone_query, denominator)
            }
            _ => {
                let means = state.mean_work_order_times();
                if means.iter().any(|(_, mean)| *mean == 0.0) {
                    // Some query has no usable prediction yet, keep the
                    // previous probabilities.
                    trace!(
                        priority_level,
                        "skipping probability update, query with zero mean work order time"
                    );
                    return Ok(());
                }

                let denominator: f64 = means.iter().map(|(_, mean)| 1.0 / mean).sum();
                let keys: Vec<_> = means.iter().map(|(id, _)| *id).collect();
                // Clamp guards against the sum rounding below a single term.
                let numerators: Vec<_> = means
                    .iter()
                    .map(|(_, mean)| (1.0 / mean).min(denominator))
                    .collect();

                state
                    .current
                    .add_or_update_objects_new_denominator(&keys, &numerators, denominator)
            }
        }
    }

    /// Reweight priority levels once every level has feedback from all of its
    /// queries.
    pub fn update_probabilities_of_all_priority_levels(&mut self) -> Result<()> {
        if !self.has_feedback_from_all_priority_levels() {
            return Ok(());
        }

        let sum_active_priorities: PriorityLevel = self.levels.keys().sum();
        if sum_active_priorities == 0 {
            return Ok(());
        }

        let mut levels = Vec::with_capacity(self.levels.len());
        let mut work_orders = Vec::with_capacity(self.levels.len());
        let mut total_work_orders = 0.0;

        for (&level, state) in &self.levels {
            debug_assert!(!state.queries.is_empty());
            let total_time: f64 = state
                .mean_work_order_times()
                .iter()
                .map(|(_, mean)| mean)
                .sum();
            let predicted_time = total_time / state.queries.len() as f64;

            // Number of work orders this level may execute in a unit of time.
            let allowed = if predicted_time == 0.0 {
                0.0
            } else {
                level as f64 / sum_active_priorities as f64 / predicted_time
            };

            levels.push(level);
            work_orders.push(allowed);
            total_work_orders += allowed;
        }

        if total_work_orders == 0.0 {
            // No level can be selected using feedback.
            return Ok(());
        }

        let numerators: Vec<_> = work_orders
            .into_iter()
            .map(|n: f64| n.min(total_work_orders))
            .collect();

        self.priority_level_probabilities
            .add_or_update_objects_new_denominator(&levels, &numerators, total_work_orders)
    }

    /// Reset the default (uniform) distributions after the set of active
    /// queries changed.
    ///
    /// Feedback-weighted distributions are left alone.
    pub fn relearn(&mut self) -> Result<()> {
        self.priority_level_probabilities = self.new_store();
        if !self.has_active_queries() {
            return Ok(());
        }

        let mut default_stores = Vec::with_capacity(self.levels.len());
        for _ in 0..self.levels.len() {
            default_stores.push(self.new_store());
        }

        let mut levels = Vec::with_capacity(self.levels.len());
        let mut level_numerators = Vec::with_capacity(self.levels.len());

        for ((&level, state), mut default) in self.levels.iter_mut().zip(default_stores) {
            debug_assert!(!state.queries.is_empty());
            let query_ids: Vec<_> = state.queries.iter().map(|(id, _)| *id).collect();
            let numerators = vec![1.0; query_ids.len()];
            default.add_or_update_objects_new_denominator(
                &query_ids,
                &numerators,
                query_ids.len() as f64,
            )?;
            state.default = default;

            levels.push(level);
            level_numerators.push(level as f64);
        }

        let sum_levels: f64 = level_numerators.iter().sum();
        self.priority_level_probabilities
            .add_or_update_objects_new_denominator(&levels, &level_numerators, sum_levels)
    }

    /// Remove a query that finished (or was canceled).
    pub fn remove_query(&mut self, query_id: QueryId) -> Result<()> {
        let priority_level = self.query_priorities.remove(&query_id).ok_or_else(|| {
            DbError::new("Cannot remove unknown query from learner").with_field("query_id", query_id)
        })?;

        let state = self.level_mut(priority_level)?;
        let pos = state
            .queries
            .iter()
            .position(|(id, _)| *id == query_id)
            .ok_or_else(|| {
                DbError::new("Missing execution stats for query").with_field("query_id", query_id)
            })?;
        state.queries.remove(pos);

        // Queries that never produced feedback may not be in the store.
        if state.current.has_object(query_id) {
            state.current.remove_object(query_id)?;
        }

        if state.queries.is_empty() {
            debug!(priority_level, "removing empty priority level");
            self.levels.remove(&priority_level);
        } else {
            state.refresh_feedback_state();
        }

        self.relearn()
    }

    /// Stop tracking stats for an operator that finished executing.
    pub fn remove_operator(&mut self, query_id: QueryId, operator_index: OperatorIndex) -> Result<()> {
        let priority_level = self.query_priority(query_id).ok_or_else(|| {
            DbError::new("Unknown query").with_field("query_id", query_id)
        })?;
        let state = self.level_mut(priority_level)?;
        let stats = state.stats_mut(query_id).required("execution stats for query")?;
        stats.remove_operator(operator_index)
    }

    /// Get the execution stats for a query.
    pub fn execution_stats(&self, query_id: QueryId) -> Option<&ExecutionStats> {
        let level = self.query_priority(query_id)?;
        self.levels.get(&level)?.stats(query_id)
    }

    pub fn has_active_queries(&self) -> bool {
        !self.query_priorities.is_empty()
    }

    pub fn total_num_active_queries(&self) -> usize {
        self.query_priorities.len()
    }

    pub fn num_active_queries_in_priority_level(&self, priority_level: PriorityLevel) -> usize {
        self.levels
            .get(&priority_level)
            .map(|state| state.queries.len())
            .unwrap_or(0)
    }

    /// Active priority levels in ascending order.
    pub fn priority_levels(&self) -> impl DoubleEndedIterator<Item = PriorityLevel> + '_ {
        self.levels.keys().copied()
    }

    /// Queries in a priority level, in admission order.
    pub fn queries_in_priority_level(
        &self,
        priority_level: PriorityLevel,
    ) -> impl Iterator<Item = QueryId> + '_ {
        self.levels
            .get(&priority_level)
            .into_iter()
            .flat_map(|state| state.queries.iter().map(|(id, _)| *id))
    }

    pub fn highest_priority_level(&self) -> Option<PriorityLevel> {
        self.levels.keys().next_back().copied()
    }

    pub fn query_priority(&self, query_id: QueryId) -> Option<PriorityLevel> {
        self.query_priorities.get(&query_id).copied()
    }

    pub fn feedback_state(&self, priority_level: PriorityLevel) -> Option<FeedbackState> {
        self.levels.get(&priority_level).map(|state| state.feedback)
    }

    pub fn has_feedback_from_all_queries_in_priority_level(
        &self,
        priority_level: PriorityLevel,
    ) -> bool {
        self.feedback_state(priority_level) == Some(FeedbackState::Warm)
    }

    pub fn has_feedback_from_all_priority_levels(&self) -> bool {
        self.levels
            .values()
            .all(|state| state.feedback == FeedbackState::Warm)
    }

    /// Pick a priority level at random.
    ///
    /// Returns None if there are no active queries.
    pub fn pick_random_priority_level(&mut self) -> Option<PriorityLevel> {
        if !self.has_active_queries() {
            return None;
        }
        self.priority_level_probabilities.pick_random_key().ok()
    }

    /// Pick a priority level, then a query within that level.
    pub fn pick_random_query(&mut self) -> Option<QueryId> {
        let level = self.pick_random_priority_level()?;
        self.pick_random_query_from_priority_level(level)
    }

    /// Pick a query from the given priority level.
    ///
    /// Feedback-weighted probabilities are used if the level is warm,
    /// otherwise queries are picked uniformly.
    pub fn pick_random_query_from_priority_level(
        &mut self,
        priority_level: PriorityLevel,
    ) -> Option<QueryId> {
        let use_current = self.uses_feedback_probabilities(priority_level);
        let state = self.levels.get_mut(&priority_level)?;
        let store = if use_current {
            &mut state.current
        } else {
            &mut state.default
        };
        store.pick_random_key().ok()
    }

    /// Probability that `query_id` gets picked from its priority level.
    pub fn query_probability(&self, query_id: QueryId) -> Result<f64> {
        let level = self.query_priority(query_id).ok_or_else(|| {
            DbError::new("Unknown query").with_field("query_id", query_id)
        })?;
        let use_current = self.uses_feedback_probabilities(level);
        let state = self.level(level)?;
        if use_current {
            state.current.individual_probability(query_id)
        } else {
            state.default.individual_probability(query_id)
        }
    }

    /// Probability that a priority level gets picked.
    pub fn priority_level_probability(&self, priority_level: PriorityLevel) -> Result<f64> {
        self.priority_level_probabilities
            .individual_probability(priority_level)
    }

    /// If picks within a level should use the feedback-weighted store.
    fn uses_feedback_probabilities(&self, priority_level: PriorityLevel) -> bool {
        if !self.config.dynamic_probabilities {
            return false;
        }
        match self.levels.get(&priority_level) {
            Some(state) => {
                state.feedback == FeedbackState::Warm
                    && state
                        .queries
                        .iter()
                        .all(|(id, _)| state.current.has_object(*id))
            }
            None => false,
        }
    }

    fn trace_predicted_work_order_times(&self) {
        for (level, state) in &self.levels {
            for (query_id, mean) in state.mean_work_order_times() {
                trace!(
                    priority_level = level,
                    query_id,
                    predicted_micros = mean,
                    "predicted work order time"
                );
            }
        }
    }

    fn level(&self, priority_level: PriorityLevel) -> Result<&PriorityLevelState> {
        self.levels.get(&priority_level).ok_or_else(|| {
            DbError::new("Missing priority level").with_field("priority_level", priority_level)
        })
    }

    fn level_mut(&mut self, priority_level: PriorityLevel) -> Result<&mut PriorityLevelState> {
        self.levels.get_mut(&priority_level).ok_or_else(|| {
            DbError::new("Missing priority level").with_field("priority_level", priority_level)
        })
    }

    fn new_store(&mut self) -> ProbabilityStore {
        match &mut self.seeder {
            Some(seeder) => ProbabilityStore::with_seed(seeder.random()),
            None => ProbabilityStore::new(),
        }
    }
}
