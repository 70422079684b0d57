use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use quarry_error::{DbError, OptionExt, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::learner::Learner;
use super::query_handle::{QueryHandle, WorkOrderCompletion};
use super::worker_directory::WorkerDirectory;
use super::worker_selection::WorkerSelectionPolicy;
use super::{OperatorIndex, PriorityLevel, QueryId};
use crate::catalog::BlockId;
use crate::catalog::numa_placement::NumaPlacementScheme;
use crate::config::scheduler::SchedulerConfig;

/// A unit of work for a single operator in a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub query_id: QueryId,
    pub operator_index: OperatorIndex,
    /// Block the work order reads, if any. Used for NUMA local dispatch.
    pub block: Option<BlockId>,
}

/// A work order assigned to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerMessage {
    pub worker_thread_index: usize,
    pub work_order: WorkOrder,
}

#[derive(Debug)]
struct AdmittedQuery {
    handle: QueryHandle,
    pending: VecDeque<WorkOrder>,
    /// Work orders not yet completed per operator, dispatched or not.
    remaining_per_operator: HashMap<OperatorIndex, usize>,
    /// Dispatched work orders that haven't completed.
    in_flight: usize,
}

impl AdmittedQuery {
    fn new(handle: QueryHandle, work_orders: Vec<WorkOrder>) -> Self {
        let mut remaining_per_operator = HashMap::new();
        for work_order in &work_orders {
            *remaining_per_operator
                .entry(work_order.operator_index)
                .or_insert(0) += 1;
        }
        AdmittedQuery {
            handle,
            pending: work_orders.into(),
            remaining_per_operator,
            in_flight: 0,
        }
    }

    fn is_finished(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }
}

/// Decides which work orders get sent to which workers.
///
/// Each dispatch round picks a priority level (probabilistically through the
/// learner, or strictly highest first), then a query in that level, and hands
/// the query's next work order to a worker chosen by the selection policy.
/// Completion feedback flows back into the learner.
#[derive(Debug)]
pub struct PriorityPolicyEnforcer {
    config: SchedulerConfig,
    learner: Learner,
    worker_directory: WorkerDirectory,
    selection_policy: WorkerSelectionPolicy,
    placement: Option<Arc<NumaPlacementScheme>>,
    admitted: HashMap<QueryId, AdmittedQuery>,
    /// Queries waiting for admission, in arrival order.
    waiting: VecDeque<(QueryHandle, Vec<WorkOrder>)>,
}

impl PriorityPolicyEnforcer {
    pub fn new(
        config: SchedulerConfig,
        worker_directory: WorkerDirectory,
        selection_policy: WorkerSelectionPolicy,
    ) -> Self {
        let learner = Learner::new(config.clone());
        Self::with_learner(learner, worker_directory, selection_policy)
    }

    /// Create an enforcer using an existing learner. The learner's config is
    /// used for dispatching.
    pub fn with_learner(
        learner: Learner,
        worker_directory: WorkerDirectory,
        selection_policy: WorkerSelectionPolicy,
    ) -> Self {
        PriorityPolicyEnforcer {
            config: learner.config().clone(),
            learner,
            worker_directory,
            selection_policy,
            placement: None,
            admitted: HashMap::new(),
            waiting: VecDeque::new(),
        }
    }

    /// Prefer workers local to the blocks work orders read.
    pub fn with_numa_placement(mut self, placement: Arc<NumaPlacementScheme>) -> Self {
        self.placement = Some(placement);
        self
    }

    pub fn learner(&self) -> &Learner {
        &self.learner
    }

    pub fn worker_directory(&self) -> &WorkerDirectory {
        &self.worker_directory
    }

    pub fn worker_directory_mut(&mut self) -> &mut WorkerDirectory {
        &mut self.worker_directory
    }

    pub fn num_admitted_queries(&self) -> usize {
        self.admitted.len()
    }

    pub fn num_waiting_queries(&self) -> usize {
        self.waiting.len()
    }

    pub fn has_admitted_query(&self, query_id: QueryId) -> bool {
        self.admitted.contains_key(&query_id)
    }

    /// Number of work orders for a query that haven't been dispatched yet.
    pub fn num_pending_work_orders(&self, query_id: QueryId) -> Option<usize> {
        self.admitted.get(&query_id).map(|query| query.pending.len())
    }

    /// Admit a query along with all of its work orders.
    ///
    /// Returns false if the query has to wait for other queries to finish
    /// before being admitted.
    pub fn admit_query(&mut self, handle: QueryHandle, work_orders: Vec<WorkOrder>) -> Result<bool> {
        if let Some(work_order) = work_orders
            .iter()
            .find(|work_order| work_order.query_id != handle.query_id)
        {
            return Err(DbError::new("Work order belongs to a different query")
                .with_field("query_id", handle.query_id)
                .with_field("work_order_query_id", work_order.query_id));
        }

        let is_waiting = self
            .waiting
            .iter()
            .any(|(waiting, _)| waiting.query_id == handle.query_id);
        if is_waiting || self.admitted.contains_key(&handle.query_id) {
            return Err(DbError::new("Query with the same id already exists")
                .with_field("query_id", handle.query_id));
        }

        if self.admitted.len() >= self.config.max_admitted_queries {
            debug!(query_id = handle.query_id, "query waiting for admission");
            self.waiting.push_back((handle, work_orders));
            return Ok(false);
        }

        self.admit(handle, work_orders)?;
        Ok(true)
    }

    /// Run a single dispatch round.
    pub fn get_worker_messages(&mut self) -> Result<Vec<WorkerMessage>> {
        let mut messages = Vec::new();
        if !self.learner.has_active_queries() {
            trace!("no active queries to dispatch");
            return Ok(messages);
        }

        let max_messages = self.config.max_msgs_per_dispatch_round;

        if self.config.highest_priority_first {
            let levels: Vec<_> = self.learner.priority_levels().collect();
            'levels: for level in levels.into_iter().rev() {
                while messages.len() < max_messages {
                    match self.next_message_from_priority_level(level)? {
                        Some(message) => messages.push(message),
                        None => continue 'levels,
                    }
                }
                break;
            }
        } else {
            let num_levels = self.learner.priority_levels().count();
            let mut exhausted: HashSet<PriorityLevel> = HashSet::new();

            while exhausted.len() < num_levels && messages.len() < max_messages {
                let Some(mut level) = self.learner.pick_random_priority_level() else {
                    break;
                };
                if exhausted.contains(&level) {
                    // Levels may have zero probability, fall back to the
                    // highest level that still has work.
                    match self
                        .learner
                        .priority_levels()
                        .rev()
                        .find(|l| !exhausted.contains(l))
                    {
                        Some(l) => level = l,
                        None => break,
                    }
                }

                match self.next_message_from_priority_level(level)? {
                    Some(message) => messages.push(message),
                    None => {
                        exhausted.insert(level);
                    }
                }
            }
        }

        self.remove_finished_queries()?;

        trace!(num_messages = messages.len(), "dispatch round complete");

        Ok(messages)
    }

    /// Handle a completed work order.
    pub fn process_completion(&mut self, completion: &WorkOrderCompletion) -> Result<()> {
        let query_id = completion.query_id;
        let operator_index = completion.operator_index;

        if self
            .worker_directory
            .num_queued_work_orders(completion.worker_thread_index)?
            == 0
        {
            return Err(DbError::new("Worker has no queued work orders")
                .with_field("worker_thread_index", completion.worker_thread_index));
        }

        let query = self.admitted.get(&query_id).ok_or_else(|| {
            DbError::new("Completion for query that isn't admitted").with_field("query_id", query_id)
        })?;
        if query.in_flight == 0 {
            return Err(DbError::new("Completion for query without dispatched work orders")
                .with_field("query_id", query_id));
        }
        if !query
            .remaining_per_operator
            .get(&operator_index)
            .is_some_and(|remaining| *remaining > 0)
        {
            return Err(DbError::new("Completion for operator without outstanding work")
                .with_field("query_id", query_id)
                .with_field("operator_index", operator_index));
        }

        // Validated, safe to mutate.
        self.learner.add_completion_feedback(completion)?;
        self.worker_directory
            .decrement_num_queued_work_orders(completion.worker_thread_index)?;

        let query = self
            .admitted
            .get_mut(&query_id)
            .required("admitted query")?;
        let remaining = query
            .remaining_per_operator
            .get_mut(&operator_index)
            .required("remaining work orders for operator")?;
        *remaining -= 1;
        let operator_done = *remaining == 0;
        if operator_done {
            query.remaining_per_operator.remove(&operator_index);
        }
        query.in_flight -= 1;
        let query_done = query.is_finished();

        if query_done {
            return self.remove_query(query_id);
        }

        if operator_done {
            debug!(query_id, operator_index, "operator finished");
            let has_stats = self
                .learner
                .execution_stats(query_id)
                .is_some_and(|stats| stats.has_operator(operator_index));
            if has_stats {
                self.learner.remove_operator(query_id, operator_index)?;
            }
        }

        Ok(())
    }

    /// Remove an admitted query, admitting waiting queries if there's room.
    pub fn remove_query(&mut self, query_id: QueryId) -> Result<()> {
        let query = self.admitted.remove(&query_id).ok_or_else(|| {
            DbError::new("Cannot remove query that isn't admitted").with_field("query_id", query_id)
        })?;
        if !query.is_finished() {
            warn!(
                query_id,
                pending = query.pending.len(),
                in_flight = query.in_flight,
                "removing query that hasn't finished executing"
            );
        }

        self.learner.remove_query(query_id)?;
        debug!(query_id, priority_level = query.handle.priority, "removed query");

        self.admit_waiting_queries()
    }

    fn admit(&mut self, handle: QueryHandle, work_orders: Vec<WorkOrder>) -> Result<()> {
        self.learner.add_query(&handle)?;
        debug!(
            query_id = handle.query_id,
            priority_level = handle.priority,
            estimated_max_memory_bytes = handle.estimated_max_memory_bytes,
            num_work_orders = work_orders.len(),
            "admitted query"
        );
        self.admitted
            .insert(handle.query_id, AdmittedQuery::new(handle, work_orders));
        Ok(())
    }

    fn admit_waiting_queries(&mut self) -> Result<()> {
        while self.admitted.len() < self.config.max_admitted_queries {
            let Some((handle, work_orders)) = self.waiting.pop_front() else {
                break;
            };
            self.admit(handle, work_orders)?;
        }
        Ok(())
    }

    fn remove_finished_queries(&mut self) -> Result<()> {
        let finished: Vec<_> = self
            .admitted
            .iter()
            .filter(|(_, query)| query.is_finished())
            .map(|(id, _)| *id)
            .collect();
        for query_id in finished {
            self.remove_query(query_id)?;
        }
        Ok(())
    }

    /// Get the next work order from a priority level and assign it to a
    /// worker.
    ///
    /// A query is picked from the level through the learner. If that query
    /// has nothing to dispatch, the other queries in the level are tried in
    /// admission order. Returns None if nothing in the level can be
    /// dispatched.
    fn next_message_from_priority_level(
        &mut self,
        priority_level: PriorityLevel,
    ) -> Result<Option<WorkerMessage>> {
        let picked = self
            .learner
            .pick_random_query_from_priority_level(priority_level);
        let candidates: Vec<QueryId> = picked
            .into_iter()
            .chain(
                self.learner
                    .queries_in_priority_level(priority_level)
                    .filter(|query_id| Some(*query_id) != picked),
            )
            .collect();

        for query_id in candidates {
            let Some(query) = self.admitted.get_mut(&query_id) else {
                continue;
            };
            let Some(work_order) = query.pending.pop_front() else {
                continue;
            };
            query.in_flight += 1;

            let preferred_numa_node = self.preferred_numa_node(&work_order);
            let worker_thread_index = self
                .selection_policy
                .next_worker(&self.worker_directory, preferred_numa_node)?;
            self.worker_directory
                .increment_num_queued_work_orders(worker_thread_index)?;

            trace!(
                query_id,
                operator_index = work_order.operator_index,
                worker_thread_index,
                ?preferred_numa_node,
                "dispatching work order"
            );

            return Ok(Some(WorkerMessage {
                worker_thread_index,
                work_order,
            }));
        }

        Ok(None)
    }

    fn preferred_numa_node(&self, work_order: &WorkOrder) -> Option<usize> {
        let placement = self.placement.as_ref()?;
        let block = work_order.block?;
        placement.numa_node_for_block(block).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn work_orders(query_id: QueryId, operators: &[(OperatorIndex, usize)]) -> Vec<WorkOrder> {
        operators
            .iter()
            .flat_map(|&(operator_index, count)| {
                (0..count).map(move |_| WorkOrder {
                    query_id,
                    operator_index,
                    block: None,
                })
            })
            .collect()
    }

    fn completion(message: &WorkerMessage, micros: u64) -> WorkOrderCompletion {
        WorkOrderCompletion {
            query_id: message.work_order.query_id,
            operator_index: message.work_order.operator_index,
            worker_thread_index: message.worker_thread_index,
            execution_time_micros: micros,
            execution_end_timestamp_micros: 0,
        }
    }

    fn enforcer(config: SchedulerConfig, num_workers: usize) -> PriorityPolicyEnforcer {
        PriorityPolicyEnforcer::with_learner(
            Learner::with_seed(config, 5),
            WorkerDirectory::with_num_workers(num_workers),
            WorkerSelectionPolicy::round_robin(0),
        )
    }

    #[test]
    fn dispatch_and_complete_single_query() {
        let mut enforcer = enforcer(SchedulerConfig::default(), 2);
        assert!(
            enforcer
                .admit_query(QueryHandle::new(1, 1), work_orders(1, &[(0, 5)]))
                .unwrap()
        );

        let messages = enforcer.get_worker_messages().unwrap();
        assert_eq!(5, messages.len());
        let workers: Vec<_> = messages.iter().map(|m| m.worker_thread_index).collect();
        assert_eq!(vec![0, 1, 0, 1, 0], workers);
        assert_eq!(3, enforcer.worker_directory().num_queued_work_orders(0).unwrap());
        assert_eq!(Some(0), enforcer.num_pending_work_orders(1));

        // Work still in flight.
        assert!(enforcer.has_admitted_query(1));
        assert!(enforcer.get_worker_messages().unwrap().is_empty());

        for message in &messages {
            enforcer.process_completion(&completion(message, 10)).unwrap();
        }
        assert!(!enforcer.has_admitted_query(1));
        assert!(!enforcer.learner().has_active_queries());
        assert_eq!(Some((0, 0)), enforcer.worker_directory().most_loaded_worker());
    }

    #[test]
    fn dispatch_round_limit() {
        let config = SchedulerConfig {
            max_msgs_per_dispatch_round: 3,
            ..Default::default()
        };
        let mut enforcer = enforcer(config, 4);
        enforcer
            .admit_query(QueryHandle::new(1, 2), work_orders(1, &[(0, 4)]))
            .unwrap();
        enforcer
            .admit_query(QueryHandle::new(2, 2), work_orders(2, &[(0, 4)]))
            .unwrap();

        assert_eq!(3, enforcer.get_worker_messages().unwrap().len());
        assert_eq!(3, enforcer.get_worker_messages().unwrap().len());
        assert_eq!(2, enforcer.get_worker_messages().unwrap().len());
        assert!(enforcer.get_worker_messages().unwrap().is_empty());
    }

    #[test]
    fn rejects_bad_admissions() {
        let mut enforcer = enforcer(SchedulerConfig::default(), 1);
        enforcer
            .admit_query(QueryHandle::new(1, 1), work_orders(1, &[(0, 1)]))
            .unwrap();
        enforcer
            .admit_query(QueryHandle::new(1, 3), work_orders(1, &[(0, 1)]))
            .unwrap_err();
        enforcer
            .admit_query(QueryHandle::new(2, 1), work_orders(3, &[(0, 1)]))
            .unwrap_err();
        enforcer
            .admit_query(QueryHandle::new(4, 0), work_orders(4, &[(0, 1)]))
            .unwrap_err();
        assert_eq!(1, enforcer.num_admitted_queries());
    }

    #[test]
    fn waiting_queries_admitted_in_order() {
        let config = SchedulerConfig {
            max_admitted_queries: 1,
            ..Default::default()
        };
        let mut enforcer = enforcer(config, 1);
        assert!(
            enforcer
                .admit_query(QueryHandle::new(1, 1), work_orders(1, &[(0, 1)]))
                .unwrap()
        );
        assert!(
            !enforcer
                .admit_query(QueryHandle::new(2, 1), work_orders(2, &[(0, 1)]))
                .unwrap()
        );
        assert!(
            !enforcer
                .admit_query(QueryHandle::new(3, 1), work_orders(3, &[(0, 1)]))
                .unwrap()
        );
        // Already waiting.
        enforcer
            .admit_query(QueryHandle::new(2, 1), Vec::new())
            .unwrap_err();
        assert_eq!(2, enforcer.num_waiting_queries());

        let messages = enforcer.get_worker_messages().unwrap();
        assert_eq!(1, messages.len());
        enforcer.process_completion(&completion(&messages[0], 3)).unwrap();

        assert!(enforcer.has_admitted_query(2));
        assert!(!enforcer.has_admitted_query(3));
        assert_eq!(1, enforcer.num_waiting_queries());
    }

    #[test]
    fn highest_priority_first() {
        let config = SchedulerConfig {
            highest_priority_first: true,
            max_msgs_per_dispatch_round: 4,
            ..Default::default()
        };
        let mut enforcer = enforcer(config, 2);
        enforcer
            .admit_query(QueryHandle::new(1, 1), work_orders(1, &[(0, 3)]))
            .unwrap();
        enforcer
            .admit_query(QueryHandle::new(2, 5), work_orders(2, &[(0, 3)]))
            .unwrap();

        let queries: Vec<_> = enforcer
            .get_worker_messages()
            .unwrap()
            .iter()
            .map(|m| m.work_order.query_id)
            .collect();
        assert_eq!(vec![2, 2, 2, 1], queries);
    }

    #[test]
    fn probabilistic_dispatch_drains_all_levels() {
        let mut enforcer = enforcer(SchedulerConfig::default(), 4);
        enforcer
            .admit_query(QueryHandle::new(1, 1), work_orders(1, &[(0, 6)]))
            .unwrap();
        enforcer
            .admit_query(QueryHandle::new(2, 3), work_orders(2, &[(0, 6)]))
            .unwrap();
        enforcer
            .admit_query(QueryHandle::new(3, 3), work_orders(3, &[(0, 6)]))
            .unwrap();

        let messages = enforcer.get_worker_messages().unwrap();
        assert_eq!(18, messages.len());
        for query_id in 1..=3 {
            assert_eq!(
                6,
                messages
                    .iter()
                    .filter(|m| m.work_order.query_id == query_id)
                    .count()
            );
        }
    }

    #[test]
    fn numa_local_dispatch() {
        let mut placement = NumaPlacementScheme::with_num_numa_nodes(4, 2).unwrap();
        placement.add_block_to_numa_node_map(7, 1).unwrap();
        placement.add_block_to_numa_node_map(8, 0).unwrap();

        let mut enforcer = PriorityPolicyEnforcer::new(
            SchedulerConfig::default(),
            WorkerDirectory::new([Some(0), Some(1)]),
            WorkerSelectionPolicy::NumaAware,
        )
        .with_numa_placement(Arc::new(placement));

        let orders = vec![
            WorkOrder {
                query_id: 1,
                operator_index: 0,
                block: Some(7),
            },
            WorkOrder {
                query_id: 1,
                operator_index: 0,
                block: Some(8),
            },
        ];
        enforcer.admit_query(QueryHandle::new(1, 1), orders).unwrap();

        let messages = enforcer.get_worker_messages().unwrap();
        assert_eq!(2, messages.len());
        assert_eq!(1, messages[0].worker_thread_index);
        assert_eq!(0, messages[1].worker_thread_index);
    }

    #[test]
    fn finished_operators_removed_from_learner() {
        let mut enforcer = enforcer(SchedulerConfig::default(), 1);
        enforcer
            .admit_query(QueryHandle::new(1, 1), work_orders(1, &[(0, 2), (1, 1)]))
            .unwrap();
        let messages = enforcer.get_worker_messages().unwrap();
        assert_eq!(3, messages.len());

        enforcer.process_completion(&completion(&messages[0], 4)).unwrap();
        let stats = enforcer.learner().execution_stats(1).unwrap();
        assert!(stats.has_operator(0));

        enforcer.process_completion(&completion(&messages[1], 4)).unwrap();
        let stats = enforcer.learner().execution_stats(1).unwrap();
        assert!(!stats.has_operator(0));

        enforcer.process_completion(&completion(&messages[2], 4)).unwrap();
        assert!(!enforcer.has_admitted_query(1));
    }

    #[test]
    fn empty_query_removed_after_dispatch() {
        let mut enforcer = enforcer(SchedulerConfig::default(), 1);
        enforcer.admit_query(QueryHandle::new(1, 1), Vec::new()).unwrap();
        assert!(enforcer.get_worker_messages().unwrap().is_empty());
        assert!(!enforcer.has_admitted_query(1));
    }

    #[test]
    fn unexpected_completions() {
        let mut enforcer = enforcer(SchedulerConfig::default(), 1);
        let unknown = WorkOrderCompletion {
            query_id: 9,
            operator_index: 0,
            worker_thread_index: 0,
            execution_time_micros: 1,
            execution_end_timestamp_micros: 0,
        };
        // Worker has nothing queued.
        enforcer.process_completion(&unknown).unwrap_err();

        enforcer
            .admit_query(QueryHandle::new(1, 1), work_orders(1, &[(0, 1)]))
            .unwrap();
        enforcer.get_worker_messages().unwrap();
        // Worker has a queued work order, but for a different query.
        enforcer.process_completion(&unknown).unwrap_err();
        assert_eq!(1, enforcer.worker_directory().num_queued_work_orders(0).unwrap());
    }

    #[test]
    fn rejected_completion_leaves_state_untouched() {
        let mut enforcer = enforcer(SchedulerConfig::default(), 1);
        enforcer
            .admit_query(QueryHandle::new(1, 1), work_orders(1, &[(0, 1)]))
            .unwrap();
        let messages = enforcer.get_worker_messages().unwrap();
        assert_eq!(1, messages.len());

        let wrong_query = WorkOrderCompletion {
            query_id: 9,
            operator_index: 0,
            worker_thread_index: 0,
            execution_time_micros: 1,
            execution_end_timestamp_micros: 0,
        };
        enforcer.process_completion(&wrong_query).unwrap_err();
        let wrong_operator = WorkOrderCompletion {
            query_id: 1,
            operator_index: 3,
            ..wrong_query
        };
        enforcer.process_completion(&wrong_operator).unwrap_err();
        assert_eq!(1, enforcer.worker_directory().num_queued_work_orders(0).unwrap());

        let genuine = WorkOrderCompletion {
            query_id: 1,
            ..wrong_query
        };
        enforcer.process_completion(&genuine).unwrap();
        assert!(!enforcer.has_admitted_query(1));
        assert_eq!(0, enforcer.worker_directory().num_queued_work_orders(0).unwrap());
    }
}
