use quarry_error::{DbError, Result};

/// Bookkeeping for a single worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct WorkerEntry {
    /// NUMA node the worker is pinned to, if any.
    numa_node: Option<usize>,
    /// Work orders queued on the worker, including the one currently
    /// executing.
    queued: usize,
}

/// Tracks the workers available to the scheduler and their current load.
///
/// Workers are identified by their logical index, which is assigned in the
/// order workers are added.
#[derive(Debug, Clone, Default)]
pub struct WorkerDirectory {
    workers: Vec<WorkerEntry>,
}

impl WorkerDirectory {
    /// Create a directory with one worker per provided NUMA node assignment.
    pub fn new(numa_nodes: impl IntoIterator<Item = Option<usize>>) -> Self {
        WorkerDirectory {
            workers: numa_nodes
                .into_iter()
                .map(|numa_node| WorkerEntry {
                    numa_node,
                    queued: 0,
                })
                .collect(),
        }
    }

    /// Create a directory with `num_workers` unpinned workers.
    pub fn with_num_workers(num_workers: usize) -> Self {
        Self::new(std::iter::repeat_n(None, num_workers))
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn num_queued_work_orders(&self, worker_thread_index: usize) -> Result<usize> {
        Ok(self.worker(worker_thread_index)?.queued)
    }

    pub fn increment_num_queued_work_orders(&mut self, worker_thread_index: usize) -> Result<()> {
        self.worker_mut(worker_thread_index)?.queued += 1;
        Ok(())
    }

    pub fn decrement_num_queued_work_orders(&mut self, worker_thread_index: usize) -> Result<()> {
        let worker = self.worker_mut(worker_thread_index)?;
        if worker.queued == 0 {
            return Err(DbError::new("Worker has no queued work orders")
                .with_field("worker_thread_index", worker_thread_index));
        }
        worker.queued -= 1;
        Ok(())
    }

    pub fn numa_node(&self, worker_thread_index: usize) -> Result<Option<usize>> {
        Ok(self.worker(worker_thread_index)?.numa_node)
    }

    /// Add a new worker, returning its logical index.
    pub fn add_worker(&mut self, numa_node: Option<usize>) -> usize {
        self.workers.push(WorkerEntry {
            numa_node,
            queued: 0,
        });
        self.workers.len() - 1
    }

    /// Get (worker index, queued count) for the least loaded worker.
    ///
    /// Ties go to the lowest index. Returns None if there are no workers.
    pub fn least_loaded_worker(&self) -> Option<(usize, usize)> {
        self.workers
            .iter()
            .enumerate()
            .min_by_key(|(_, worker)| worker.queued)
            .map(|(idx, worker)| (idx, worker.queued))
    }

    /// Get (worker index, queued count) for the most loaded worker.
    ///
    /// Ties go to the lowest index. Returns None if there are no workers.
    pub fn most_loaded_worker(&self) -> Option<(usize, usize)> {
        self.workers
            .iter()
            .enumerate()
            .rev()
            .max_by_key(|(_, worker)| worker.queued)
            .map(|(idx, worker)| (idx, worker.queued))
    }

    /// Indices of workers pinned to a NUMA node.
    pub fn workers_on_numa_node(&self, numa_node: usize) -> impl Iterator<Item = usize> + '_ {
        self.workers
            .iter()
            .enumerate()
            .filter(move |(_, worker)| worker.numa_node == Some(numa_node))
            .map(|(idx, _)| idx)
    }

    fn worker(&self, worker_thread_index: usize) -> Result<&WorkerEntry> {
        self.workers.get(worker_thread_index).ok_or_else(|| {
            DbError::new("Worker index out of range")
                .with_field("worker_thread_index", worker_thread_index)
                .with_field("num_workers", self.workers.len())
        })
    }

    fn worker_mut(&mut self, worker_thread_index: usize) -> Result<&mut WorkerEntry> {
        let num_workers = self.workers.len();
        self.workers.get_mut(worker_thread_index).ok_or_else(|| {
            DbError::new("Worker index out of range")
                .with_field("worker_thread_index", worker_thread_index)
                .with_field("num_workers", num_workers)
        })
    }
}
