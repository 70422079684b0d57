use quarry_error::{DbError, Result};

use super::worker_directory::WorkerDirectory;

/// Strategy for choosing the worker that receives the next work order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSelectionPolicy {
    /// Cycle through workers in index order, starting at `next`.
    RoundRobin { next: usize },
    /// Always pick the least loaded worker.
    LoadBalancing,
    /// Pick the least loaded worker pinned to the preferred NUMA node,
    /// falling back to the globally least loaded worker.
    NumaAware,
}

impl WorkerSelectionPolicy {
    pub const fn round_robin(start: usize) -> Self {
        WorkerSelectionPolicy::RoundRobin { next: start }
    }

    /// Choose a worker.
    ///
    /// `preferred_numa_node` is a hint, only used by the NUMA aware policy.
    pub fn next_worker(
        &mut self,
        directory: &WorkerDirectory,
        preferred_numa_node: Option<usize>,
    ) -> Result<usize> {
        let num_workers = directory.num_workers();
        if num_workers == 0 {
            return Err(DbError::new("Cannot select a worker, no workers available"));
        }

        match self {
            WorkerSelectionPolicy::RoundRobin { next } => {
                // Computed against the current worker count so workers added
                // since the last call are included.
                let worker = *next % num_workers;
                *next = worker + 1;
                Ok(worker)
            }
            WorkerSelectionPolicy::LoadBalancing => least_loaded(directory),
            WorkerSelectionPolicy::NumaAware => {
                if let Some(node) = preferred_numa_node {
                    let local = directory
                        .workers_on_numa_node(node)
                        .map(|idx| directory.num_queued_work_orders(idx).map(|q| (q, idx)))
                        .collect::<Result<Vec<_>>>()?;
                    if let Some((_, idx)) = local.into_iter().min() {
                        return Ok(idx);
                    }
                }
                least_loaded(directory)
            }
        }
    }
}

fn least_loaded(directory: &WorkerDirectory) -> Result<usize> {
    directory
        .least_loaded_worker()
        .map(|(idx, _)| idx)
        .ok_or_else(|| DbError::new("Cannot select a worker, no workers available"))
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn directory() -> WorkerDirectory {
        WorkerDirectory::new((0..100).map(|i| Some(i % 4)))
    }

    #[test]
    fn round_robin() {
        let wd = directory();
        let start = 37;
        let mut policy = WorkerSelectionPolicy::round_robin(start);

        let mut expected = start;
        for _ in 0..(wd.num_workers() * 2) {
            assert_eq!(expected, policy.next_worker(&wd, None).unwrap());
            expected = (expected + 1) % wd.num_workers();
        }
    }

    #[test]
    fn round_robin_picks_up_new_worker() {
        let mut wd = directory();
        let start = wd.num_workers() - 1;
        let mut policy = WorkerSelectionPolicy::round_robin(start);
        assert_eq!(start, policy.next_worker(&wd, None).unwrap());

        let new_worker = wd.add_worker(Some(0));
        assert_eq!(new_worker, policy.next_worker(&wd, None).unwrap());
        assert_eq!(0, policy.next_worker(&wd, None).unwrap());
    }

    #[test]
    fn load_balancing() {
        let mut wd = directory();
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut loads: Vec<usize> = (0..wd.num_workers())
            .map(|_| rng.random_range(0..=20))
            .collect();
        for (idx, load) in loads.iter().enumerate() {
            for _ in 0..*load {
                wd.increment_num_queued_work_orders(idx).unwrap();
            }
        }

        let mut policy = WorkerSelectionPolicy::LoadBalancing;
        let mut zero_load_counts = 0;
        let mut idx = 0;
        while zero_load_counts < loads.len() {
            let expected = wd.least_loaded_worker().unwrap().0;
            assert_eq!(expected, policy.next_worker(&wd, None).unwrap());
            if loads[idx] > 0 {
                wd.decrement_num_queued_work_orders(idx).unwrap();
                loads[idx] -= 1;
            } else {
                zero_load_counts += 1;
            }
            idx = (idx + 1) % loads.len();
        }
        assert_eq!(0, policy.next_worker(&wd, None).unwrap());
    }

    #[test]
    fn numa_aware_prefers_local_workers() {
        let mut wd = WorkerDirectory::new([Some(0), Some(1), Some(0), Some(1), None]);
        let mut policy = WorkerSelectionPolicy::NumaAware;

        assert_eq!(1, policy.next_worker(&wd, Some(1)).unwrap());
        wd.increment_num_queued_work_orders(1).unwrap();
        assert_eq!(3, policy.next_worker(&wd, Some(1)).unwrap());

        // No workers on node 7, globally least loaded.
        assert_eq!(0, policy.next_worker(&wd, Some(7)).unwrap());
        assert_eq!(0, policy.next_worker(&wd, None).unwrap());
    }

    #[test]
    fn no_workers() {
        let wd = WorkerDirectory::default();
        WorkerSelectionPolicy::round_robin(0)
            .next_worker(&wd, None)
            .unwrap_err();
        WorkerSelectionPolicy::LoadBalancing
            .next_worker(&wd, None)
            .unwrap_err();
    }
}
