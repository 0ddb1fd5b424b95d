//! Bounded worker pool for running requests against many instances.

use crate::error::{Error, Result};
use rayon::prelude::*;

/// A fixed number of worker threads. Each job runs start to finish on one
/// worker; jobs beyond the worker count wait for a free worker.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// Pool with `workers` threads (at least one).
    pub fn new(workers: usize) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|i| format!("strata-worker-{i}"))
            .build()
            .map_err(|e| Error::Io(std::io::Error::other(e)))?;
        log::debug!("Started worker pool with {} threads", pool.current_num_threads());
        Ok(Self { pool })
    }

    /// Number of worker threads.
    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `job` once per item, returning results in item order.
    pub fn run_all<T, R, F>(&self, items: Vec<T>, job: F) -> Vec<R>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Send + Sync,
    {
        self.pool
            .install(|| items.into_par_iter().with_max_len(1).map(job).collect())
    }
}
