//! Cluster construction and SPMD launch.
//!
//! A [`Cluster`] owns the process-wide shared arenas (node table, cache,
//! scheduler cells), constructed once up front with documented capacity and
//! alive until the run terminates. [`run`][Cluster::run] launches the fixed
//! set of workers together and executes the same closure on each — the SPMD
//! model of the engine. Tables and caches exist before any worker touches
//! the operation engine, and nothing outlives the run.

use std::sync::{Arc, Barrier};
use std::thread;

use log::info;

use crate::bdd::Worker;
use crate::cache::OpCache;
use crate::config::Config;
use crate::stealer::Sched;
use crate::table::NodeTable;

pub(crate) struct Shared {
    pub config: Config,
    pub table: NodeTable,
    pub cache: OpCache,
    pub sched: Sched,
    pub barrier: Barrier,
}

/// A fixed set of workers over shared partitioned arenas.
pub struct Cluster {
    shared: Arc<Shared>,
}

impl Cluster {
    /// Allocate the shared arenas for the given configuration.
    pub fn new(config: Config) -> Self {
        let config = config.validate();
        info!(
            "cluster: {} workers, node table 2^{} and cache 2^{} entries per worker",
            config.workers, config.table_bits, config.cache_bits
        );
        let table = NodeTable::new(&config);
        let cache = OpCache::new(&config);
        let sched = Sched::new(&config);
        let barrier = Barrier::new(config.workers);
        Self {
            shared: Arc::new(Shared {
                config,
                table,
                cache,
                sched,
                barrier,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Launch all workers, run `f` on each, and collect the per-worker
    /// results in worker order. Consumes the cluster: arenas live exactly
    /// one run.
    pub fn run<T, F>(self, f: F) -> Vec<T>
    where
        F: Fn(&mut Worker) -> T + Sync,
        T: Send,
    {
        let shared = self.shared;
        thread::scope(|scope| {
            let handles: Vec<_> = (0..shared.config.workers)
                .map(|id| {
                    let shared = Arc::clone(&shared);
                    let f = &f;
                    scope.spawn(move || {
                        let mut worker = Worker::new(shared, id);
                        f(&mut worker)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("Worker panicked"))
                .collect()
        })
    }
}
