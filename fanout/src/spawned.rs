//! Fork-join on freshly spawned threads.
//!
//! Every call spawns its own workers and joins all of them before returning, so no thread
//! outlives the call and nothing needs to be shut down. This costs a thread spawn per worker
//! per call; use [crate::Pooled] to amortize that across calls.

use crate::{
    fork::{self, Job},
    Error, Strategy,
};
use std::thread;
use tracing::{debug, warn};

/// Configuration for a [Spawned] strategy.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of workers spawned per call.
    ///
    /// Clamped to `[1, len]` for each call (`0` behaves like `1`).
    pub concurrency: usize,

    /// Prefix of worker thread names (workers are named `{name}-{id}`).
    pub name: String,

    /// Stack size of worker threads.
    ///
    /// If not set, the platform default is used.
    pub stack_size: Option<usize>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: thread::available_parallelism().map_or(1, |n| n.get()),
            name: "fanout".to_string(),
            stack_size: None,
        }
    }
}

/// A parallel execution strategy that spawns new threads for every call.
///
/// Workers repeatedly claim the next index from a shared [crate::Dispenser] and invoke the
/// callback without holding any lock, so only index bookkeeping is serialized. If a worker
/// cannot be spawned, the call continues with the workers it already has (or on the calling
/// thread if it has none).
///
/// # Examples
///
/// ```
/// use commonware_fanout::{Spawned, Strategy};
///
/// let strategy = Spawned::new(3);
/// let lengths = strategy.map(&["a", "bb", "ccc"], |s| s.len());
/// assert_eq!(lengths, vec![1, 2, 3]);
/// ```
#[derive(Clone, Debug)]
pub struct Spawned {
    cfg: Config,
}

impl Spawned {
    /// Creates a strategy that spawns up to `concurrency` workers per call.
    pub fn new(concurrency: usize) -> Self {
        Self::init(Config {
            concurrency,
            ..Default::default()
        })
    }

    /// Creates a strategy from the given [Config].
    pub fn init(cfg: Config) -> Self {
        Self { cfg }
    }

    fn builder(&self, id: usize) -> thread::Builder {
        let builder = thread::Builder::new().name(format!("{}-{id}", self.cfg.name));
        match self.cfg.stack_size {
            Some(size) => builder.stack_size(size),
            None => builder,
        }
    }
}

impl Default for Spawned {
    fn default() -> Self {
        Self::init(Config::default())
    }
}

impl Strategy for Spawned {
    fn workers(&self, len: usize) -> usize {
        fork::workers(self.cfg.concurrency, len)
    }

    fn try_for_range<F, E>(&self, count: usize, f: F) -> Result<(), Error<E>>
    where
        F: Fn(usize) -> Result<(), E> + Sync,
        E: Send,
    {
        let workers = self.workers(count);
        if workers == 0 {
            return Ok(());
        }

        let job = Job::new(count, &f);
        thread::scope(|scope| {
            let mut spawned = 0;
            for id in 0..workers {
                match self.builder(id).spawn_scoped(scope, || job.drain()) {
                    Ok(_) => spawned += 1,
                    Err(err) => {
                        warn!(?err, spawned, workers, "failed to spawn worker");
                        break;
                    }
                }
            }
            debug!(count, workers = spawned, "spawned workers");

            // Without any worker, the calling thread drains the job itself.
            if spawned == 0 {
                job.drain();
            }
        });
        job.finish()
    }

    fn try_map<T, R, F, E>(&self, items: &[T], f: F) -> Result<Vec<R>, Error<E>>
    where
        T: Sync,
        R: Default + Send,
        F: Fn(&T) -> Result<R, E> + Sync,
        E: Send,
    {
        fork::try_map(items, f, |len, write| self.try_for_range(len, write))
    }
}
