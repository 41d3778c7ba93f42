//! Fork-join on a reusable rayon thread pool.

use crate::{
    fork::{self, Job},
    Error, Strategy,
};
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::sync::Arc;
use tracing::debug;

/// A parallel execution strategy backed by a rayon thread pool.
///
/// Runs the same worker loop as [crate::Spawned], but on threads of a pool that outlives the
/// call. Each call uses `min(pool threads, len)` workers.
///
/// # Thread Pool Ownership
///
/// `Pooled` holds an [`Arc<ThreadPool>`], so it can be cheaply cloned and shared across threads.
/// Multiple [`Pooled`] instances can share the same underlying thread pool.
///
/// # Examples
///
/// ```
/// use commonware_fanout::{Pooled, Strategy};
/// use rayon::ThreadPoolBuilder;
/// use std::sync::Arc;
///
/// let pool = Arc::new(ThreadPoolBuilder::new().num_threads(2).build().unwrap());
/// let strategy = Pooled::new(pool);
///
/// let data: Vec<i64> = (0..1000).collect();
/// let doubled = strategy.map(&data, |&n| n * 2);
/// assert_eq!(doubled[999], 1998);
/// ```
#[derive(Debug, Clone)]
pub struct Pooled {
    thread_pool: Arc<ThreadPool>,
}

impl Pooled {
    /// Creates a new [`Pooled`] strategy with the given [`ThreadPool`].
    pub const fn new(thread_pool: Arc<ThreadPool>) -> Self {
        Self { thread_pool }
    }

    /// Creates a new [`Pooled`] strategy with a dedicated pool of `threads` threads.
    pub fn with_threads(threads: usize) -> Result<Self, ThreadPoolBuildError> {
        let thread_pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|id| format!("fanout-pool-{id}"))
            .build()?;
        Ok(Self::new(Arc::new(thread_pool)))
    }
}

impl From<Arc<ThreadPool>> for Pooled {
    fn from(thread_pool: Arc<ThreadPool>) -> Self {
        Self::new(thread_pool)
    }
}

impl Strategy for Pooled {
    fn workers(&self, len: usize) -> usize {
        fork::workers(self.thread_pool.current_num_threads(), len)
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
        self.thread_pool.scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| job.drain());
            }
        });
        debug!(count, workers, "pooled call finished");
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
