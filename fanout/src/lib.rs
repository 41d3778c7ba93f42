//! Fan work out across short-lived threads and throttle background tasks.
//!
//! This crate provides two primitives:
//!
//! - **Fork-join over an index domain**: the [`Strategy`] trait runs a callback on every index
//!   (or element) of a fixed-size domain and blocks until all of them are done. Algorithms can be
//!   written once and executed with any strategy.
//! - **Throttled background tasks**: the [`Gate`] runs up to `max_threads` tasks in the
//!   background and executes any further task on the submitting thread, slowing down a producer
//!   that outpaces its consumers without ever buffering work.
//!
//! # Strategies
//!
//! - [`Spawned`]: spawns fresh worker threads for every call and joins them before returning.
//!   This is the default behind the free functions ([`for_each_indexed`], [`for_each`],
//!   [`for_range`], [`map`]).
//! - [`Sequential`]: runs everything on the calling thread in index order. Useful for debugging
//!   and as the reference to compare parallel results against ([`serial`] exposes it with the
//!   same free-function signatures).
//! - [`Pooled`]: runs the same worker loop on a rayon thread pool (requires the `pool` feature,
//!   enabled by default).
//!
//! # Work Distribution
//!
//! Workers pull indices one at a time from a shared [`Dispenser`], so every index is visited
//! exactly once and slow callbacks never hold up the bookkeeping of other workers. The order
//! in which indices are visited (and by which worker) is unspecified.
//!
//! The requested concurrency is clamped to `[1, len]`: a concurrency of `0` still uses one
//! worker and no call spawns more workers than there are items. An empty domain is a no-op.
//!
//! # Failures
//!
//! A failing callback never stops the other workers. Every index is still visited, every worker
//! is joined, and the failure with the lowest index is surfaced afterwards (the same failure a
//! sequential run would stop at):
//!
//! - The infallible methods ([`Strategy::for_range`], [`Strategy::map`], ...) re-raise the
//!   callback's panic with its original payload.
//! - The fallible methods ([`Strategy::try_for_range`], [`Strategy::try_map`], ...) return an
//!   [`Error`] that records the index and either the callback's error or its panic.
//!
//! # Example
//!
//! ```
//! use commonware_fanout::{Sequential, Spawned, Strategy};
//!
//! fn squares<S: Strategy>(strategy: &S, data: &[u64]) -> Vec<u64> {
//!     strategy.map(data, |&x| x * x)
//! }
//!
//! let data: Vec<u64> = (0..100).collect();
//! assert_eq!(squares(&Spawned::new(4), &data), squares(&Sequential, &data));
//! ```

use cfg_if::cfg_if;
use core::fmt;
use std::convert::Infallible;

mod dispenser;
pub use dispenser::Dispenser;
mod error;
pub use error::{Error, Payload};
mod fork;
pub mod gate;
pub use gate::{Dispatch, Gate};
pub mod serial;
pub use serial::Sequential;
pub mod spawned;
pub use spawned::Spawned;
pub mod sync;

cfg_if! {
    if #[cfg(feature = "pool")] {
        mod pooled;
        pub use pooled::Pooled;
    }
}

/// A strategy for running a callback over every index of a fixed-size domain.
///
/// Every method blocks until the callback has been invoked exactly once per index (or element).
/// Callbacks may be invoked concurrently from several threads and must not rely on the order in
/// which indices are visited.
pub trait Strategy: Clone + Send + Sync + fmt::Debug + 'static {
    /// Number of workers a call over `len` items uses.
    fn workers(&self, len: usize) -> usize;

    /// Runs `f` on every index in `0..count`.
    ///
    /// If any invocation fails, the failure with the lowest index is returned once every
    /// index has been visited.
    ///
    /// # Examples
    ///
    /// ```
    /// use commonware_fanout::{Error, Sequential, Strategy};
    ///
    /// let result = Sequential.try_for_range(10, |i| if i == 3 { Err("three") } else { Ok(()) });
    /// assert!(matches!(result, Err(Error::Callback { index: 3, source: "three" })));
    /// ```
    fn try_for_range<F, E>(&self, count: usize, f: F) -> Result<(), Error<E>>
    where
        F: Fn(usize) -> Result<(), E> + Sync,
        E: Send;

    /// Maps every element of `items`, returning the results in input order.
    ///
    /// If any invocation fails, the failure with the lowest index is returned once every
    /// element has been visited.
    fn try_map<T, R, F, E>(&self, items: &[T], f: F) -> Result<Vec<R>, Error<E>>
    where
        T: Sync,
        R: Default + Send,
        F: Fn(&T) -> Result<R, E> + Sync,
        E: Send;

    /// Runs `f` on every element of `items` along with its index.
    fn try_for_each_indexed<T, F, E>(&self, items: &[T], f: F) -> Result<(), Error<E>>
    where
        T: Sync,
        F: Fn(usize, &T) -> Result<(), E> + Sync,
        E: Send,
    {
        self.try_for_range(items.len(), |index| f(index, &items[index]))
    }

    /// Runs `f` on every element of `items`.
    fn try_for_each<T, F, E>(&self, items: &[T], f: F) -> Result<(), Error<E>>
    where
        T: Sync,
        F: Fn(&T) -> Result<(), E> + Sync,
        E: Send,
    {
        self.try_for_range(items.len(), |index| f(&items[index]))
    }

    /// Runs `f` on every index in `0..count`.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of the lowest panicking index once every index has been visited.
    ///
    /// # Examples
    ///
    /// ```
    /// use commonware_fanout::{Spawned, Strategy};
    /// use std::sync::atomic::{AtomicUsize, Ordering};
    ///
    /// let sum = AtomicUsize::new(0);
    /// Spawned::new(4).for_range(100, |i| {
    ///     sum.fetch_add(i, Ordering::Relaxed);
    /// });
    /// assert_eq!(sum.into_inner(), 4950);
    /// ```
    fn for_range<F>(&self, count: usize, f: F)
    where
        F: Fn(usize) + Sync,
    {
        infallible(self.try_for_range(count, |index| {
            f(index);
            Ok(())
        }))
    }

    /// Runs `f` on every element of `items` along with its index.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of the lowest panicking index once every element has been visited.
    fn for_each_indexed<T, F>(&self, items: &[T], f: F)
    where
        T: Sync,
        F: Fn(usize, &T) + Sync,
    {
        self.for_range(items.len(), |index| f(index, &items[index]))
    }

    /// Runs `f` on every element of `items`.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of the lowest panicking index once every element has been visited.
    fn for_each<T, F>(&self, items: &[T], f: F)
    where
        T: Sync,
        F: Fn(&T) + Sync,
    {
        self.for_range(items.len(), |index| f(&items[index]))
    }

    /// Maps every element of `items`, returning the results in input order.
    ///
    /// # Panics
    ///
    /// Re-raises the panic of the lowest panicking index once every element has been visited.
    ///
    /// # Examples
    ///
    /// ```
    /// use commonware_fanout::{Spawned, Strategy};
    ///
    /// let doubled = Spawned::new(2).map(&[10, 20, 30, 40], |x| x * 2);
    /// assert_eq!(doubled, vec![20, 40, 60, 80]);
    /// ```
    fn map<T, R, F>(&self, items: &[T], f: F) -> Vec<R>
    where
        T: Sync,
        R: Default + Send,
        F: Fn(&T) -> R + Sync,
    {
        infallible(self.try_map(items, |item| Ok(f(item))))
    }
}

/// Unwraps the outcome of a call whose callbacks cannot return an error.
fn infallible<T>(result: Result<T, Error<Infallible>>) -> T {
    result.unwrap_or_else(|err| match err.resume() {})
}

/// Runs `f` on every element of `items` along with its index, using up to `concurrency`
/// freshly spawned threads.
///
/// `f` may be called concurrently and in any order. See [`Spawned`] for how `concurrency` is
/// clamped and how panics are reported.
pub fn for_each_indexed<T, F>(items: &[T], f: F, concurrency: usize)
where
    T: Sync,
    F: Fn(usize, &T) + Sync,
{
    Spawned::new(concurrency).for_each_indexed(items, f)
}

/// Runs `f` on every element of `items`, using up to `concurrency` freshly spawned threads.
pub fn for_each<T, F>(items: &[T], f: F, concurrency: usize)
where
    T: Sync,
    F: Fn(&T) + Sync,
{
    Spawned::new(concurrency).for_each(items, f)
}

/// Runs `f` on every index in `0..count`, using up to `concurrency` freshly spawned threads.
pub fn for_range<F>(count: usize, f: F, concurrency: usize)
where
    F: Fn(usize) + Sync,
{
    Spawned::new(concurrency).for_range(count, f)
}

/// Maps every element of `items` using up to `concurrency` freshly spawned threads, returning
/// the results in input order.
///
/// ```
/// let doubled = commonware_fanout::map(&[10, 20, 30, 40], |x| x * 2, 2);
/// assert_eq!(doubled, vec![20, 40, 60, 80]);
/// ```
pub fn map<T, R, F>(items: &[T], f: F, concurrency: usize) -> Vec<R>
where
    T: Sync,
    R: Default + Send,
    F: Fn(&T) -> R + Sync,
{
    Spawned::new(concurrency).map(items, f)
}
