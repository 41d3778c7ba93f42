//! Run everything on the calling thread, in index order.
//!
//! [Sequential] (and the free functions in this module, which mirror the signatures of the
//! crate-level ones and ignore `concurrency`) is the deterministic baseline for debugging and
//! the oracle parallel results are compared against. Failures follow the same rules as the
//! parallel strategies: the first failing index is reported. Because indices run in order, no
//! index after the first failure is visited.

use crate::{error::invoke, Error, Strategy};

/// A sequential execution strategy.
///
/// # Examples
///
/// ```
/// use commonware_fanout::{Sequential, Strategy};
/// use std::sync::Mutex;
///
/// let order = Mutex::new(Vec::new());
/// Sequential.for_range(4, |i| order.lock().unwrap().push(i));
/// assert_eq!(order.into_inner().unwrap(), vec![0, 1, 2, 3]);
/// ```
#[derive(Default, Debug, Clone)]
pub struct Sequential;

impl Strategy for Sequential {
    fn workers(&self, len: usize) -> usize {
        len.min(1)
    }

    fn try_for_range<F, E>(&self, count: usize, f: F) -> Result<(), Error<E>>
    where
        F: Fn(usize) -> Result<(), E> + Sync,
        E: Send,
    {
        (0..count).try_for_each(|index| invoke(index, || f(index)))
    }

    fn try_map<T, R, F, E>(&self, items: &[T], f: F) -> Result<Vec<R>, Error<E>>
    where
        T: Sync,
        R: Default + Send,
        F: Fn(&T) -> Result<R, E> + Sync,
        E: Send,
    {
        items
            .iter()
            .enumerate()
            .map(|(index, item)| invoke(index, || f(item)))
            .collect()
    }
}

/// Runs `f` on every element of `items` along with its index, in order.
pub fn for_each_indexed<T, F>(items: &[T], f: F, _concurrency: usize)
where
    T: Sync,
    F: Fn(usize, &T) + Sync,
{
    Sequential.for_each_indexed(items, f)
}

/// Runs `f` on every element of `items`, in order.
pub fn for_each<T, F>(items: &[T], f: F, _concurrency: usize)
where
    T: Sync,
    F: Fn(&T) + Sync,
{
    Sequential.for_each(items, f)
}

/// Runs `f` on every index in `0..count`, in order.
pub fn for_range<F>(count: usize, f: F, _concurrency: usize)
where
    F: Fn(usize) + Sync,
{
    Sequential.for_range(count, f)
}

/// Maps every element of `items`, in order.
pub fn map<T, R, F>(items: &[T], f: F, _concurrency: usize) -> Vec<R>
where
    T: Sync,
    R: Default + Send,
    F: Fn(&T) -> R + Sync,
{
    Sequential.map(items, f)
}
