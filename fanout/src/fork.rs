//! Worker loop shared by every multi-threaded strategy.
//!
//! A [Job] pairs a [Dispenser] with a callback. Workers call [Job::drain] until
//! the dispenser is exhausted and the caller collects the outcome with
//! [Job::finish] once every worker has been joined. How workers are launched
//! (fresh threads or a pool) is left to the strategy.

use crate::{
    error::{invoke, Error},
    Dispenser,
};
use std::{marker::PhantomData, sync::Mutex};
use tracing::debug;

/// Effective number of workers for a domain of `len` items.
///
/// Always at least one worker and never more workers than items. An empty
/// domain needs no workers at all.
pub(crate) fn workers(requested: usize, len: usize) -> usize {
    if len == 0 {
        return 0;
    }
    requested.clamp(1, len)
}

/// A single fork-join call.
pub(crate) struct Job<'a, F, E> {
    dispenser: Dispenser,
    work: &'a F,
    failure: Mutex<Option<Error<E>>>,
}

impl<'a, F, E> Job<'a, F, E>
where
    F: Fn(usize) -> Result<(), E> + Sync,
    E: Send,
{
    pub(crate) fn new(len: usize, work: &'a F) -> Self {
        Self {
            dispenser: Dispenser::new(len),
            work,
            failure: Mutex::new(None),
        }
    }

    /// Invoke the callback on dispensed indices until none remain.
    ///
    /// Failures are recorded and do not stop the worker: every index is
    /// visited regardless of what happened to the others.
    pub(crate) fn drain(&self) {
        while let Some(index) = self.dispenser.next() {
            if let Err(err) = invoke(index, || (self.work)(index)) {
                self.record(err);
            }
        }
    }

    fn record(&self, err: Error<E>) {
        debug!(index = err.index(), "callback failed");
        let mut failure = self.failure.lock().unwrap();
        match failure.as_ref() {
            Some(existing) if existing.index() < err.index() => {}
            _ => *failure = Some(err),
        }
    }

    /// Report the lowest-index failure, if any.
    ///
    /// Must only be called after every worker has returned from [Job::drain].
    pub(crate) fn finish(self) -> Result<(), Error<E>> {
        debug_assert!(self.dispenser.is_exhausted());
        match self.failure.into_inner().unwrap() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Output buffer written concurrently at disjoint indices.
struct Slots<'a, R> {
    ptr: *mut R,
    len: usize,
    _buffer: PhantomData<&'a mut [R]>,
}

// SAFETY: `Slots` only hands out writes through `Slots::write`, whose contract
// forbids two writes to the same index. Moving `R` values into the buffer from
// other threads requires `R: Send`.
unsafe impl<R: Send> Sync for Slots<'_, R> {}

impl<'a, R> Slots<'a, R> {
    fn new(buffer: &'a mut [R]) -> Self {
        Self {
            ptr: buffer.as_mut_ptr(),
            len: buffer.len(),
            _buffer: PhantomData,
        }
    }

    /// Store `value` at `index`, dropping the placeholder already there.
    ///
    /// # Safety
    ///
    /// No other call may write `index` for the lifetime of `self`.
    unsafe fn write(&self, index: usize, value: R) {
        assert!(index < self.len, "slot {index} out of bounds");
        *self.ptr.add(index) = value;
    }
}

/// Map `items` into a new vector, preserving input order.
///
/// `run` must execute its callback at most once per index in `[0, len)` (every
/// [Job] does, because each index is taken from a [Dispenser]).
pub(crate) fn try_map<T, R, E, F>(
    items: &[T],
    f: F,
    run: impl FnOnce(usize, &(dyn Fn(usize) -> Result<(), E> + Sync)) -> Result<(), Error<E>>,
) -> Result<Vec<R>, Error<E>>
where
    T: Sync,
    R: Default + Send,
    F: Fn(&T) -> Result<R, E> + Sync,
{
    let mut output: Vec<R> = std::iter::repeat_with(R::default)
        .take(items.len())
        .collect();
    {
        let slots = Slots::new(&mut output);
        let write = |index: usize| -> Result<(), E> {
            let value = f(&items[index])?;
            // SAFETY: `run` invokes this closure at most once per index, so
            // no two workers ever write the same slot.
            unsafe { slots.write(index, value) };
            Ok(())
        };
        run(items.len(), &write)?;
    }
    Ok(output)
}
