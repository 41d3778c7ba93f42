//! Small helpers for sharing state with worker threads.

use crate::error::panic_message;
use std::{
    sync::Mutex,
    thread::{self, JoinHandle},
};
use tracing::error;

/// Returns a copy of the value protected by `lock`.
///
/// # Panics
///
/// Panics if the mutex is poisoned.
pub fn read_with_lock<T: Clone>(lock: &Mutex<T>) -> T {
    lock.lock().unwrap().clone()
}

/// Replaces the value protected by `lock` with `value`.
///
/// # Panics
///
/// Panics if the mutex is poisoned.
pub fn write_with_lock<T>(lock: &Mutex<T>, value: T) {
    *lock.lock().unwrap() = value;
}

/// Joins a thread when dropped.
///
/// If the thread panicked and the owner is not already unwinding, the panic is logged (the
/// payload cannot be re-raised from a destructor). Use [Joiner::join] to observe the thread's
/// result instead.
///
/// # Examples
///
/// ```
/// use commonware_fanout::sync::Joiner;
/// use std::sync::{atomic::{AtomicBool, Ordering}, Arc};
///
/// let done = Arc::new(AtomicBool::new(false));
/// {
///     let done = done.clone();
///     let _joiner = Joiner::new(std::thread::spawn(move || done.store(true, Ordering::SeqCst)));
/// }
/// assert!(done.load(Ordering::SeqCst));
/// ```
#[derive(Debug)]
pub struct Joiner<T> {
    handle: Option<JoinHandle<T>>,
}

impl<T> Joiner<T> {
    /// Wraps `handle`.
    pub fn new(handle: JoinHandle<T>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Joins the thread now, returning its result.
    pub fn join(mut self) -> thread::Result<T> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => unreachable!("handle taken before join"),
        }
    }
}

impl<T> From<JoinHandle<T>> for Joiner<T> {
    fn from(handle: JoinHandle<T>) -> Self {
        Self::new(handle)
    }
}

impl<T> Drop for Joiner<T> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let name = handle.thread().name().map(str::to_string);
        if let Err(payload) = handle.join() {
            if !thread::panicking() {
                error!(?name, err = panic_message(&payload), "joined thread panicked");
            }
        }
    }
}
