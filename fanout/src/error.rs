//! Failures surfaced by fork-join calls.

use std::{
    any::Any,
    fmt,
    panic::{resume_unwind, AssertUnwindSafe},
};
use thiserror::Error;

/// Payload carried by a panic.
pub type Payload = Box<dyn Any + Send + 'static>;

/// Failure of a callback invoked by a fork-join call.
///
/// When several callbacks fail during the same call, the failure with the
/// lowest index is reported. This is the same failure a sequential run over
/// `0..len` would stop at.
#[derive(Error)]
pub enum Error<E> {
    #[error("callback failed at index {index}")]
    Callback {
        index: usize,
        #[source]
        source: E,
    },
    #[error("callback panicked at index {index}: {}", panic_message(.payload))]
    Panicked { index: usize, payload: Payload },
}

impl<E> Error<E> {
    /// Index of the element whose callback failed.
    pub fn index(&self) -> usize {
        match self {
            Self::Callback { index, .. } | Self::Panicked { index, .. } => *index,
        }
    }

    /// Re-raise a captured panic, otherwise return the callback's error.
    pub fn resume(self) -> E {
        match self {
            Self::Callback { source, .. } => source,
            Self::Panicked { payload, .. } => resume_unwind(payload),
        }
    }
}

impl<E: fmt::Debug> fmt::Debug for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback { index, source } => f
                .debug_struct("Callback")
                .field("index", index)
                .field("source", source)
                .finish(),
            Self::Panicked { index, payload } => f
                .debug_struct("Panicked")
                .field("index", index)
                .field("message", &panic_message(payload))
                .finish(),
        }
    }
}

/// Describe a panic payload (most panics carry a `&str` or a `String`).
pub(crate) fn panic_message(payload: &Payload) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        format!("{payload:?}")
    }
}

/// Run the callback for `index`, capturing both returned errors and panics.
pub(crate) fn invoke<T, E>(
    index: usize,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, Error<E>> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(Error::Callback { index, source }),
        Err(payload) => Err(Error::Panicked { index, payload }),
    }
}
