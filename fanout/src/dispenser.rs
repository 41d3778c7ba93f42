//! Hand out every index of a bounded domain exactly once.
//!
//! A [Dispenser] is the only coordination point between the workers of a
//! fork-join call: each worker repeatedly asks for the next index and stops once
//! the domain is exhausted. The check-and-advance is a single compare-and-swap,
//! so nothing is held while a worker processes the index it was handed.
//!
//! # Example
//!
//! ```
//! use commonware_fanout::Dispenser;
//!
//! let dispenser = Dispenser::new(2);
//! assert_eq!(dispenser.next(), Some(0));
//! assert_eq!(dispenser.next(), Some(1));
//! assert_eq!(dispenser.next(), None);
//! assert!(dispenser.is_exhausted());
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread-safe issuer of the indices `[0, len)`.
///
/// Every index is returned by exactly one call to [Dispenser::next], in
/// increasing order. Which thread receives which index is unspecified.
#[derive(Debug)]
pub struct Dispenser {
    cursor: AtomicUsize,
    len: usize,
}

impl Dispenser {
    /// Create a dispenser over `[0, len)`.
    pub const fn new(len: usize) -> Self {
        Self {
            cursor: AtomicUsize::new(0),
            len,
        }
    }

    /// Claim the next index, or `None` if every index has been handed out.
    ///
    /// The cursor never moves past `len`, so repeated calls after exhaustion
    /// are cheap and never overflow.
    #[allow(clippy::should_implement_trait)]
    #[inline]
    pub fn next(&self) -> Option<usize> {
        let len = self.len;
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cursor| {
                (cursor < len).then_some(cursor + 1)
            })
            .ok()
    }

    /// Size of the domain.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the domain is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of indices handed out so far.
    pub fn dispensed(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    /// Returns `true` once every index has been handed out.
    pub fn is_exhausted(&self) -> bool {
        self.dispensed() == self.len
    }
}
