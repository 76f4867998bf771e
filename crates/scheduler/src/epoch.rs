//! Epoch counters for cooperative cancellation
//!
//! Background work captures the current [`Epoch`] when it starts and compares
//! it against the counter at every step boundary. Bumping the counter makes
//! all earlier captures stale; stale work discards its result instead of
//! applying it.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Generation token captured by background work
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(u64);

impl Epoch {
    /// Raw counter value
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing epoch counter
///
/// # Example
///
/// ```
/// use reader_scheduler::EpochCounter;
///
/// let counter = EpochCounter::new();
/// let captured = counter.current();
/// assert!(counter.is_current(captured));
///
/// counter.advance();
/// assert!(!counter.is_current(captured));
/// ```
#[derive(Debug, Default)]
pub struct EpochCounter {
    current: Cell<u64>,
}

impl EpochCounter {
    /// Create a counter starting at epoch 0
    pub fn new() -> Self {
        Self::default()
    }

    /// The epoch new work should capture
    pub fn current(&self) -> Epoch {
        Epoch(self.current.get())
    }

    /// Invalidate every earlier capture and return the new epoch
    pub fn advance(&self) -> Epoch {
        let next = self.current.get().wrapping_add(1);
        self.current.set(next);
        Epoch(next)
    }

    /// Check whether a captured epoch is still current
    pub fn is_current(&self, epoch: Epoch) -> bool {
        self.current.get() == epoch.0
    }
}

/// Yield once to the executor
///
/// Used at explicit step boundaries so that cancellation issued by another
/// task becomes observable between steps.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`]
#[must_use = "futures do nothing unless polled"]
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            return Poll::Ready(());
        }
        self.yielded = true;
        cx.waker().wake_by_ref();
        Poll::Pending
    }
}
