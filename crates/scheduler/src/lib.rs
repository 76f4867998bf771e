//! Reader Scheduler Library
//!
//! Cancellation primitives shared by the caches and loaders.
//!
//! Two independent mechanisms are provided:
//! - **Hard abort**: an [`AbortController`] aborts an [`AbortSignal`] that
//!   in-flight work observes, terminating I/O or render tasks immediately.
//! - **Cooperative epochs**: an [`EpochCounter`] hands out [`Epoch`] tokens;
//!   background work compares its captured token at each step boundary and
//!   discards its result once stale.
//!
//! Everything here is single-threaded; signals and counters live alongside
//! `Rc`-based caches on one executor.
//!
//! # Example
//!
//! ```
//! use reader_scheduler::{AbortController, EpochCounter};
//!
//! let epochs = EpochCounter::new();
//! let controller = AbortController::new();
//!
//! // Start background work
//! let captured = epochs.current();
//! let signal = controller.signal();
//!
//! // Supersede it
//! epochs.advance();
//! controller.abort();
//!
//! assert!(!epochs.is_current(captured));
//! assert!(signal.is_aborted());
//! ```

mod cancel;
mod epoch;

// Re-export public API
pub use cancel::{AbortController, AbortError, AbortSignal, Aborted, ListenerId};
pub use epoch::{yield_now, Epoch, EpochCounter, YieldNow};
