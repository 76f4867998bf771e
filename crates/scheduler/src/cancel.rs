//! Abort signals for hard cancellation
//!
//! An [`AbortController`] owns the right to cancel; the [`AbortSignal`]s it
//! hands out let in-flight work observe the cancellation, either by polling
//! [`AbortSignal::is_aborted`], by subscribing a listener, or by awaiting
//! [`AbortSignal::aborted`].
//!
//! Signals are single-threaded (`!Send`): listeners may capture `Rc` state
//! belonging to the cache that started the work.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use thiserror::Error;

/// Error returned by work that stopped because its signal was aborted
///
/// Kept distinct from other failures so callers can suppress user-visible
/// error UI for cancelled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation was aborted")]
pub struct AbortError;

/// Identifies a listener registered with [`AbortSignal::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnOnce()>;

struct SignalState {
    aborted: Cell<bool>,
    next_listener: Cell<u64>,
    listeners: RefCell<Vec<(ListenerId, Listener)>>,
    wakers: RefCell<Vec<Waker>>,
}

/// Read side of an abort controller
///
/// Cloning a signal is cheap; every clone observes the same state.
///
/// # Example
///
/// ```
/// use reader_scheduler::AbortController;
///
/// let controller = AbortController::new();
/// let signal = controller.signal();
/// assert!(signal.check().is_ok());
///
/// controller.abort();
/// assert!(signal.is_aborted());
/// assert!(signal.check().is_err());
/// ```
#[derive(Clone)]
pub struct AbortSignal {
    state: Rc<SignalState>,
}

impl AbortSignal {
    fn new() -> Self {
        Self {
            state: Rc::new(SignalState {
                aborted: Cell::new(false),
                next_listener: Cell::new(0),
                listeners: RefCell::new(Vec::new()),
                wakers: RefCell::new(Vec::new()),
            }),
        }
    }

    /// A signal with no controller; it is never aborted
    pub fn never() -> Self {
        Self::new()
    }

    /// Check if the owning controller has aborted
    pub fn is_aborted(&self) -> bool {
        self.state.aborted.get()
    }

    /// Fail fast with [`AbortError`] when already aborted
    ///
    /// Work that accepts a signal calls this before starting so an
    /// already-aborted signal fails synchronously.
    pub fn check(&self) -> Result<(), AbortError> {
        if self.is_aborted() {
            Err(AbortError)
        } else {
            Ok(())
        }
    }

    /// Register a callback to run once when the signal is aborted
    ///
    /// If the signal is already aborted the callback runs immediately and the
    /// returned id refers to nothing.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: FnOnce() + 'static,
    {
        let id = ListenerId(self.state.next_listener.get());
        self.state.next_listener.set(id.0 + 1);

        if self.is_aborted() {
            listener();
        } else {
            self.state.listeners.borrow_mut().push((id, Box::new(listener)));
        }
        id
    }

    /// Remove a listener registered with [`subscribe`](Self::subscribe)
    ///
    /// Returns `true` if the listener was still registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.state.listeners.borrow_mut();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Number of listeners still waiting for an abort
    pub fn listener_count(&self) -> usize {
        self.state.listeners.borrow().len()
    }

    /// Future that resolves once the signal is aborted
    pub fn aborted(&self) -> Aborted {
        Aborted {
            signal: self.clone(),
        }
    }

    fn fire(&self) -> bool {
        if self.state.aborted.replace(true) {
            return false;
        }

        // Listeners may subscribe, unsubscribe or abort again; never hold the
        // borrow while they run.
        let listeners = std::mem::take(&mut *self.state.listeners.borrow_mut());
        for (_, listener) in listeners {
            listener();
        }

        let wakers = std::mem::take(&mut *self.state.wakers.borrow_mut());
        for waker in wakers {
            waker.wake();
        }
        true
    }
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::never()
    }
}

impl fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AbortSignal")
            .field("aborted", &self.is_aborted())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Future returned by [`AbortSignal::aborted`]
#[must_use = "futures do nothing unless polled"]
pub struct Aborted {
    signal: AbortSignal,
}

impl Future for Aborted {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.signal.is_aborted() {
            return Poll::Ready(());
        }

        let mut wakers = self.signal.state.wakers.borrow_mut();
        if !wakers.iter().any(|w| w.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

/// Write side of an abort signal
///
/// # Example
///
/// ```
/// use std::cell::Cell;
/// use std::rc::Rc;
/// use reader_scheduler::AbortController;
///
/// let controller = AbortController::new();
/// let fired = Rc::new(Cell::new(false));
///
/// let flag = fired.clone();
/// controller.signal().subscribe(move || flag.set(true));
///
/// assert!(controller.abort());
/// assert!(fired.get());
///
/// // Aborting is idempotent
/// assert!(!controller.abort());
/// ```
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    signal: AbortSignal,
}

impl AbortController {
    /// Create a controller whose signal starts non-aborted
    pub fn new() -> Self {
        Self {
            signal: AbortSignal::new(),
        }
    }

    /// Get a signal observing this controller
    pub fn signal(&self) -> AbortSignal {
        self.signal.clone()
    }

    /// Abort the signal, running listeners and waking waiters
    ///
    /// Returns `true` the first time, `false` if already aborted.
    pub fn abort(&self) -> bool {
        self.signal.fire()
    }

    /// Check if this controller has aborted
    pub fn is_aborted(&self) -> bool {
        self.signal.is_aborted()
    }
}
