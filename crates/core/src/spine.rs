//! Spine section loading with a bounded working set
//!
//! A [`SpineLoader`] keeps recently loaded document sections in memory up to
//! `max_loaded_sections`, unloading the least recently used section that is
//! not pinned. Pins are counted per section index so independent holders
//! ("currently displayed", "adjacent prefetch target") compose.
//!
//! Prefetch walks neighbours outward from a section and loads them one at a
//! time. Starting a new prefetch (or calling
//! [`SpineLoader::cancel_prefetch`]) aborts the running pass and makes its
//! remaining steps record `None`.
//!
//! A section load runs under its own signal, shared by every caller waiting
//! on it. A caller whose signal aborts only stops waiting; the load itself is
//! aborted once no caller is left, so a displayed section that joined a
//! prefetch load survives the prefetch being cancelled.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use futures::future::{self, Either, LocalBoxFuture, Shared};
use futures::FutureExt;
use reader_cache::{CacheConfig, CacheError, KeyQueue};
use reader_scheduler::{
    yield_now, AbortController, AbortError, AbortSignal, Epoch, EpochCounter, ListenerId,
};
use thiserror::Error;

/// Content-loading function handed to [`SpineSection::load`]
///
/// Receives the section's href and the caller's abort signal.
pub type RequestFn<D> = Rc<dyn Fn(&str, &AbortSignal) -> LocalBoxFuture<'static, Result<D, CacheError>>>;

/// A section of the book's reading order
pub trait SpineSection: Clone + 'static {
    /// Loaded representation of the section
    type Document: Clone + 'static;

    /// Position in the spine
    fn index(&self) -> usize;

    /// Following linear section, if any
    fn next(&self) -> Option<Self>;

    /// Preceding linear section, if any
    fn prev(&self) -> Option<Self>;

    /// Load the section's document through `request`
    fn load(
        &self,
        request: &RequestFn<Self::Document>,
        signal: &AbortSignal,
    ) -> LocalBoxFuture<'static, Result<Self::Document, CacheError>>;

    /// Drop the loaded document
    fn unload(&self);
}

/// Errors returned by [`SpineLoader::load`]
#[derive(Debug, Clone, Error)]
pub enum SpineError {
    /// The load was cancelled
    #[error(transparent)]
    Aborted(#[from] AbortError),

    /// The section failed to load
    #[error("section load failed: {0}")]
    Load(CacheError),
}

impl SpineError {
    /// Returns true for cancellations
    pub fn is_abort(&self) -> bool {
        match self {
            SpineError::Aborted(_) => true,
            SpineError::Load(err) => err.is_abort(),
        }
    }
}

impl From<CacheError> for SpineError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Aborted(abort) => SpineError::Aborted(abort),
            other => SpineError::Load(other),
        }
    }
}

type SectionLoad<D> = Shared<LocalBoxFuture<'static, Result<D, SpineError>>>;

/// A running section load and the callers still waiting on it
struct InFlight<D> {
    id: u64,
    load: SectionLoad<D>,
    controller: AbortController,
    waiters: usize,
}

struct SpineState<S: SpineSection> {
    /// Loaded sections by index
    loaded: HashMap<usize, S>,

    /// Load order, most recently used at the back
    order: KeyQueue<usize>,

    /// Pin counts by index
    pinned: HashMap<usize, usize>,

    /// Loads still running, shared by concurrent callers
    in_flight: HashMap<usize, InFlight<S::Document>>,

    next_load: u64,

    max_loaded: Option<usize>,

    prefetch_distance: usize,

    /// Controller of the running prefetch pass
    prefetch: Option<AbortController>,
}

struct SpineInner<S: SpineSection> {
    state: RefCell<SpineState<S>>,
    request: RequestFn<S::Document>,
    epochs: EpochCounter,
}

/// Loader for spine sections with pinning and neighbour prefetch
///
/// Cloning the loader clones a handle to the same working set.
pub struct SpineLoader<S: SpineSection> {
    inner: Rc<SpineInner<S>>,
}

impl<S: SpineSection> Clone for SpineLoader<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: SpineSection> SpineLoader<S> {
    /// Create a loader
    ///
    /// # Arguments
    ///
    /// * `request` - Function used by sections to fetch their content
    /// * `max_loaded` - Working-set cap; `None` keeps every loaded section
    pub fn new(request: RequestFn<S::Document>, max_loaded: Option<usize>) -> Self {
        Self {
            inner: Rc::new(SpineInner {
                state: RefCell::new(SpineState {
                    loaded: HashMap::new(),
                    order: KeyQueue::new(),
                    pinned: HashMap::new(),
                    in_flight: HashMap::new(),
                    next_load: 0,
                    max_loaded,
                    prefetch_distance: 1,
                    prefetch: None,
                }),
                request,
                epochs: EpochCounter::new(),
            }),
        }
    }

    /// Create a loader using the working-set cap and prefetch distance from
    /// `config`
    pub fn from_config(request: RequestFn<S::Document>, config: &CacheConfig) -> Self {
        let loader = Self::new(request, config.max_loaded_sections);
        loader.inner.state.borrow_mut().prefetch_distance = config.prefetch_distance;
        loader
    }

    /// Load a section and mark it most recently used
    ///
    /// Fails immediately with [`SpineError::Aborted`] if `signal` is already
    /// aborted. Concurrent loads of the same section share one request; an
    /// abort of `signal` detaches this caller, and the request is aborted
    /// when its last caller detaches.
    pub fn load(
        &self,
        section: &S,
        signal: &AbortSignal,
    ) -> LocalBoxFuture<'static, Result<S::Document, SpineError>> {
        if let Err(abort) = signal.check() {
            return future::ready(Err(SpineError::Aborted(abort))).boxed_local();
        }

        let index = section.index();
        let joined = self
            .inner
            .state
            .borrow_mut()
            .in_flight
            .get_mut(&index)
            .map(|flight| {
                flight.waiters += 1;
                (flight.id, flight.load.clone())
            });
        let (id, load) = match joined {
            Some(joined) => joined,
            None => self.start_load(section),
        };

        let waiter = LoadWaiter::<S>::new(Rc::downgrade(&self.inner), index, id, signal);
        let signal = signal.clone();
        async move {
            let _waiter = waiter;
            match future::select(load, signal.aborted()).await {
                Either::Left((result, _)) => result,
                Either::Right(_) => Err(SpineError::Aborted(AbortError)),
            }
        }
        .boxed_local()
    }

    fn start_load(&self, section: &S) -> (u64, SectionLoad<S::Document>) {
        let index = section.index();
        let controller = AbortController::new();
        let loading = section.load(&self.inner.request, &controller.signal());
        let weak = Rc::downgrade(&self.inner);
        let section = section.clone();

        let id = {
            let mut state = self.inner.state.borrow_mut();
            state.next_load += 1;
            state.next_load
        };

        let load = async move {
            let result = loading.await.map_err(SpineError::from);
            Self::finish_load(&weak, id, section, result.is_ok());
            result
        }
        .boxed_local()
        .shared();

        self.inner.state.borrow_mut().in_flight.insert(
            index,
            InFlight {
                id,
                load: load.clone(),
                controller,
                waiters: 1,
            },
        );
        (id, load)
    }

    /// Drop one caller from load `id`, aborting it when none remain
    fn detach(weak: &Weak<SpineInner<S>>, index: usize, id: u64, detached: &Cell<bool>) {
        if detached.replace(true) {
            return;
        }
        let Some(inner) = weak.upgrade() else {
            return;
        };

        let abandoned = {
            let mut state = inner.state.borrow_mut();
            match state.in_flight.get_mut(&index) {
                Some(flight) if flight.id == id => {
                    flight.waiters -= 1;
                    if flight.waiters == 0 {
                        state.in_flight.remove(&index)
                    } else {
                        None
                    }
                }
                _ => None,
            }
        };

        if let Some(flight) = abandoned {
            tracing::debug!(index, "no callers left; aborting section load");
            flight.controller.abort();
        }
    }

    fn finish_load(weak: &Weak<SpineInner<S>>, id: u64, section: S, loaded: bool) {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let loader = SpineLoader { inner };
        let index = section.index();

        let finished = {
            let mut state = loader.inner.state.borrow_mut();
            let current = state
                .in_flight
                .get(&index)
                .is_some_and(|flight| flight.id == id);
            let finished = if current {
                state.in_flight.remove(&index)
            } else {
                None
            };
            if loaded {
                state.order.push_back(index);
                state.loaded.insert(index, section);
            }
            finished
        };
        drop(finished);

        if loaded {
            loader.enforce_budget(Some(index));
        }
    }

    /// Unload least recently used sections until the working set fits
    ///
    /// `keep` is never chosen; pinned sections are skipped.
    fn enforce_budget(&self, keep: Option<usize>) {
        let evicted = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let Some(max) = state.max_loaded else {
                return;
            };

            let excess = state.loaded.len().saturating_sub(max);
            let victims: Vec<usize> = state
                .order
                .iter()
                .copied()
                .filter(|index| Some(*index) != keep && !state.pinned.contains_key(index))
                .take(excess)
                .collect();

            victims
                .into_iter()
                .filter_map(|index| {
                    state.order.remove(&index);
                    state.loaded.remove(&index)
                })
                .collect::<Vec<_>>()
        };

        for section in evicted {
            tracing::debug!(index = section.index(), "unloading section");
            section.unload();
        }
    }

    /// Add a pin to a section; pinned sections are never evicted
    pub fn pin(&self, section: &S) {
        let mut state = self.inner.state.borrow_mut();
        *state.pinned.entry(section.index()).or_insert(0) += 1;
    }

    /// Remove one pin from a section
    ///
    /// When the last pin goes and the working set is over budget, the
    /// least recently used unpinned sections are unloaded.
    pub fn unpin(&self, section: &S) {
        let index = section.index();
        {
            let mut state = self.inner.state.borrow_mut();
            let Some(count) = state.pinned.get_mut(&index) else {
                return;
            };
            *count -= 1;
            if *count > 0 {
                return;
            }
            state.pinned.remove(&index);
        }
        self.enforce_budget(None);
    }

    /// Check if a section has at least one pin
    pub fn is_pinned(&self, section: &S) -> bool {
        self.inner.state.borrow().pinned.contains_key(&section.index())
    }

    /// Number of pins on a section index
    pub fn pin_count(&self, index: usize) -> usize {
        self.inner
            .state
            .borrow()
            .pinned
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    /// Check if a section index is in the working set
    pub fn is_loaded(&self, index: usize) -> bool {
        self.inner.state.borrow().loaded.contains_key(&index)
    }

    /// Loaded indices, least recently used first
    pub fn loaded_indices(&self) -> Vec<usize> {
        self.inner.state.borrow().order.iter().copied().collect()
    }

    /// Unload one unpinned section
    ///
    /// Returns `false` if the section is pinned or not loaded.
    pub fn unload(&self, index: usize) -> bool {
        let section = {
            let mut state = self.inner.state.borrow_mut();
            if state.pinned.contains_key(&index) {
                return false;
            }
            state.order.remove(&index);
            state.loaded.remove(&index)
        };

        match section {
            Some(section) => {
                section.unload();
                true
            }
            None => false,
        }
    }

    /// Cancel prefetch, unload every section and drop all pins
    pub fn unload_all(&self) {
        self.cancel_prefetch();
        let sections: Vec<S> = {
            let mut state = self.inner.state.borrow_mut();
            state.order.clear();
            state.pinned.clear();
            state.loaded.drain().map(|(_, section)| section).collect()
        };
        for section in sections {
            section.unload();
        }
    }

    /// Change the working-set cap, unloading sections over the new bound
    pub fn set_max_loaded_sections(&self, max_loaded: Option<usize>) {
        self.inner.state.borrow_mut().max_loaded = max_loaded;
        self.enforce_budget(None);
    }

    /// Configured prefetch distance
    pub fn prefetch_distance(&self) -> usize {
        self.inner.state.borrow().prefetch_distance
    }

    /// Epoch that a prefetch started now would capture
    pub fn current_epoch(&self) -> Epoch {
        self.inner.epochs.current()
    }

    /// Abort the running prefetch pass and invalidate its epoch
    ///
    /// Returns the new epoch.
    pub fn cancel_prefetch(&self) -> Epoch {
        let running = self.inner.state.borrow_mut().prefetch.take();
        if let Some(controller) = running {
            controller.abort();
        }
        self.inner.epochs.advance()
    }

    /// Neighbours of `section` in prefetch order: next, prev, next+1, ...
    fn neighbors(section: &S, distance: usize) -> Vec<S> {
        let mut candidates = Vec::with_capacity(distance * 2);
        let mut next = section.next();
        let mut prev = section.prev();

        for _ in 0..distance {
            if let Some(section) = next.take() {
                next = section.next();
                candidates.push(section);
            }
            if let Some(section) = prev.take() {
                prev = section.prev();
                candidates.push(section);
            }
        }
        candidates
    }

    /// Load up to `2 × distance` neighbours of `section`, one at a time
    ///
    /// Any earlier prefetch is cancelled first. The result has one slot per
    /// candidate in prefetch order; candidates that failed, or that were
    /// reached after this pass went stale, hold `None`.
    pub fn prefetch(
        &self,
        section: &S,
        distance: usize,
    ) -> LocalBoxFuture<'static, Vec<Option<S::Document>>> {
        let candidates = Self::neighbors(section, distance);
        let epoch = self.cancel_prefetch();
        let controller = AbortController::new();
        self.inner.state.borrow_mut().prefetch = Some(controller.clone());

        let loader = self.clone();
        async move {
            let signal = controller.signal();
            let mut results = Vec::with_capacity(candidates.len());

            for candidate in candidates {
                yield_now().await;
                if !loader.inner.epochs.is_current(epoch) {
                    results.push(None);
                    continue;
                }

                match loader.load(&candidate, &signal).await {
                    Ok(document) if loader.inner.epochs.is_current(epoch) => {
                        results.push(Some(document));
                    }
                    Ok(_) => results.push(None),
                    Err(err) => {
                        tracing::debug!(
                            index = candidate.index(),
                            error = %err,
                            "prefetch candidate skipped"
                        );
                        results.push(None);
                    }
                }
            }
            results
        }
        .boxed_local()
    }

    /// Prefetch using the configured distance
    pub fn prefetch_adjacent(&self, section: &S) -> LocalBoxFuture<'static, Vec<Option<S::Document>>> {
        let distance = self.prefetch_distance();
        self.prefetch(section, distance)
    }
}

/// One caller's interest in a shared section load
///
/// Detaches from the load when the caller's signal aborts or when the
/// caller's future is dropped, whichever comes first.
struct LoadWaiter<S: SpineSection> {
    loader: Weak<SpineInner<S>>,
    index: usize,
    id: u64,
    signal: AbortSignal,
    listener: ListenerId,
    detached: Rc<Cell<bool>>,
}

impl<S: SpineSection> LoadWaiter<S> {
    fn new(loader: Weak<SpineInner<S>>, index: usize, id: u64, signal: &AbortSignal) -> Self {
        let detached = Rc::new(Cell::new(false));
        let listener = {
            let loader = loader.clone();
            let detached = detached.clone();
            signal.subscribe(move || SpineLoader::detach(&loader, index, id, &detached))
        };

        Self {
            loader,
            index,
            id,
            signal: signal.clone(),
            listener,
            detached,
        }
    }
}

impl<S: SpineSection> Drop for LoadWaiter<S> {
    fn drop(&mut self) {
        self.signal.unsubscribe(self.listener);
        SpineLoader::detach(&self.loader, self.index, self.id, &self.detached);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::oneshot;
    use futures::future::Either;
    use std::collections::HashSet;

    #[derive(Default)]
    struct TestBook {
        len: usize,
        loads: RefCell<Vec<usize>>,
        unloads: RefCell<Vec<usize>>,
        failing: RefCell<HashSet<String>>,
        gates: RefCell<HashMap<String, oneshot::Receiver<()>>>,
    }

    #[derive(Clone)]
    struct TestSection {
        index: usize,
        book: Rc<TestBook>,
    }

    impl TestSection {
        fn href(&self) -> String {
            format!("s{}", self.index)
        }
    }

    impl SpineSection for TestSection {
        type Document = String;

        fn index(&self) -> usize {
            self.index
        }

        fn next(&self) -> Option<Self> {
            (self.index + 1 < self.book.len).then(|| TestSection {
                index: self.index + 1,
                book: self.book.clone(),
            })
        }

        fn prev(&self) -> Option<Self> {
            self.index.checked_sub(1).map(|index| TestSection {
                index,
                book: self.book.clone(),
            })
        }

        fn load(
            &self,
            request: &RequestFn<String>,
            signal: &AbortSignal,
        ) -> LocalBoxFuture<'static, Result<String, CacheError>> {
            self.book.loads.borrow_mut().push(self.index);
            request(&self.href(), signal)
        }

        fn unload(&self) {
            self.book.unloads.borrow_mut().push(self.index);
        }
    }

    async fn fetch(
        href: String,
        signal: AbortSignal,
        gate: Option<oneshot::Receiver<()>>,
        failing: bool,
    ) -> Result<String, CacheError> {
        signal.check()?;
        if let Some(gate) = gate {
            if let Either::Right(_) = future::select(gate, signal.aborted()).await {
                return Err(AbortError.into());
            }
        }
        if failing {
            return Err(CacheError::creation(anyhow::anyhow!("missing {href}")));
        }
        Ok(format!("<{href}>"))
    }

    fn setup(len: usize, max_loaded: Option<usize>) -> (SpineLoader<TestSection>, Rc<TestBook>) {
        let book = Rc::new(TestBook {
            len,
            ..Default::default()
        });
        let requests = book.clone();
        let request: RequestFn<String> = Rc::new(move |href: &str, signal: &AbortSignal| {
            let gate = requests.gates.borrow_mut().remove(href);
            let failing = requests.failing.borrow().contains(href);
            fetch(href.to_string(), signal.clone(), gate, failing).boxed_local()
        });
        (SpineLoader::new(request, max_loaded), book)
    }

    fn section(book: &Rc<TestBook>, index: usize) -> TestSection {
        TestSection {
            index,
            book: book.clone(),
        }
    }

    #[tokio::test]
    async fn test_load_returns_document() {
        let (loader, book) = setup(5, None);

        let doc = loader
            .load(&section(&book, 2), &AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(doc, "<s2>");
        assert!(loader.is_loaded(2));
        assert_eq!(*book.loads.borrow(), vec![2]);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let (loader, book) = setup(5, Some(2));
        let signal = AbortSignal::never();

        for index in 0..3 {
            loader.load(&section(&book, index), &signal).await.unwrap();
        }

        assert_eq!(loader.loaded_indices(), vec![1, 2]);
        assert_eq!(*book.unloads.borrow(), vec![0]);
    }

    #[tokio::test]
    async fn test_reload_moves_to_most_recent() {
        let (loader, book) = setup(5, Some(2));
        let signal = AbortSignal::never();

        loader.load(&section(&book, 0), &signal).await.unwrap();
        loader.load(&section(&book, 1), &signal).await.unwrap();
        loader.load(&section(&book, 0), &signal).await.unwrap();
        loader.load(&section(&book, 2), &signal).await.unwrap();

        assert_eq!(loader.loaded_indices(), vec![0, 2]);
        assert_eq!(*book.unloads.borrow(), vec![1]);
    }

    #[tokio::test]
    async fn test_pinned_section_never_evicted() {
        let (loader, book) = setup(5, Some(2));
        let signal = AbortSignal::never();
        let first = section(&book, 0);

        loader.pin(&first);
        for index in 0..4 {
            loader.load(&section(&book, index), &signal).await.unwrap();
        }

        assert!(loader.is_loaded(0));
        assert_eq!(loader.loaded_indices(), vec![0, 3]);
        assert_eq!(*book.unloads.borrow(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_pin_counts_compose() {
        let (loader, book) = setup(5, Some(1));
        let signal = AbortSignal::never();
        let first = section(&book, 0);

        loader.pin(&first);
        loader.pin(&first);
        assert_eq!(loader.pin_count(0), 2);

        loader.load(&first, &signal).await.unwrap();
        loader.load(&section(&book, 1), &signal).await.unwrap();
        assert_eq!(loader.loaded_indices(), vec![0, 1]);

        loader.unpin(&first);
        assert!(loader.is_pinned(&first));
        assert!(loader.is_loaded(0));

        // Last pin gone: the working set shrinks back to its cap
        loader.unpin(&first);
        assert!(!loader.is_pinned(&first));
        assert_eq!(loader.loaded_indices(), vec![1]);

        // Unpinning an unpinned section is a no-op
        loader.unpin(&first);
        assert_eq!(loader.pin_count(0), 0);
    }

    #[tokio::test]
    async fn test_aborted_signal_fails_before_work() {
        let (loader, book) = setup(5, None);
        let controller = AbortController::new();
        controller.abort();

        let result = loader
            .load(&section(&book, 1), &controller.signal())
            .now_or_never()
            .expect("aborted load completes synchronously");

        assert!(matches!(result, Err(SpineError::Aborted(_))));
        assert!(book.loads.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_loads_share_request() {
        let (loader, book) = setup(5, None);
        let signal = AbortSignal::never();

        let (a, b) = futures::join!(
            loader.load(&section(&book, 3), &signal),
            loader.load(&section(&book, 3), &signal)
        );

        assert_eq!(a.unwrap(), "<s3>");
        assert_eq!(b.unwrap(), "<s3>");
        assert_eq!(*book.loads.borrow(), vec![3]);
    }

    #[tokio::test]
    async fn test_failed_load_not_tracked() {
        let (loader, book) = setup(5, None);
        book.failing.borrow_mut().insert("s1".to_string());

        let result = loader.load(&section(&book, 1), &AbortSignal::never()).await;
        assert!(matches!(result, Err(SpineError::Load(_))));
        assert!(!result.unwrap_err().is_abort());
        assert!(!loader.is_loaded(1));
    }

    #[tokio::test]
    async fn test_prefetch_alternates_neighbours() {
        let (loader, book) = setup(10, None);

        let results = loader.prefetch(&section(&book, 5), 2).await;

        assert_eq!(
            results,
            vec![
                Some("<s6>".to_string()),
                Some("<s4>".to_string()),
                Some("<s7>".to_string()),
                Some("<s3>".to_string()),
            ]
        );
        assert_eq!(*book.loads.borrow(), vec![6, 4, 7, 3]);
    }

    #[tokio::test]
    async fn test_prefetch_at_spine_edge() {
        let (loader, book) = setup(3, None);

        let results = loader.prefetch(&section(&book, 0), 3).await;
        assert_eq!(results, vec![Some("<s1>".to_string()), Some("<s2>".to_string())]);
    }

    #[tokio::test]
    async fn test_prefetch_swallows_candidate_failure() {
        let (loader, book) = setup(10, None);
        book.failing.borrow_mut().insert("s4".to_string());

        let results = loader.prefetch(&section(&book, 5), 1).await;
        assert_eq!(results, vec![Some("<s6>".to_string()), None]);
    }

    #[tokio::test]
    async fn test_cancelled_prefetch_discards_everything() {
        let (loader, book) = setup(10, None);
        let before = loader.current_epoch();

        let pass = loader.prefetch(&section(&book, 5), 3);
        let epoch = loader.cancel_prefetch();
        assert!(epoch > before);

        let results = pass.await;
        assert_eq!(results, vec![None; 6]);
        assert!(book.loads.borrow().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_aborts_in_flight_candidate() {
        let (loader, book) = setup(10, None);
        let (_gate, rx) = oneshot::channel();
        book.gates.borrow_mut().insert("s6".to_string(), rx);

        let mut pass = loader.prefetch(&section(&book, 5), 1);
        // First poll yields, second starts the gated request for s6
        assert!((&mut pass).now_or_never().is_none());
        assert!((&mut pass).now_or_never().is_none());
        assert_eq!(*book.loads.borrow(), vec![6]);

        loader.cancel_prefetch();
        let results = pass.await;

        assert_eq!(results, vec![None, None]);
        assert_eq!(*book.loads.borrow(), vec![6]);
        assert!(!loader.is_loaded(6));
    }

    #[tokio::test]
    async fn test_display_load_survives_prefetch_cancel() {
        let (loader, book) = setup(10, None);
        let (gate, rx) = oneshot::channel();
        book.gates.borrow_mut().insert("s6".to_string(), rx);

        let mut pass = loader.prefetch(&section(&book, 5), 1);
        assert!((&mut pass).now_or_never().is_none());
        assert!((&mut pass).now_or_never().is_none());

        // The displayed section joins the prefetch's request for s6
        let mut display = loader.load(&section(&book, 6), &AbortSignal::never());
        assert!((&mut display).now_or_never().is_none());

        loader.cancel_prefetch();
        assert!((&mut display).now_or_never().is_none());

        gate.send(()).unwrap();
        assert_eq!(display.await.unwrap(), "<s6>");
        assert_eq!(*book.loads.borrow(), vec![6]);
        assert!(loader.is_loaded(6));

        assert_eq!(pass.await, vec![None, None]);
    }

    #[tokio::test]
    async fn test_aborted_caller_detaches_from_shared_load() {
        let (loader, book) = setup(10, None);
        let (gate, rx) = oneshot::channel();
        book.gates.borrow_mut().insert("s3".to_string(), rx);
        let controller = AbortController::new();

        let mut first = loader.load(&section(&book, 3), &controller.signal());
        let mut second = loader.load(&section(&book, 3), &AbortSignal::never());
        assert!((&mut first).now_or_never().is_none());
        assert!((&mut second).now_or_never().is_none());

        controller.abort();
        assert!(matches!(first.await, Err(SpineError::Aborted(_))));

        gate.send(()).unwrap();
        assert_eq!(second.await.unwrap(), "<s3>");
        assert_eq!(*book.loads.borrow(), vec![3]);
    }

    #[tokio::test]
    async fn test_dropped_last_caller_aborts_load() {
        let (loader, book) = setup(10, None);
        let (_gate, rx) = oneshot::channel();
        book.gates.borrow_mut().insert("s2".to_string(), rx);

        let mut first = loader.load(&section(&book, 2), &AbortSignal::never());
        assert!((&mut first).now_or_never().is_none());
        drop(first);

        // The abandoned request is gone; a new caller starts a fresh one
        let doc = loader
            .load(&section(&book, 2), &AbortSignal::never())
            .await
            .unwrap();
        assert_eq!(doc, "<s2>");
        assert_eq!(*book.loads.borrow(), vec![2, 2]);
        assert_eq!(loader.loaded_indices(), vec![2]);
    }

    #[tokio::test]
    async fn test_new_prefetch_supersedes_old() {
        let (loader, book) = setup(10, None);

        let first = loader.prefetch(&section(&book, 5), 1);
        let second = loader.prefetch(&section(&book, 1), 1);

        let (first, second) = futures::join!(first, second);
        assert_eq!(first, vec![None, None]);
        assert_eq!(second, vec![Some("<s2>".to_string()), Some("<s0>".to_string())]);
    }

    #[tokio::test]
    async fn test_unload_and_unload_all() {
        let (loader, book) = setup(5, None);
        let signal = AbortSignal::never();

        for index in 0..3 {
            loader.load(&section(&book, index), &signal).await.unwrap();
        }
        loader.pin(&section(&book, 1));

        assert!(!loader.unload(1));
        assert!(loader.unload(0));
        assert!(!loader.unload(0));
        assert_eq!(loader.loaded_indices(), vec![1, 2]);

        loader.unload_all();
        assert!(loader.loaded_indices().is_empty());
        assert!(!loader.is_pinned(&section(&book, 1)));
        let mut unloads = book.unloads.borrow().clone();
        unloads.sort();
        assert_eq!(unloads, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_from_config() {
        let book = Rc::new(TestBook {
            len: 10,
            ..Default::default()
        });
        let request: RequestFn<String> = Rc::new(|href: &str, signal: &AbortSignal| {
            fetch(href.to_string(), signal.clone(), None, false).boxed_local()
        });
        let config = CacheConfig::default()
            .with_max_loaded_sections(Some(2))
            .with_prefetch_distance(1);
        let loader = SpineLoader::from_config(request, &config);

        let results = loader.prefetch_adjacent(&section(&book, 4)).await;
        assert_eq!(results.len(), 2);
        assert_eq!(loader.prefetch_distance(), 1);

        loader.load(&section(&book, 0), &AbortSignal::never()).await.unwrap();
        assert_eq!(loader.loaded_indices(), vec![3, 0]);
    }

    #[tokio::test]
    async fn test_set_max_loaded_sections() {
        let (loader, book) = setup(5, None);
        let signal = AbortSignal::never();

        for index in 0..4 {
            loader.load(&section(&book, index), &signal).await.unwrap();
        }
        loader.set_max_loaded_sections(Some(1));
        assert_eq!(loader.loaded_indices(), vec![3]);
    }
}
