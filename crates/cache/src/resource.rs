//! Reference-counted resource cache with hierarchical ownership
//!
//! Every key owns at most one entry and at most one in-flight creation.
//! Holders take a reference with [`ResourceCache::acquire`] and drop it with
//! [`ResourceCache::release`]; entries may also be acquired under a parent
//! key so that releasing the parent releases every child it caused to be
//! held. Unreferenced entries are either revoked immediately or retained in
//! a bounded FIFO queue, depending on the [`RetentionConfig`].
//!
//! Each creation runs under an [`AbortSignal`] owned by its entry, never by
//! a caller. The signal is aborted only when the entry is finalized before
//! its value arrives, so one holder giving up never cancels work another
//! holder is still waiting on.
//!
//! The cache is single-threaded. No internal borrow is held while user code
//! (`create`, `revoke`, abort listeners) runs, so callbacks may re-enter the
//! cache freely.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::rc::{Rc, Weak};

use futures::future::{self, Either, LocalBoxFuture, Ready, Shared};
use futures::{FutureExt, TryFutureExt};
use reader_scheduler::{AbortController, AbortSignal};

use crate::config::RetentionConfig;
use crate::error::CacheError;
use crate::queue::KeyQueue;

/// A creation shared by every caller waiting on the same key
pub type Creation<V> = Shared<LocalBoxFuture<'static, Result<V, CacheError>>>;

/// Future returned by [`ResourceCache::acquire`]
///
/// Resolves immediately for populated entries, otherwise waits on the
/// entry's shared creation.
pub type Acquisition<V> = Either<Ready<Result<V, CacheError>>, Creation<V>>;

/// Cleanup hook invoked exactly once for every finalized value
///
/// Errors are logged and swallowed; cache integrity never depends on them.
pub type RevokeFn<K, V> = Rc<dyn Fn(V, &K) -> anyhow::Result<()>>;

/// Entry lifecycle
///
/// `Pending -> Populated` when the creation succeeds. A pending entry that
/// is finalized (last hold gone without retention, evicted, or cleared) is
/// removed outright and its creation aborted; a value that still arrives is
/// revoked on arrival because no entry of its generation exists anymore.
enum EntryState<V> {
    Pending {
        creation: Creation<V>,
        controller: AbortController,
    },
    Populated(V),
}

struct CacheEntry<V> {
    state: EntryState<V>,
    ref_count: usize,
    generation: u64,
}

impl<V: Clone> CacheEntry<V> {
    fn resolve(&self) -> Acquisition<V> {
        match &self.state {
            EntryState::Populated(value) => Either::Left(future::ready(Ok(value.clone()))),
            EntryState::Pending { creation, .. } => Either::Right(creation.clone()),
        }
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries currently in the cache (pending included)
    pub entry_count: usize,

    /// Number of retained entries nobody references
    pub unreferenced_count: usize,

    /// Maximum number of unreferenced entries retained
    pub unreferenced_limit: usize,

    /// Acquisitions served by an existing entry
    pub hits: u64,

    /// Acquisitions that started a creation
    pub misses: u64,

    /// Entries removed from the unreferenced queue by eviction
    pub evictions: u64,

    /// Values handed to the revoke hook
    pub revocations: u64,

    /// Revoke calls that returned an error
    pub revoke_failures: u64,

    /// Creations that failed
    pub creation_failures: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Internal cache state
struct CacheState<K, V, P> {
    /// Map from key to entry
    entries: HashMap<K, CacheEntry<V>>,

    /// Ownership graph: parent key to child keys
    children: HashMap<P, HashSet<K>>,

    /// Retained unreferenced keys, oldest at the front
    unreferenced: KeyQueue<K>,

    retention: RetentionConfig,

    next_generation: u64,

    stats: CacheStats,
}

struct CacheInner<K, V, P> {
    state: RefCell<CacheState<K, V, P>>,
    revoke: Option<RevokeFn<K, V>>,
}

/// Work deferred until the state borrow ends
enum Cleanup<K, V> {
    /// Hand a finalized value to the revoke hook
    Revoke(K, V),

    /// Abort an abandoned creation, then drop it
    Abort(K, AbortController, Creation<V>),
}

type Cleanups<K, V> = Vec<Cleanup<K, V>>;

/// Generic reference-counted cache
///
/// `K` addresses entries, `V` is the cached artifact (usually an `Rc`
/// handle), and `P` addresses owners in the ownership graph. Releasing an
/// entry also releases the children registered under `P::from(key)`.
///
/// Cloning the cache clones a handle; all clones share one state.
///
/// # Example
///
/// ```
/// use reader_cache::{ResourceCache, RetentionConfig};
///
/// # futures::executor::block_on(async {
/// let cache: ResourceCache<&str, String> = ResourceCache::new(RetentionConfig::bounded(8));
///
/// let chapter = cache
///     .acquire("chapter-1", None, |_signal| async { Ok("<html>..</html>".to_string()) })
///     .await
///     .unwrap();
/// assert_eq!(chapter, "<html>..</html>");
/// assert_eq!(cache.ref_count(&"chapter-1"), Some(1));
///
/// // Released entries stay retained until evicted
/// cache.release(&"chapter-1");
/// assert!(cache.is_unreferenced(&"chapter-1"));
/// # });
/// ```
pub struct ResourceCache<K, V, P = K> {
    inner: Rc<CacheInner<K, V, P>>,
}

impl<K, V, P> Clone for ResourceCache<K, V, P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Hash + Eq + Clone, V, P> fmt::Debug for ResourceCache<K, V, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.borrow();
        f.debug_struct("ResourceCache")
            .field("entries", &state.entries.len())
            .field("unreferenced", &state.unreferenced.len())
            .field("retention", &state.retention)
            .finish()
    }
}

impl<K, V, P> ResourceCache<K, V, P>
where
    K: Hash + Eq + Clone + fmt::Debug + 'static,
    V: Clone + 'static,
    P: Hash + Eq + Clone + From<K> + 'static,
{
    /// Create a cache without a revoke hook
    pub fn new(retention: RetentionConfig) -> Self {
        Self::build(retention, None)
    }

    /// Create a cache whose finalized values are passed to `revoke`
    ///
    /// # Arguments
    ///
    /// * `retention` - Retention policy for unreferenced entries
    /// * `revoke` - Cleanup hook, called once per finalized value
    pub fn with_revoke<R>(retention: RetentionConfig, revoke: R) -> Self
    where
        R: Fn(V, &K) -> anyhow::Result<()> + 'static,
    {
        Self::build(retention, Some(Rc::new(revoke)))
    }

    fn build(retention: RetentionConfig, revoke: Option<RevokeFn<K, V>>) -> Self {
        Self {
            inner: Rc::new(CacheInner {
                state: RefCell::new(CacheState {
                    entries: HashMap::new(),
                    children: HashMap::new(),
                    unreferenced: KeyQueue::new(),
                    retention,
                    next_generation: 0,
                    stats: CacheStats::default(),
                }),
                revoke,
            }),
        }
    }

    /// Take a reference to `key`, creating the value if needed
    ///
    /// Bookkeeping happens immediately, before the returned future is
    /// polled, so acquire and release calls are observed in issue order.
    /// `create` runs at most once per entry, when the creation is first
    /// polled, and receives the entry's abort signal.
    ///
    /// When `parent` is given and already owns `key` while the entry is
    /// held, the existing value is returned without taking another
    /// reference: the association is the hold.
    ///
    /// # Arguments
    ///
    /// * `key` - Entry key
    /// * `parent` - Optional owner; releasing it releases this hold
    /// * `create` - Factory for the value on a miss
    pub fn acquire<F, Fut>(&self, key: K, parent: Option<P>, create: F) -> Acquisition<V>
    where
        F: FnOnce(AbortSignal) -> Fut + 'static,
        Fut: Future<Output = Result<V, CacheError>> + 'static,
    {
        let mut guard = self.inner.state.borrow_mut();
        let state = &mut *guard;

        if let Some(parent) = parent {
            let newly_owned = state.children.entry(parent).or_default().insert(key.clone());
            if !newly_owned {
                if let Some(entry) = state.entries.get(&key).filter(|e| e.ref_count > 0) {
                    state.stats.hits += 1;
                    return entry.resolve();
                }
            }
        }

        if let Some(entry) = state.entries.get_mut(&key) {
            entry.ref_count += 1;
            if entry.ref_count == 1 {
                state.unreferenced.remove(&key);
            }
            state.stats.hits += 1;
            tracing::trace!(?key, ref_count = entry.ref_count, "cache hit");
            return entry.resolve();
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.stats.misses += 1;
        tracing::trace!(?key, "cache miss");

        let controller = AbortController::new();
        let creation = self.creation(key.clone(), generation, controller.signal(), create);
        state.entries.insert(
            key,
            CacheEntry {
                state: EntryState::Pending {
                    creation: creation.clone(),
                    controller,
                },
                ref_count: 1,
                generation,
            },
        );
        Either::Right(creation)
    }

    /// Like [`acquire`](Self::acquire), but `None` resolves to `None`
    /// without touching the cache
    pub fn acquire_optional<F, Fut>(
        &self,
        key: Option<K>,
        parent: Option<P>,
        create: F,
    ) -> LocalBoxFuture<'static, Result<Option<V>, CacheError>>
    where
        F: FnOnce(AbortSignal) -> Fut + 'static,
        Fut: Future<Output = Result<V, CacheError>> + 'static,
    {
        match key {
            None => future::ready(Ok(None)).boxed_local(),
            Some(key) => self.acquire(key, parent, create).map_ok(Some).boxed_local(),
        }
    }

    fn creation<F, Fut>(
        &self,
        key: K,
        generation: u64,
        signal: AbortSignal,
        create: F,
    ) -> Creation<V>
    where
        F: FnOnce(AbortSignal) -> Fut + 'static,
        Fut: Future<Output = Result<V, CacheError>> + 'static,
    {
        let weak = Rc::downgrade(&self.inner);
        let revoke = self.inner.revoke.clone();

        async move {
            let result = create(signal).await;
            Self::settle(&weak, revoke.as_ref(), &key, generation, result)
        }
        .boxed_local()
        .shared()
    }

    /// Apply a finished creation to its entry
    fn settle(
        weak: &Weak<CacheInner<K, V, P>>,
        revoke: Option<&RevokeFn<K, V>>,
        key: &K,
        generation: u64,
        result: Result<V, CacheError>,
    ) -> Result<V, CacheError> {
        let Some(inner) = weak.upgrade() else {
            // The cache is gone; nobody can release this value later
            if let (Ok(value), Some(revoke)) = (result, revoke) {
                if let Err(err) = revoke(value, key) {
                    tracing::warn!(?key, error = %err, "revoke failed");
                }
            }
            return Err(CacheError::Released);
        };
        let cache = ResourceCache { inner };

        let mut cleanups = Vec::new();
        let mut abandoned = None;
        let outcome = {
            let mut guard = cache.inner.state.borrow_mut();
            let state = &mut *guard;
            let owned = state.entries.get(key).is_some_and(|entry| {
                entry.generation == generation && matches!(entry.state, EntryState::Pending { .. })
            });

            match (owned, result) {
                (true, Ok(value)) => {
                    if let Some(entry) = state.entries.get_mut(key) {
                        let populated = EntryState::Populated(value.clone());
                        abandoned = Some(std::mem::replace(&mut entry.state, populated));
                    }
                    Ok(value)
                }
                (true, Err(err)) => {
                    abandoned = state.entries.remove(key).map(|entry| entry.state);
                    state.unreferenced.remove(key);
                    state.stats.creation_failures += 1;
                    Self::detach_locked(state, key);
                    Self::release_parent_locked(state, &P::from(key.clone()), &mut cleanups);
                    if err.is_abort() {
                        tracing::debug!(?key, "creation aborted");
                    } else {
                        tracing::warn!(?key, error = %err, "creation failed");
                    }
                    Err(err)
                }
                (false, Ok(value)) => {
                    // Finalized, cleared or replaced while the creation ran
                    tracing::debug!(?key, "value arrived after release; revoking");
                    cleanups.push(Cleanup::Revoke(key.clone(), value));
                    Err(CacheError::Released)
                }
                (false, Err(err)) => Err(err),
            }
        };

        drop(abandoned);
        cache.run_cleanups(cleanups);
        outcome
    }

    /// Drop one reference to `key`
    ///
    /// At zero references the children owned by `key` are released, then
    /// the entry is either retained as unreferenced or finalized. Unknown
    /// keys and extra releases are ignored.
    pub fn release(&self, key: &K) {
        let mut cleanups = Vec::new();
        {
            let mut state = self.inner.state.borrow_mut();
            Self::release_locked(&mut state, key, &mut cleanups);
        }
        self.run_cleanups(cleanups);
    }

    /// Release every child held by `parent`
    ///
    /// Each child is detached, then released exactly once. Returns the number
    /// of children released.
    pub fn release_parent(&self, parent: &P) -> usize {
        let mut cleanups = Vec::new();
        let released = {
            let mut state = self.inner.state.borrow_mut();
            Self::release_parent_locked(&mut state, parent, &mut cleanups)
        };
        self.run_cleanups(cleanups);
        released
    }

    /// Release the hold `parent` has on `child`
    ///
    /// The association is removed first so a later acquire of the same child
    /// under the same parent counts as fresh. Returns `true` if the
    /// association existed.
    pub fn release_child(&self, parent: &P, child: &K) -> bool {
        let mut cleanups = Vec::new();
        let removed = {
            let mut guard = self.inner.state.borrow_mut();
            let state = &mut *guard;
            let removed = match state.children.get_mut(parent) {
                Some(set) => {
                    let removed = set.remove(child);
                    if set.is_empty() {
                        state.children.remove(parent);
                    }
                    removed
                }
                None => false,
            };
            if removed {
                Self::release_locked(state, child, &mut cleanups);
            }
            removed
        };
        self.run_cleanups(cleanups);
        removed
    }

    /// Revoke every value and forget all state
    ///
    /// Pending creations are aborted and orphaned: values that still arrive
    /// are revoked on arrival. Intended for shutdown.
    pub fn clear(&self) {
        let cleanups: Cleanups<K, V> = {
            let mut state = self.inner.state.borrow_mut();
            state.children.clear();
            state.unreferenced.clear();
            state
                .entries
                .drain()
                .map(|(key, entry)| match entry.state {
                    EntryState::Populated(value) => Cleanup::Revoke(key, value),
                    EntryState::Pending {
                        creation,
                        controller,
                    } => Cleanup::Abort(key, controller, creation),
                })
                .collect()
        };
        tracing::debug!(count = cleanups.len(), "clearing resource cache");
        self.run_cleanups(cleanups);
    }

    /// Change the retention policy, evicting down to the new bound
    pub fn set_retention(&self, retention: RetentionConfig) {
        let mut cleanups = Vec::new();
        {
            let mut state = self.inner.state.borrow_mut();
            state.retention = retention;
            Self::evict_locked(&mut state, &mut cleanups);
        }
        self.run_cleanups(cleanups);
    }

    /// Update the maximum number of retained unreferenced entries
    ///
    /// If the queue is now over the bound, the oldest entries are evicted.
    pub fn set_max_entries(&self, max_entries: usize) {
        let retention = RetentionConfig {
            max_entries,
            ..self.retention()
        };
        self.set_retention(retention);
    }

    /// Current retention policy
    pub fn retention(&self) -> RetentionConfig {
        self.inner.state.borrow().retention
    }

    /// Populated value for `key`, without taking a reference
    pub fn get(&self, key: &K) -> Option<V> {
        let state = self.inner.state.borrow();
        match state.entries.get(key).map(|e| &e.state) {
            Some(EntryState::Populated(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Number of live holders of `key`, or `None` if there is no entry
    pub fn ref_count(&self, key: &K) -> Option<usize> {
        self.inner.state.borrow().entries.get(key).map(|e| e.ref_count)
    }

    /// Check if an entry exists for `key` (pending included)
    pub fn contains(&self, key: &K) -> bool {
        self.inner.state.borrow().entries.contains_key(key)
    }

    /// Check if `key` has a creation in flight
    pub fn is_pending(&self, key: &K) -> bool {
        matches!(
            self.inner.state.borrow().entries.get(key).map(|e| &e.state),
            Some(EntryState::Pending { .. })
        )
    }

    /// Check if `key` is retained without references
    pub fn is_unreferenced(&self, key: &K) -> bool {
        self.inner.state.borrow().unreferenced.contains(key)
    }

    /// Retained unreferenced keys, oldest first
    pub fn unreferenced_keys(&self) -> Vec<K> {
        self.inner.state.borrow().unreferenced.iter().cloned().collect()
    }

    /// Number of children currently held by `parent`
    pub fn children_len(&self, parent: &P) -> usize {
        self.inner
            .state
            .borrow()
            .children
            .get(parent)
            .map_or(0, HashSet::len)
    }

    /// Number of entries (pending included)
    pub fn len(&self) -> usize {
        self.inner.state.borrow().entries.len()
    }

    /// Check if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.inner.state.borrow().entries.is_empty()
    }

    /// Number of retained unreferenced entries
    pub fn unreferenced_len(&self) -> usize {
        self.inner.state.borrow().unreferenced.len()
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.borrow();
        CacheStats {
            entry_count: state.entries.len(),
            unreferenced_count: state.unreferenced.len(),
            unreferenced_limit: state.retention.limit(),
            ..state.stats
        }
    }

    fn release_locked(state: &mut CacheState<K, V, P>, key: &K, cleanups: &mut Cleanups<K, V>) {
        let Some(entry) = state.entries.get_mut(key) else {
            return;
        };
        if entry.ref_count == 0 {
            tracing::trace!(?key, "ignoring release of unreferenced entry");
            return;
        }
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }

        Self::release_parent_locked(state, &P::from(key.clone()), cleanups);

        // The cascade may have touched this entry again
        if !state.entries.get(key).is_some_and(|e| e.ref_count == 0) {
            return;
        }

        if state.retention.is_enabled() {
            state.unreferenced.push_back(key.clone());
            Self::evict_locked(state, cleanups);
        } else {
            Self::finalize_locked(state, key, cleanups);
        }
    }

    fn release_parent_locked(
        state: &mut CacheState<K, V, P>,
        parent: &P,
        cleanups: &mut Cleanups<K, V>,
    ) -> usize {
        let Some(children) = state.children.remove(parent) else {
            return 0;
        };
        let released = children.len();
        for child in children {
            Self::release_locked(state, &child, cleanups);
        }
        released
    }

    /// Forget every parent association of `key` without releasing anything
    fn detach_locked(state: &mut CacheState<K, V, P>, key: &K) {
        state.children.retain(|_, children| {
            children.remove(key);
            !children.is_empty()
        });
    }

    /// Remove an unreferenced entry, aborting its creation if still pending
    fn finalize_locked(state: &mut CacheState<K, V, P>, key: &K, cleanups: &mut Cleanups<K, V>) {
        state.unreferenced.remove(key);
        let Some(entry) = state.entries.remove(key) else {
            return;
        };
        match entry.state {
            EntryState::Populated(value) => cleanups.push(Cleanup::Revoke(key.clone(), value)),
            EntryState::Pending {
                creation,
                controller,
            } => {
                tracing::debug!(?key, "released before ready; aborting creation");
                cleanups.push(Cleanup::Abort(key.clone(), controller, creation));
            }
        }
    }

    /// Evict the oldest unreferenced entries until the queue fits the bound
    fn evict_locked(state: &mut CacheState<K, V, P>, cleanups: &mut Cleanups<K, V>) {
        let limit = state.retention.limit();
        let mut guard = state.unreferenced.len();

        while state.unreferenced.len() > limit {
            if guard == 0 {
                tracing::debug!(
                    queued = state.unreferenced.len(),
                    limit,
                    "eviction guard tripped"
                );
                break;
            }
            guard -= 1;

            let Some(key) = state.unreferenced.pop_front() else {
                break;
            };
            let Some(entry) = state.entries.get(&key) else {
                continue;
            };
            if entry.ref_count > 0 {
                continue;
            }

            let was_populated = matches!(entry.state, EntryState::Populated(_));
            Self::finalize_locked(state, &key, cleanups);
            if was_populated {
                state.stats.evictions += 1;
                tracing::trace!(?key, "evicted unreferenced entry");
            }
        }
    }

    /// Abort abandoned creations and revoke finalized values
    fn run_cleanups(&self, cleanups: Cleanups<K, V>) {
        if cleanups.is_empty() {
            return;
        }

        let mut count = 0;
        let mut failures = 0;
        for cleanup in cleanups {
            match cleanup {
                Cleanup::Abort(key, controller, creation) => {
                    controller.abort();
                    drop(creation);
                    tracing::trace!(?key, "abandoned creation dropped");
                }
                Cleanup::Revoke(key, value) => {
                    count += 1;
                    if let Some(revoke) = &self.inner.revoke {
                        if let Err(err) = revoke(value, &key) {
                            failures += 1;
                            tracing::warn!(?key, error = %err, "revoke failed");
                        }
                    }
                }
            }
        }

        let mut state = self.inner.state.borrow_mut();
        state.stats.revocations += count;
        state.stats.revoke_failures += failures;
    }
}
