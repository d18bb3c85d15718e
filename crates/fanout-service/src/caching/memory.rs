use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};

use crate::config::CacheConfig;
use crate::utils::futures::{CallOnDrop, lock, m};

use super::diagnostics::Counters;
use super::{
    CacheKey, CacheStats, Clock, EntryInfo, ExpiryScheduler, FetchError, TimerHandle, TokioClock,
    TokioScheduler,
};

/// The shared handle to a computation, resolved with `Canceled` if it went away without a result.
type Computation<T, E> = Shared<oneshot::Receiver<Result<T, E>>>;

/// A single entry of the cache.
struct Slot<T, E> {
    /// Insertion sequence number, unique across the lifetime of the cache.
    generation: u64,
    computation: Computation<T, E>,
    created_at: Instant,
    ttl: Duration,
    waiters: Arc<AtomicUsize>,
    /// Dropping the slot cancels its expiry timer.
    expiry: Option<TimerHandle>,
    /// Counts how often the expiry timer was armed, only the latest handle is kept.
    armed: u64,
}

impl<T, E> Slot<T, E>
where
    T: Clone,
    E: Clone,
{
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }

    fn is_settled(&self) -> bool {
        self.computation.peek().is_some()
    }
}

struct State<T, E> {
    entries: HashMap<CacheKey, Slot<T, E>>,
    /// Keys by generation, the first item is the oldest entry.
    insertion_order: BTreeMap<u64, CacheKey>,
    next_generation: u64,
}

impl<T, E> State<T, E>
where
    T: Clone,
    E: Clone,
{
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: BTreeMap::new(),
            next_generation: 0,
        }
    }

    fn next_generation(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        generation
    }

    fn insert(&mut self, key: CacheKey, slot: Slot<T, E>) {
        self.insertion_order.insert(slot.generation, key.clone());
        if let Some(previous) = self.entries.insert(key, slot) {
            self.insertion_order.remove(&previous.generation);
        }
    }

    fn remove(&mut self, key: &CacheKey) -> Option<Slot<T, E>> {
        let slot = self.entries.remove(key)?;
        self.insertion_order.remove(&slot.generation);
        Some(slot)
    }

    /// Removes the entry for `key` only if it still belongs to `generation`.
    fn remove_generation(&mut self, key: &CacheKey, generation: u64) -> Option<Slot<T, E>> {
        if self.entries.get(key)?.generation != generation {
            return None;
        }
        self.remove(key)
    }

    fn pop_oldest(&mut self) -> Option<(CacheKey, Slot<T, E>)> {
        let (_, key) = self.insertion_order.pop_first()?;
        let slot = self.entries.remove(&key)?;
        Some((key, slot))
    }

    fn take_expired(&mut self, now: Instant) -> Vec<Slot<T, E>> {
        let expired: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, slot)| !slot.is_fresh(now))
            .map(|(key, _)| key.clone())
            .collect();

        expired.iter().filter_map(|key| self.remove(key)).collect()
    }
}

struct Inner<T, E> {
    name: String,
    max_entries: usize,
    clock: Arc<dyn Clock>,
    scheduler: Arc<dyn ExpiryScheduler>,
    state: Mutex<State<T, E>>,
    counters: Counters,
}

impl<T, E> Inner<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Arms the expiry timer of the entry `generation` of `key`.
    ///
    /// The scheduler is called without holding the state lock, so it may run the task right
    /// away. Entries whose deadline can not be represented only expire passively.
    fn arm_expiry(self: &Arc<Self>, key: &CacheKey, generation: u64) {
        let (deadline, armed) = {
            let mut state = lock(&self.state);
            let Some(slot) = state.entries.get_mut(key) else {
                return;
            };
            if slot.generation != generation {
                return;
            }
            let Some(deadline) = slot.created_at.checked_add(slot.ttl) else {
                return;
            };
            slot.armed += 1;
            (deadline, slot.armed)
        };

        let task = {
            let inner = Arc::downgrade(self);
            let key = key.clone();
            Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.expire(&key, generation);
                }
            })
        };
        let handle = self.scheduler.schedule(deadline, task);

        let mut state = lock(&self.state);
        let unused = match state.entries.get_mut(key) {
            Some(slot) if slot.generation == generation && slot.armed == armed => {
                slot.expiry.replace(handle)
            }
            // The entry is gone, or the timer was armed again in the meantime.
            _ => Some(handle),
        };
        drop(state);
        drop(unused);
    }

    /// Runs when the expiry timer of an entry fires.
    fn expire(self: &Arc<Self>, key: &CacheKey, generation: u64) {
        let now = self.clock.now();
        let mut state = lock(&self.state);

        let Some(slot) = state.entries.get(key) else {
            return;
        };
        if slot.generation != generation {
            return;
        }

        if slot.is_fresh(now) {
            // The timer fired ahead of the deadline, wait for the remainder.
            drop(state);
            self.arm_expiry(key, generation);
            return;
        }

        let removed = state.remove(key);
        let entries = state.entries.len();
        drop(state);
        drop(removed);

        tracing::trace!(cache = %self.name, key = %key, "Expired cache entry");
        Counters::bump(&self.counters.expirations, 1);
        metric!(counter("caches.expired") += 1, "cache" => &self.name);
        metric!(gauge("caches.entries") = entries as u64, "cache" => &self.name);
    }

    /// Drops the entry of a computation that did not produce a value.
    fn discard(&self, key: &CacheKey, generation: u64) {
        let (removed, entries) = {
            let mut state = lock(&self.state);
            let removed = state.remove_generation(key, generation);
            (removed, state.entries.len())
        };
        if removed.is_some() {
            tracing::trace!(cache = %self.name, key = %key, "Removed failed cache entry");
            metric!(gauge("caches.entries") = entries as u64, "cache" => &self.name);
        }
    }
}

/// An entry reserved for a computation which still needs to be started.
struct Reservation<T, E> {
    key: CacheKey,
    generation: u64,
    sender: oneshot::Sender<Result<T, E>>,
}

/// Registers a caller as waiting on a computation.
///
/// When dropped before [`settle`](Self::settle) is called, the caller gave up and the wait is
/// counted as abandoned. The computation itself keeps running.
struct Interest<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<T, E>>,
    key: CacheKey,
    waiters: Arc<AtomicUsize>,
    settled: bool,
}

impl<T, E> Interest<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn new(inner: &Arc<Inner<T, E>>, key: &CacheKey, waiters: &Arc<AtomicUsize>) -> Self {
        waiters.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(inner),
            key: key.clone(),
            waiters: Arc::clone(waiters),
            settled: false,
        }
    }

    fn settle(mut self) {
        self.settled = true;
    }
}

impl<T, E> Drop for Interest<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.waiters.fetch_sub(1, Ordering::Relaxed);
        if !self.settled {
            tracing::trace!(
                cache = %self.inner.name,
                key = %self.key,
                "Stopped waiting for cache computation"
            );
            Counters::bump(&self.inner.counters.abandoned, 1);
            metric!(counter("caches.abandoned") += 1, "cache" => &self.inner.name);
        }
    }
}

/// A request coalescing in-memory cache.
///
/// Concurrent calls to [`get_or_fetch`](Self::get_or_fetch) for the same [`CacheKey`] share a
/// single computation, and the result of that computation is served to later callers until its
/// time-to-live elapses. Failed computations are removed right away, so that the next call
/// retries.
///
/// The cache holds at most `max_entries` entries. When more are inserted, the oldest entry is
/// evicted, regardless of how often it has been accessed.
///
/// Computations are spawned on the tokio runtime and run to completion even if all callers
/// stop waiting for them.
pub struct CoalescingCache<T, E> {
    inner: Arc<Inner<T, E>>,
}

impl<T, E> Clone for CoalescingCache<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> fmt::Debug for CoalescingCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoalescingCache")
            .field("name", &self.inner.name)
            .field("max_entries", &self.inner.max_entries)
            .field("entries", &self.entry_count())
            .finish()
    }
}

impl<T, E> CoalescingCache<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a cache driven by the tokio clock and timers.
    pub fn new(name: impl Into<String>, max_entries: usize) -> Self {
        Self::with_time(name, max_entries, TokioClock, TokioScheduler)
    }

    /// Creates a cache from its configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.name.clone(), config.max_entries)
    }

    /// Creates a cache reading time from `clock`, and expiring entries through `scheduler`.
    pub fn with_time<C, S>(
        name: impl Into<String>,
        max_entries: usize,
        clock: C,
        scheduler: S,
    ) -> Self
    where
        C: Clock,
        S: ExpiryScheduler,
    {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                max_entries,
                clock: Arc::new(clock),
                scheduler: Arc::new(scheduler),
                state: Mutex::new(State::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// The name of this cache, used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The maximum number of entries this cache holds.
    pub fn max_entries(&self) -> usize {
        self.inner.max_entries
    }

    /// Returns the value for `key`, computing it with `factory` if there is no fresh entry.
    ///
    /// If a computation for `key` is already in flight or completed less than its time-to-live
    /// ago, `factory` is not called and the existing result is returned instead. Otherwise
    /// `factory` is called exactly once, and its result is shared with every caller that arrives
    /// before it expires.
    ///
    /// A `ttl` of zero, as well as a cache without room for any entries, always calls `factory`
    /// and stores nothing.
    ///
    /// Errors returned by `factory` are passed on to all waiting callers, but never stored.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &CacheKey,
        factory: F,
        ttl: Duration,
    ) -> Result<T, FetchError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let name = self.inner.name.as_str();
        Counters::bump(&self.inner.counters.requests, 1);
        metric!(counter("caches.access") += 1, "cache" => name);

        if ttl.is_zero() || self.inner.max_entries == 0 {
            tracing::trace!(cache = name, key = %key, "Bypassing cache");
            Counters::bump(&self.inner.counters.bypassed, 1);
            Counters::bump(&self.inner.counters.computations, 1);
            metric!(counter("caches.bypass") += 1, "cache" => name);

            return self.bypass(key, factory).await;
        }

        let (computation, interest, reservation) = self.lookup_or_reserve(key, ttl);
        if let Some(reservation) = reservation {
            self.spawn_computation(reservation, factory);
        }

        let result = computation.await;
        interest.settle();

        match result {
            Ok(result) => result.map_err(FetchError::Factory),
            Err(oneshot::Canceled) => {
                tracing::warn!(cache = name, key = %key, "Cache computation was dropped");
                Err(FetchError::Dropped)
            }
        }
    }

    /// Runs `factory` on its own task without storing anything.
    ///
    /// The result is never shared, but a panicking factory still only fails this call.
    async fn bypass<F, Fut>(&self, key: &CacheKey, factory: F) -> Result<T, FetchError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let computation = factory();
        let interest = Interest::new(&self.inner, key, &Arc::default());

        let inner = Arc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        let task = async move {
            let result = computation.await;
            if result.is_err() {
                if let Some(inner) = inner.upgrade() {
                    Counters::bump(&inner.counters.failures, 1);
                }
                metric!(counter("caches.computation.failed") += 1, "cache" => &name);
            }
            metric!(
                counter("caches.computation") += 1,
                "cache" => &name,
                "status" => m::result(&result),
            );
            result
        };

        let result = tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current()))).await;
        interest.settle();

        match result {
            Ok(result) => result.map_err(FetchError::Factory),
            Err(error) => {
                tracing::warn!(
                    cache = %self.inner.name,
                    key = %key,
                    error = %error,
                    "Cache computation was dropped"
                );
                Err(FetchError::Dropped)
            }
        }
    }

    /// Returns the computation for a fresh entry of `key`, or reserves a new one.
    ///
    /// A returned [`Reservation`] must be started with
    /// [`spawn_computation`](Self::spawn_computation).
    #[allow(clippy::type_complexity)]
    fn lookup_or_reserve(
        &self,
        key: &CacheKey,
        ttl: Duration,
    ) -> (
        Computation<T, E>,
        Interest<T, E>,
        Option<Reservation<T, E>>,
    ) {
        let inner = &self.inner;
        let name = inner.name.as_str();
        let now = inner.clock.now();

        let mut state = lock(&inner.state);

        let mut stale = None;
        if let Some(slot) = state.entries.get(key) {
            if slot.is_fresh(now) {
                let computation = slot.computation.clone();
                let interest = Interest::new(inner, key, &slot.waiters);
                drop(state);

                tracing::trace!(cache = name, key = %key, "Cache hit");
                Counters::bump(&inner.counters.hits, 1);
                metric!(counter("caches.memory.hit") += 1, "cache" => name);
                return (computation, interest, None);
            }
            stale = state.remove(key);
        }

        let mut expired = Vec::new();
        let mut evicted = Vec::new();
        if state.entries.len() >= inner.max_entries {
            // Stale entries are absent already, get rid of them before evicting a fresh one.
            expired = state.take_expired(now);
            while state.entries.len() >= inner.max_entries {
                match state.pop_oldest() {
                    Some(entry) => evicted.push(entry),
                    None => break,
                }
            }
        }
        expired.extend(stale);

        let generation = state.next_generation();
        let (sender, receiver) = oneshot::channel();
        let computation = receiver.shared();
        let waiters = Arc::new(AtomicUsize::new(0));

        state.insert(
            key.clone(),
            Slot {
                generation,
                computation: computation.clone(),
                created_at: now,
                ttl,
                waiters: Arc::clone(&waiters),
                expiry: None,
                armed: 0,
            },
        );
        let entries = state.entries.len();
        drop(state);

        tracing::trace!(cache = name, key = %key, "Cache miss");
        if !expired.is_empty() {
            Counters::bump(&inner.counters.expirations, expired.len() as u64);
            metric!(counter("caches.expired") += expired.len() as i64, "cache" => name);
        }
        for (evicted_key, _) in &evicted {
            tracing::trace!(cache = name, key = %evicted_key, "Evicted cache entry");
        }
        if !evicted.is_empty() {
            Counters::bump(&inner.counters.evictions, evicted.len() as u64);
            metric!(counter("caches.eviction") += evicted.len() as i64, "cache" => name);
        }
        metric!(gauge("caches.entries") = entries as u64, "cache" => name);

        inner.arm_expiry(key, generation);

        let interest = Interest::new(inner, key, &waiters);
        let reservation = Reservation {
            key: key.clone(),
            generation,
            sender,
        };
        (computation, interest, Some(reservation))
    }

    /// Calls `factory` and drives the resulting future to completion on its own task.
    ///
    /// The entry is removed before a failure is published to the waiting callers. The same
    /// happens if the computation never completes, because it panicked or the runtime shut down.
    fn spawn_computation<F, Fut>(&self, reservation: Reservation<T, E>, factory: F)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let Reservation {
            key,
            generation,
            sender,
        } = reservation;

        let remove_entry = {
            let inner = Arc::downgrade(&self.inner);
            let key = key.clone();
            CallOnDrop::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.discard(&key, generation);
                }
            })
        };

        Counters::bump(&self.inner.counters.computations, 1);
        let computation = factory();

        let inner = Arc::downgrade(&self.inner);
        let name = self.inner.name.clone();
        let task = async move {
            let result = computation.await;

            match result {
                Ok(_) => remove_entry.disarm(),
                Err(_) => {
                    drop(remove_entry);
                    tracing::debug!(cache = %name, key = %key, "Cache computation failed");
                    if let Some(inner) = inner.upgrade() {
                        Counters::bump(&inner.counters.failures, 1);
                    }
                    metric!(counter("caches.computation.failed") += 1, "cache" => &name);
                }
            }
            metric!(
                counter("caches.computation") += 1,
                "cache" => &name,
                "status" => m::result(&result),
            );

            // All callers may have gone away already, the result is then only kept in the entry.
            sender.send(result).ok();
        };

        tokio::spawn(task.bind_hub(Hub::new_from_top(Hub::current())));
    }

    /// Removes the entry for `key`, returning whether there was one.
    ///
    /// Callers that are already waiting on the entry still receive its result.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let (removed, entries) = {
            let mut state = lock(&self.inner.state);
            let removed = state.remove(key);
            (removed, state.entries.len())
        };
        if removed.is_some() {
            tracing::trace!(cache = %self.inner.name, key = %key, "Invalidated cache entry");
            metric!(gauge("caches.entries") = entries as u64, "cache" => &self.inner.name);
        }
        removed.is_some()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        let entries = {
            let mut state = lock(&self.inner.state);
            state.insertion_order.clear();
            std::mem::take(&mut state.entries)
        };
        tracing::trace!(cache = %self.inner.name, entries = entries.len(), "Cleared cache");
        metric!(gauge("caches.entries") = 0u64, "cache" => &self.inner.name);
    }

    /// Returns `true` if there is a fresh entry for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = self.inner.clock.now();
        lock(&self.inner.state)
            .entries
            .get(key)
            .is_some_and(|slot| slot.is_fresh(now))
    }

    /// The number of entries, including stale entries which were not removed yet.
    pub fn entry_count(&self) -> usize {
        lock(&self.inner.state).entries.len()
    }

    /// Returns information about all entries, oldest first.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let now = self.inner.clock.now();
        let state = lock(&self.inner.state);

        state
            .insertion_order
            .values()
            .filter_map(|key| {
                let slot = state.entries.get(key)?;
                Some(EntryInfo {
                    key: key.clone(),
                    age: now.saturating_duration_since(slot.created_at),
                    ttl: slot.ttl,
                    settled: slot.is_settled(),
                    waiters: slot.waiters.load(Ordering::Relaxed),
                })
            })
            .collect()
    }

    /// Returns the counters accumulated since the cache was created.
    pub fn stats(&self) -> CacheStats {
        self.inner.counters.snapshot(self.entry_count())
    }
}
