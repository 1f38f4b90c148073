//! A blocking [`FlightCache`] for use from OS threads.
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::builder::CacheBuilder;
use crate::error::{FlightError, FlightResult};
use crate::store::Store;
use crate::time::Instant;

type WorkFn<K, V, E> = Box<dyn Fn(&K) -> Result<V, E> + Send + Sync + 'static>;

/// An in-flight computation that any number of threads can wait on.
struct Job<V, E> {
    outcome: Mutex<Option<FlightResult<V, E>>>,
    done: Condvar,
}

impl<V, E> Job<V, E> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    fn complete(&self, outcome: FlightResult<V, E>) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
        self.done.notify_all();
    }
}

impl<V, E: Clone> Job<V, E> {
    /// Blocks until the job is completed and returns a copy of its outcome.
    fn wait(&self) -> FlightResult<V, E> {
        let mut outcome = self.outcome.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Some(outcome) = outcome.as_ref() {
                return outcome.clone();
            }
            outcome = self
                .done
                .wait(outcome)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct Inner<K, V, E> {
    store: Store<K, V>,
    pending: Mutex<HashMap<K, Arc<Job<V, E>>>>,
    work: WorkFn<K, V, E>,
}

impl<K, V, E> Inner<K, V, E> {
    fn pending(&self) -> MutexGuard<'_, HashMap<K, Arc<Job<V, E>>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The leader of a [`Job`].
///
/// Completing the leader removes the job from the pending registry and wakes all joiners.
/// A leader that is dropped without being completed, because the work function unwound, hands
/// [`FlightError::Abandoned`] to the joiners instead.
struct Leader<'a, K, V, E>
where
    K: Hash + Eq,
{
    inner: &'a Inner<K, V, E>,
    key: &'a K,
    job: Option<Arc<Job<V, E>>>,
}

impl<K, V, E> Leader<'_, K, V, E>
where
    K: Hash + Eq,
{
    fn complete(mut self, outcome: FlightResult<V, E>) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: FlightResult<V, E>) {
        let Some(job) = self.job.take() else {
            return;
        };

        let mut pending = self.inner.pending();
        let registered = pending
            .get(self.key)
            .is_some_and(|current| Arc::ptr_eq(current, &job));
        if registered {
            pending.remove(self.key);
        }
        job.complete(outcome);
    }
}

impl<K, V, E> Drop for Leader<'_, K, V, E>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        if self.job.is_some() {
            let name = self.inner.store.name();
            tracing::warn!(cache = %name, "computation abandoned by its leader");
            metric!(counter("flight.abandoned") += 1, "cache" => name);
            self.finish(Err(FlightError::Abandoned));
        }
    }
}

/// A coalescing cache that blocks callers while a value is being computed.
///
/// See the [crate documentation](crate) for the retention model. The cache is cheap to clone,
/// all clones share the same state.
///
/// # Example
///
/// ```
/// use std::convert::Infallible;
///
/// use flightcache::sync::FlightCache;
///
/// let cache = FlightCache::new(|key: &u32| Ok::<_, Infallible>(key * 2));
///
/// assert_eq!(*cache.get(21).unwrap(), 42);
/// ```
pub struct FlightCache<K, V, E> {
    inner: Arc<Inner<K, V, E>>,
}

impl<K, V, E> Clone for FlightCache<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V, E> fmt::Debug for FlightCache<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let in_flight = self
            .inner
            .pending
            .try_lock()
            .map(|pending| pending.len())
            .unwrap_or_default();
        f.debug_struct("FlightCache")
            .field("name", &self.inner.store.name())
            .field("entries", &self.inner.store.len())
            .field("in-flight", &in_flight)
            .field("strong_ttl", &self.inner.store.retention().get())
            .finish()
    }
}

impl<K, V, E> CacheBuilder<K, V, FlightCache<K, V, E>>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Builds a blocking cache around `work`.
    pub fn build<F>(self, work: F) -> FlightCache<K, V, E>
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    {
        let inner = Inner {
            store: self.build_store(),
            pending: Mutex::new(HashMap::new()),
            work: Box::new(work),
        };
        FlightCache {
            inner: Arc::new(inner),
        }
    }
}

impl<K, V, E> FlightCache<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone,
{
    /// Creates a cache with default settings around `work`.
    pub fn new<F>(work: F) -> Self
    where
        F: Fn(&K) -> Result<V, E> + Send + Sync + 'static,
    {
        Self::builder().build(work)
    }

    /// Returns a builder to configure a new cache.
    pub fn builder() -> CacheBuilder<K, V, Self> {
        CacheBuilder::default()
    }

    /// Returns the cached value for `key`, or computes it.
    ///
    /// A value that has degraded to the weak tier is still returned as long as it resolves.
    /// Otherwise, the calling thread either joins a computation that is already running for
    /// `key`, or runs the work function itself. Every caller of one computation observes the
    /// same outcome. Errors are not cached.
    pub fn get(&self, key: K) -> FlightResult<V, E> {
        let name = self.inner.store.name();
        metric!(counter("flight.access") += 1, "cache" => name);

        if let Some(value) = self.inner.store.get(&key) {
            return Ok(value);
        }

        let mut pending = self.inner.pending();
        if let Some(job) = pending.get(&key).cloned() {
            drop(pending);
            tracing::trace!(cache = %name, "joining in-flight computation");
            metric!(counter("flight.coalesced") += 1, "cache" => name);
            return job.wait();
        }

        // A leader may have published its value between the lookup above and taking the lock.
        if let Some(value) = self.inner.store.get(&key) {
            return Ok(value);
        }

        metric!(counter("flight.miss") += 1, "cache" => name);
        let job = Arc::new(Job::new());
        pending.insert(key.clone(), Arc::clone(&job));
        drop(pending);

        self.lead(key, job)
    }

    /// Computes a fresh value for `key`, regardless of what is cached.
    ///
    /// If a computation for `key` is already running, it may have started before this call, so
    /// this waits for it to finish and then makes sure a new one runs. Concurrent callers of
    /// `force` and `get` share that new computation, and the outcome is always produced after
    /// this call began.
    pub fn force(&self, key: K) -> FlightResult<V, E> {
        let name = self.inner.store.name();
        metric!(counter("flight.force") += 1, "cache" => name);

        let in_flight = self.inner.pending().get(&key).cloned();
        if let Some(in_flight) = in_flight {
            tracing::trace!(cache = %name, "waiting for in-flight computation to refresh");
            // Only the outcome of a computation started after this call is of interest.
            let _ = in_flight.wait();
        }

        // Every computation registered from here on started after this call.
        let mut pending = self.inner.pending();
        if let Some(job) = pending.get(&key).cloned() {
            drop(pending);
            tracing::trace!(cache = %name, "joining refreshing computation");
            metric!(counter("flight.coalesced") += 1, "cache" => name);
            return job.wait();
        }

        let job = Arc::new(Job::new());
        pending.insert(key.clone(), Arc::clone(&job));
        drop(pending);

        self.lead(key, job)
    }

    /// Runs the work function for `key`, bypassing caching and coalescing entirely.
    pub fn work(&self, key: &K) -> Result<V, E> {
        (self.inner.work)(key)
    }

    /// Stores `value` for `key` without running the work function.
    pub fn set(&self, key: K, value: V) {
        self.inner.store.insert(key, value);
    }

    /// Removes the entry for `key`. The next request computes it again.
    pub fn delete(&self, key: &K) {
        self.inner.store.remove(key);
    }

    /// Releases the strong hold on the value for `key` right away.
    ///
    /// The value moves to the weak tier and keeps being served while it resolves.
    pub fn expire(&self, key: &K) {
        self.inner.store.expire(key);
    }

    /// Removes all entries.
    ///
    /// Computations that are in flight are not affected, their values populate the emptied
    /// cache once they complete.
    pub fn reset(&self) {
        self.inner.store.clear();
    }

    /// Sets how long values stored from now on are strongly held.
    ///
    /// [`Duration::ZERO`] holds them forever. Entries that are already stored keep their
    /// deadlines.
    pub fn set_expiry(&self, ttl: Duration) {
        self.inner.store.retention().set(ttl);
    }

    /// How long new values are strongly held, `None` meaning forever.
    pub fn expiry(&self) -> Option<Duration> {
        self.inner.store.retention().get()
    }

    /// The name of this cache.
    pub fn name(&self) -> &str {
        self.inner.store.name()
    }

    /// The number of finished entries, including degraded ones that may no longer resolve.
    pub fn entry_count(&self) -> usize {
        self.inner.store.len()
    }

    /// The number of computations currently running.
    pub fn in_flight_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Runs the work function as the leader of `job` and completes it.
    fn lead(&self, key: K, job: Arc<Job<V, E>>) -> FlightResult<V, E> {
        let leader = Leader {
            inner: &self.inner,
            key: &key,
            job: Some(job),
        };

        let name = self.inner.store.name();
        metric!(counter("flight.computation") += 1, "cache" => name);
        tracing::debug!(cache = %name, "computing value");

        let start = Instant::now();
        let result = (self.inner.work)(&key);
        metric!(timer("flight.computation.duration") = start.elapsed(), "cache" => name);

        let outcome = match result {
            Ok(value) => Ok(self.inner.store.insert(key.clone(), value)),
            Err(err) => {
                tracing::debug!(cache = %name, "computation failed");
                metric!(counter("flight.computation.error") += 1, "cache" => name);
                Err(FlightError::Work(err))
            }
        };

        leader.complete(outcome.clone());
        outcome
    }
}
