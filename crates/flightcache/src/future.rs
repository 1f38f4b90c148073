//! An async [`FlightCache`] for use from within a tokio runtime.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, TryFutureExt};

use crate::builder::CacheBuilder;
use crate::error::{FlightError, FlightResult};
use crate::store::Store;
use crate::time::Instant;

type WorkFn<K, V, E> = Box<dyn Fn(K) -> BoxFuture<'static, Result<V, E>> + Send + Sync + 'static>;

type ComputationChannel<V, E> = Shared<oneshot::Receiver<FlightResult<V, E>>>;

type ComputationMap<K, V, E> = HashMap<K, ComputationChannel<V, E>>;

struct Inner<K, V, E> {
    store: Store<K, V>,
    pending: Mutex<ComputationMap<K, V, E>>,
    work: WorkFn<K, V, E>,
}

impl<K, V, E> Inner<K, V, E> {
    fn pending(&self) -> MutexGuard<'_, ComputationMap<K, V, E>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K, V, E> Inner<K, V, E>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Runs the work function and stores a successful result.
    async fn compute(&self, key: K) -> FlightResult<V, E> {
        let name = self.store.name();
        metric!(counter("flight.computation") += 1, "cache" => name);
        tracing::debug!(cache = %name, "computing value");

        let start = Instant::now();
        let result = (self.work)(key.clone()).await;
        metric!(timer("flight.computation.duration") = start.elapsed(), "cache" => name);

        match result {
            Ok(value) => Ok(self.store.insert(key, value)),
            Err(err) => {
                tracing::debug!(cache = %name, "computation failed");
                metric!(counter("flight.computation.error") += 1, "cache" => name);
                Err(FlightError::Work(err))
            }
        }
    }
}

/// Keeps a computation registered in the pending map for as long as its task is alive.
///
/// Dropping the registration unregisters the computation. If that happens before the
/// computation completed, the task was aborted or the work function panicked, and the
/// waiting callers observe [`FlightError::Abandoned`] once the sender is dropped as well.
struct Registration<K, V, E>
where
    K: Hash + Eq,
{
    inner: Arc<Inner<K, V, E>>,
    key: K,
    channel: ComputationChannel<V, E>,
    completed: bool,
}

impl<K, V, E> Drop for Registration<K, V, E>
where
    K: Hash + Eq,
{
    fn drop(&mut self) {
        let mut pending = self.inner.pending();
        let registered = pending
            .get(&self.key)
            .is_some_and(|channel| channel.ptr_eq(&self.channel));
        if registered {
            pending.remove(&self.key);
        }
        drop(pending);

        if !self.completed {
            let name = self.inner.store.name();
            tracing::warn!(cache = %name, "computation abandoned before completing");
            metric!(counter("flight.abandoned") += 1, "cache" => name);
        }
    }
}

/// A coalescing cache whose computations run as tokio tasks.
///
/// See the [crate documentation](crate) for the retention model. The cache is cheap to clone,
/// all clones share the same state.
///
/// Computations are spawned onto the current runtime when the first caller requests a key, and
/// run to completion even if every caller stops waiting for them. This means that [`get`] and
/// [`force`] must be called from within a tokio runtime.
///
/// [`get`]: FlightCache::get
/// [`force`]: FlightCache::force
///
/// # Example
///
/// ```
/// use std::convert::Infallible;
///
/// use flightcache::future::FlightCache;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let cache = FlightCache::new(|key: u32| async move { Ok::<_, Infallible>(key * 2) });
///
/// assert_eq!(*cache.get(21).await.unwrap(), 42);
/// # }
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
    /// Builds an async cache around `work`.
    pub fn build<F, Fut>(self, work: F) -> FlightCache<K, V, E>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let inner = Inner {
            store: self.build_store(),
            pending: Mutex::new(HashMap::new()),
            work: Box::new(move |key| work(key).boxed()),
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
    E: Clone + Send + Sync + 'static,
{
    /// Creates a cache with default settings around `work`.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
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
    /// Otherwise, this joins a computation that is already running for `key`, or spawns a new
    /// one. Every caller of one computation observes the same outcome. Errors are not cached.
    pub async fn get(&self, key: K) -> FlightResult<V, E> {
        let name = self.inner.store.name();
        metric!(counter("flight.access") += 1, "cache" => name);

        if let Some(value) = self.inner.store.get(&key) {
            return Ok(value);
        }

        let channel = {
            let mut pending = self.inner.pending();
            if let Some(channel) = pending.get(&key) {
                tracing::trace!(cache = %name, "joining in-flight computation");
                metric!(counter("flight.coalesced") += 1, "cache" => name);
                channel.clone()
            } else if let Some(value) = self.inner.store.get(&key) {
                // The computation completed between the lookup above and taking the lock.
                return Ok(value);
            } else {
                metric!(counter("flight.miss") += 1, "cache" => name);
                self.spawn_computation(&mut pending, key)
            }
        };

        Self::wait(channel).await
    }

    /// Computes a fresh value for `key`, regardless of what is cached.
    ///
    /// If a computation for `key` is already running, it may have started before this call, so
    /// this waits for it to finish and then makes sure a new one runs. Concurrent callers of
    /// `force` and `get` share that new computation, and the outcome is always produced after
    /// this call began.
    pub async fn force(&self, key: K) -> FlightResult<V, E> {
        let name = self.inner.store.name();
        metric!(counter("flight.force") += 1, "cache" => name);

        let in_flight = self.inner.pending().get(&key).cloned();
        if let Some(in_flight) = in_flight {
            tracing::trace!(cache = %name, "waiting for in-flight computation to refresh");
            // Only the outcome of a computation started after this call is of interest.
            in_flight.await.ok();
        }

        // Every computation registered from here on started after this call.
        let channel = {
            let mut pending = self.inner.pending();
            match pending.get(&key) {
                Some(channel) => {
                    tracing::trace!(cache = %name, "joining refreshing computation");
                    metric!(counter("flight.coalesced") += 1, "cache" => name);
                    channel.clone()
                }
                None => self.spawn_computation(&mut pending, key),
            }
        };

        Self::wait(channel).await
    }

    /// Runs the work function for `key`, bypassing caching and coalescing entirely.
    pub async fn work(&self, key: K) -> Result<V, E> {
        (self.inner.work)(key).await
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

    /// Registers a new computation for `key` and spawns it.
    ///
    /// NOTE: This function itself is *not* `async`, because it must register the computation
    /// while the caller holds the lock on the pending map.
    fn spawn_computation(
        &self,
        pending: &mut ComputationMap<K, V, E>,
        key: K,
    ) -> ComputationChannel<V, E> {
        let (sender, receiver) = oneshot::channel();
        let channel = receiver.shared();
        let evicted = pending.insert(key.clone(), channel.clone());
        debug_assert!(evicted.is_none());

        let mut registration = Registration {
            inner: Arc::clone(&self.inner),
            key,
            channel: channel.clone(),
            completed: false,
        };

        tokio::spawn(async move {
            let key = registration.key.clone();
            let outcome = registration.inner.compute(key).await;
            registration.completed = true;
            // Unregister before sending. Callers either join a channel that will receive the
            // outcome, or find the value in the store.
            drop(registration);
            sender.send(outcome).ok();
        });

        channel
    }

    async fn wait(channel: ComputationChannel<V, E>) -> FlightResult<V, E> {
        channel
            .unwrap_or_else(|_cancelled| Err(FlightError::Abandoned))
            .await
    }
}
