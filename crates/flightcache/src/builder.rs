use std::hash::Hash;
use std::marker::PhantomData;
use std::time::Duration;

use crate::config::FlightCacheConfig;
use crate::store::{Store, WeakTierConfig};

/// Builds a [`sync::FlightCache`](crate::sync::FlightCache) or a
/// [`future::FlightCache`](crate::future::FlightCache).
///
/// The builder is obtained from the `builder()` function of the cache flavour, and turned into a
/// cache by passing the work function to `build`.
///
/// # Example
///
/// ```
/// use std::convert::Infallible;
/// use std::time::Duration;
///
/// use flightcache::sync::FlightCache;
///
/// let cache: FlightCache<String, usize, Infallible> = FlightCache::builder()
///     .name("lengths")
///     .strong_ttl(Duration::from_secs(60))
///     .weak_capacity(1_000)
///     .build(|key: &String| Ok(key.len()));
///
/// assert_eq!(*cache.get("hello".into()).unwrap(), 5);
/// ```
pub struct CacheBuilder<K, V, C> {
    name: String,
    strong_ttl: Option<Duration>,
    weak_capacity: u64,
    weak_idle: Option<Duration>,
    weigher: Option<Box<dyn Fn(&K, &V) -> u32 + Send + Sync + 'static>>,
    cache_type: PhantomData<C>,
}

impl<K, V, C> Default for CacheBuilder<K, V, C> {
    fn default() -> Self {
        let config = FlightCacheConfig::default();
        Self {
            name: "default".into(),
            strong_ttl: config.strong_ttl,
            weak_capacity: config.weak_capacity,
            weak_idle: config.weak_idle,
            weigher: None,
            cache_type: PhantomData,
        }
    }
}

impl<K, V, C> CacheBuilder<K, V, C> {
    /// Names the cache. The name shows up in logs and as the `cache` metrics tag.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Applies all settings of a [`FlightCacheConfig`].
    pub fn config(mut self, config: &FlightCacheConfig) -> Self {
        self.strong_ttl = config.strong_ttl;
        self.weak_capacity = config.weak_capacity;
        self.weak_idle = config.weak_idle;
        self
    }

    /// Sets how long new values are strongly held. [`Duration::ZERO`] holds them forever.
    pub fn strong_ttl(mut self, ttl: Duration) -> Self {
        self.strong_ttl = Some(ttl);
        self
    }

    /// Sets the capacity of the weak tier. `0` disables it.
    pub fn weak_capacity(mut self, capacity: u64) -> Self {
        self.weak_capacity = capacity;
        self
    }

    /// Evicts weakly held values that were not requested for `idle`.
    pub fn weak_idle(mut self, idle: Duration) -> Self {
        self.weak_idle = Some(idle);
        self
    }

    /// Sets the cost of keeping a value in the weak tier.
    ///
    /// Without a weigher, every value costs `1` and the capacity is an entry count.
    pub fn weigher(mut self, weigher: impl Fn(&K, &V) -> u32 + Send + Sync + 'static) -> Self {
        self.weigher = Some(Box::new(weigher));
        self
    }

    pub(crate) fn build_store(self) -> Store<K, V>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let weak = WeakTierConfig {
            capacity: self.weak_capacity,
            idle: self.weak_idle,
            weigher: self.weigher,
        };
        Store::new(self.name, self.strong_ttl, weak)
    }
}
