use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use crate::retention::Retention;
use crate::time::Instant;

type WeakTier<K, V> = moka::sync::Cache<K, Arc<V>>;

/// A finished value for one key.
///
/// `weak` is fixed for the lifetime of the entry. `strong` points at the same allocation until
/// the entry degrades, after which only the weak tier and callers keep the value alive.
struct Entry<V> {
    weak: Weak<V>,
    strong: Option<Arc<V>>,
    deadline: Option<Instant>,
}

impl<V> Entry<V> {
    /// Whether the strong hold has outlived its deadline and should be released.
    fn is_due(&self, now: Instant) -> bool {
        self.strong.is_some() && self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

/// The store of finished computations, together with its retention policy.
pub(crate) struct Store<K, V> {
    name: String,
    finished: RwLock<HashMap<K, Entry<V>>>,
    retention: Retention,
    weak_tier: Option<WeakTier<K, V>>,
}

/// Configuration of the weak tier, see [`Store::new`].
pub(crate) struct WeakTierConfig<K, V> {
    pub capacity: u64,
    pub idle: Option<Duration>,
    pub weigher: Option<Box<dyn Fn(&K, &V) -> u32 + Send + Sync + 'static>>,
}

impl<K, V> Store<K, V> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn retention(&self) -> &Retention {
        &self.retention
    }
}

impl<K, V> Store<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(name: String, strong_ttl: Option<Duration>, weak: WeakTierConfig<K, V>) -> Self {
        let weak_tier = (weak.capacity > 0).then(|| {
            let mut builder = WeakTier::<K, V>::builder()
                .name(&name)
                .max_capacity(weak.capacity);
            if let Some(idle) = weak.idle {
                builder = builder.time_to_idle(idle);
            }
            if let Some(weigher) = weak.weigher {
                builder =
                    builder.weigher(move |key: &K, value: &Arc<V>| weigher(key, value.as_ref()));
            }
            builder.build()
        });

        Self {
            name,
            finished: RwLock::new(HashMap::new()),
            retention: Retention::new(strong_ttl),
            weak_tier,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Entry<V>>> {
        self.finished.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Entry<V>>> {
        self.finished.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a finished value.
    ///
    /// Releases the strong hold of an entry whose deadline has passed, and drops entries whose
    /// value can no longer be resolved. Returns `None` in both the "never computed" and the
    /// "reclaimed" case.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let now = Instant::now();
        let (weak, due, strong) = {
            let finished = self.read();
            let entry = finished.get(key)?;
            (entry.weak.clone(), entry.is_due(now), entry.strong.is_some())
        };

        // resolve before degrading, the value was still strongly held when it was observed
        let value = weak.upgrade();
        if due {
            self.degrade(key, &weak);
        }

        match value {
            Some(value) => {
                let tier = if strong && !due {
                    "strong"
                } else {
                    // record the read so idle eviction and admission see this key as used
                    if let Some(weak_tier) = &self.weak_tier {
                        weak_tier.get(key);
                    }
                    "weak"
                };
                metric!(counter("flight.hit") += 1, "cache" => &self.name, "tier" => tier);
                Some(value)
            }
            None => {
                self.drop_stale(key, &weak);
                None
            }
        }
    }

    /// Releases the strong hold of the entry that `weak` belongs to, if it is still due.
    fn degrade(&self, key: &K, weak: &Weak<V>) {
        let mut finished = self.write();
        // Another reader may have degraded, replaced or removed the entry in the meantime.
        let released = match finished.get_mut(key) {
            Some(entry) if Weak::ptr_eq(&entry.weak, weak) && entry.is_due(Instant::now()) => {
                entry.strong.take()
            }
            _ => None,
        };

        if let Some(value) = released {
            self.retain_weakly(key, value);
            drop(finished);

            tracing::debug!(cache = %self.name, "strong hold elapsed, degrading to weak tier");
            metric!(counter("flight.degraded") += 1, "cache" => &self.name, "reason" => "deadline");
        }
    }

    /// Removes the entry that `weak` belongs to once its value is gone.
    fn drop_stale(&self, key: &K, weak: &Weak<V>) {
        let mut finished = self.write();
        let stale = finished
            .get(key)
            .is_some_and(|entry| Weak::ptr_eq(&entry.weak, weak) && entry.weak.strong_count() == 0);
        if stale {
            finished.remove(key);
            drop(finished);

            tracing::trace!(cache = %self.name, "dropped reclaimed entry");
            metric!(counter("flight.stale_dropped") += 1, "cache" => &self.name);
        }
    }

    /// Hands a degraded value to the weak tier.
    ///
    /// Must be called with the `finished` write lock held, so that a concurrent `remove` or
    /// `clear` cannot leave a value in the weak tier for a key without an entry.
    fn retain_weakly(&self, key: &K, value: Arc<V>) {
        if let Some(weak_tier) = &self.weak_tier {
            weak_tier.insert(key.clone(), value);
        }
    }

    /// Stores a freshly computed value, replacing any previous entry for `key`.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let entry = Entry {
            weak: Arc::downgrade(&value),
            strong: Some(Arc::clone(&value)),
            deadline: self.retention.deadline(Instant::now()),
        };

        let mut finished = self.write();
        if let Some(weak_tier) = &self.weak_tier {
            weak_tier.invalidate(&key);
        }
        let previous = finished.insert(key, entry);
        drop(finished);
        // the previous value is released outside of the lock
        drop(previous);

        tracing::trace!(cache = %self.name, "stored value");
        value
    }

    /// Releases the strong hold of `key` right away, keeping the value weakly reachable.
    pub fn expire(&self, key: &K) {
        let mut finished = self.write();
        let released = finished.get_mut(key).and_then(|entry| {
            entry.deadline = Some(Instant::now());
            entry.strong.take()
        });

        if let Some(value) = released {
            self.retain_weakly(key, value);
            drop(finished);

            tracing::debug!(cache = %self.name, "expired strong hold");
            metric!(counter("flight.degraded") += 1, "cache" => &self.name, "reason" => "expire");
        }
    }

    /// Removes `key` from the store and the weak tier.
    pub fn remove(&self, key: &K) {
        let mut finished = self.write();
        let removed = finished.remove(key);
        if let Some(weak_tier) = &self.weak_tier {
            weak_tier.invalidate(key);
        }
        drop(finished);
        drop(removed);
    }

    /// Swaps the finished map for an empty one and empties the weak tier.
    pub fn clear(&self) {
        let mut finished = self.write();
        let previous = std::mem::take(&mut *finished);
        if let Some(weak_tier) = &self.weak_tier {
            weak_tier.invalidate_all();
        }
        drop(finished);
        tracing::debug!(cache = %self.name, entries = previous.len(), "cleared finished store");
    }

    /// The number of entries in the finished map, including degraded ones.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Applies pending evictions of the weak tier.
    #[cfg(test)]
    pub(crate) fn run_pending_tasks(&self) {
        if let Some(weak_tier) = &self.weak_tier {
            weak_tier.run_pending_tasks();
        }
    }
}
