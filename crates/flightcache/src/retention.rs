use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::time::Instant;

/// The strong-hold window applied to newly stored values.
///
/// Stored as nanoseconds so it can be retuned at runtime. `0` means values are held strongly
/// forever.
#[derive(Debug)]
pub(crate) struct Retention {
    ttl: AtomicU64,
}

impl Retention {
    pub fn new(ttl: Option<Duration>) -> Self {
        let retention = Self {
            ttl: AtomicU64::new(0),
        };
        if let Some(ttl) = ttl {
            retention.set(ttl);
        }
        retention
    }

    /// Sets the window. A zero duration disables degradation.
    pub fn set(&self, ttl: Duration) {
        let nanos = u64::try_from(ttl.as_nanos()).unwrap_or(u64::MAX);
        self.ttl.store(nanos, Ordering::Relaxed);
    }

    /// The current window, or `None` if values are held forever.
    pub fn get(&self) -> Option<Duration> {
        match self.ttl.load(Ordering::Relaxed) {
            0 => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }

    /// The deadline for a value stored at `now`.
    ///
    /// A deadline that does not fit into an [`Instant`] is treated as no deadline at all.
    pub fn deadline(&self, now: Instant) -> Option<Instant> {
        self.get().and_then(|ttl| now.checked_add(ttl))
    }
}
