//! Serializable configuration for a [`FlightCache`](crate::sync::FlightCache).
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fine-tuning of retention and the weak tier.
///
/// Durations are written in [`humantime`](humantime_serde) format, e.g. `30s` or `1h`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Eq, PartialEq)]
#[serde(default)]
pub struct FlightCacheConfig {
    /// How long a freshly computed value is guaranteed to stay in memory.
    ///
    /// Once this elapses, the value degrades to the weak tier. `null` or `0s` keep values
    /// strongly held forever.
    ///
    /// Defaults to `1h`.
    #[serde(with = "humantime_serde")]
    pub strong_ttl: Option<Duration>,

    /// Capacity of the weak tier, which keeps degraded values resolvable.
    ///
    /// This counts entries, unless a [`weigher`](crate::CacheBuilder::weigher) is configured.
    /// `0` disables the weak tier, in which case a degraded value lives only as long as some
    /// caller holds on to it.
    ///
    /// Defaults to `10_000`.
    pub weak_capacity: u64,

    /// Evicts values from the weak tier that were not requested for this long.
    ///
    /// Defaults to `None`, values are only evicted because of capacity pressure.
    #[serde(with = "humantime_serde")]
    pub weak_idle: Option<Duration>,
}

impl Default for FlightCacheConfig {
    fn default() -> Self {
        Self {
            strong_ttl: Some(Duration::from_secs(3600)),
            weak_capacity: 10_000,
            weak_idle: None,
        }
    }
}
