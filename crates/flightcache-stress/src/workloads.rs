use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, ensure};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use flightcache::config::FlightCacheConfig;
use flightcache::future::FlightCache;

/// The value computed for every key, sized like a small real-world cache item.
pub type Value = Box<[u8]>;

const VALUE_SIZE: usize = 1024;

pub type WorkloadCache = FlightCache<u64, Value, SimulatedError>;

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workload {
    /// The number of operations running at the same time.
    pub concurrency: usize,
    /// The number of distinct keys that are requested.
    pub keys: u64,
    /// How long computing a single value takes.
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    /// The share of computations that fail.
    #[serde(default)]
    pub error_rate: f64,
    /// The share of operations that force a refresh instead of a lookup.
    #[serde(default)]
    pub force_ratio: f64,
    /// The share of the remaining operations that expire a key instead of looking it up.
    #[serde(default)]
    pub expire_ratio: f64,
}

impl Workload {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "concurrency must be at least 1");
        ensure!(self.keys > 0, "keys must be at least 1");
        for (name, ratio) in [
            ("error_rate", self.error_rate),
            ("force_ratio", self.force_ratio),
            ("expire_ratio", self.expire_ratio),
        ] {
            ensure!(
                (0.0..=1.0).contains(&ratio),
                "{name} must be between 0 and 1, got {ratio}"
            );
        }
        Ok(())
    }

    /// Picks a random key and what to do with it.
    pub fn next_operation(&self) -> Operation {
        let mut rng = rand::rng();
        let key = rng.random_range(0..self.keys);
        if rng.random_bool(self.force_ratio) {
            Operation::Force(key)
        } else if rng.random_bool(self.expire_ratio) {
            Operation::Expire(key)
        } else {
            Operation::Get(key)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get(u64),
    Force(u64),
    Expire(u64),
}

#[derive(Debug, Clone, Error)]
#[error("simulated failure computing key {0}")]
pub struct SimulatedError(u64);

/// A workload together with its own cache.
pub struct PreparedWorkload {
    pub workload: Workload,
    pub cache: WorkloadCache,
    computations: Arc<AtomicUsize>,
}

impl PreparedWorkload {
    /// The number of times the work function ran so far.
    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}

pub fn prepare_workload(
    index: usize,
    workload: Workload,
    config: &FlightCacheConfig,
) -> PreparedWorkload {
    let computations = Arc::new(AtomicUsize::new(0));
    let latency = workload.latency;
    let error_rate = workload.error_rate;

    let cache = FlightCache::builder()
        .name(format!("workload-{index}"))
        .config(config)
        .build({
            let computations = Arc::clone(&computations);
            move |key: u64| {
                computations.fetch_add(1, Ordering::Relaxed);
                let failed = rand::rng().random_bool(error_rate);
                async move {
                    tokio::time::sleep(latency).await;
                    if failed {
                        Err(SimulatedError(key))
                    } else {
                        Ok(vec![0; VALUE_SIZE].into_boxed_slice())
                    }
                }
            }
        });

    PreparedWorkload {
        workload,
        cache,
        computations,
    }
}

/// Runs a single random operation, returning whether it succeeded.
pub async fn process_operation(workload: &PreparedWorkload) -> bool {
    match workload.workload.next_operation() {
        Operation::Get(key) => workload.cache.get(key).await.is_ok(),
        Operation::Force(key) => workload.cache.force(key).await.is_ok(),
        Operation::Expire(key) => {
            workload.cache.expire(&key);
            true
        }
    }
}
