//! A coalescing in-memory cache with tiered strong/weak retention.
//!
//! A [`FlightCache`](sync::FlightCache) wraps an expensive *work* function and memoizes its
//! results per key:
//!
//! - Concurrent requests for the same key are coalesced, so the work function runs at most once
//!   per key at a time and every waiting caller observes the result of that single invocation.
//! - A successfully computed value is held strongly for a configurable retention window (the
//!   "strong TTL"). Once the window elapses, the value degrades to a weak hold: it is still served
//!   as long as it can be resolved, but it is no longer guaranteed to stay in memory.
//! - Errors are never cached. The next request for a failed key runs the work function again.
//!
//! # The weak tier
//!
//! Without a tracing garbage collector, a [`Weak`](std::sync::Weak) reference dies exactly when
//! the last [`Arc`](std::sync::Arc) is dropped. Degraded values are therefore handed to a bounded
//! *weak tier* (a [`moka`] cache) which keeps them resolvable until they are evicted because of
//! capacity pressure or idleness. A degraded value also stays resolvable while any caller still
//! holds the `Arc` it was handed out. This means "evict past a bound" rather than "maybe free
//! memory under pressure": configure the bound with
//! [`weak_capacity`](CacheBuilder::weak_capacity), or set it to `0` to keep degraded values
//! alive only for as long as callers reference them.
//!
//! # Flavours
//!
//! - [`sync::FlightCache`] blocks the calling thread while it waits for an in-flight computation.
//! - [`future::FlightCache`] is the async version. Computations are spawned onto the current
//!   tokio runtime and run to completion even when every caller stops waiting for them.

#![warn(missing_docs)]

#[macro_use]
pub mod metrics;

mod builder;
pub mod config;
mod error;
pub mod future;
mod retention;
mod store;
pub mod sync;

pub use builder::CacheBuilder;
pub use error::{FlightError, FlightResult};

#[cfg(any(test, feature = "test"))]
pub(crate) use tokio::time;

#[cfg(not(any(test, feature = "test")))]
pub(crate) use std::time;
