use std::sync::Arc;

use thiserror::Error;

/// The outcome of a cached or coalesced computation.
pub type FlightResult<V, E> = Result<Arc<V>, FlightError<E>>;

/// An error observed by a caller of [`get`](crate::sync::FlightCache::get) or
/// [`force`](crate::sync::FlightCache::force).
///
/// Errors are never cached: every caller that joined the failed computation receives a clone
/// of the same error, and the next request for the key computes again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlightError<E> {
    /// The work function returned an error.
    #[error("{0}")]
    Work(E),
    /// The computation ended without producing an outcome.
    ///
    /// This happens when the work function panics, or when the task running an async
    /// computation is aborted, for example because the runtime shuts down.
    #[error("computation was abandoned before completing")]
    Abandoned,
}

impl<E> FlightError<E> {
    /// Returns the work function's error, if there is one.
    pub fn into_work(self) -> Option<E> {
        match self {
            Self::Work(err) => Some(err),
            Self::Abandoned => None,
        }
    }
}
