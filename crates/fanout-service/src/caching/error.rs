use thiserror::Error;

/// An error that happens when resolving a computation through the
/// [`CoalescingCache`](super::CoalescingCache).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError<E> {
    /// The factory producing the value failed.
    ///
    /// The error is passed through unchanged and shared by every caller that coalesced onto the
    /// failed computation.
    #[error("{0}")]
    Factory(E),
    /// The computation went away without producing a result.
    ///
    /// This happens when the task running the factory panicked, or the runtime was shut down
    /// while it was still running.
    #[error("computation was dropped before completing")]
    Dropped,
}

impl<E> FetchError<E> {
    /// Returns the factory error, if this was one.
    pub fn factory_error(&self) -> Option<&E> {
        match self {
            Self::Factory(err) => Some(err),
            Self::Dropped => None,
        }
    }
}

/// The given string can not be used as a [`CacheKey`](super::CacheKey).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidCacheKey {
    /// Cache keys must not be empty.
    #[error("cache key must not be empty")]
    Empty,
}
