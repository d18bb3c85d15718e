use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio_util::sync::CancellationToken;

use crate::caching::CacheKey;

/// A type-erased factory computing one resource.
pub type BoxedFactory<T, E> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, E>> + Send>;

/// One named resource of an [`AggregationRequest`].
pub struct FetchRequest<T, E> {
    pub(super) name: String,
    pub(super) key: CacheKey,
    pub(super) factory: BoxedFactory<T, E>,
    pub(super) ttl: Option<Duration>,
}

impl<T, E> FetchRequest<T, E> {
    /// Creates a request for the resource identified by `key`, computed by `factory` on a miss.
    ///
    /// The result will be available under `name` in the
    /// [`AggregationResult`](super::AggregationResult).
    pub fn new<F, Fut>(name: impl Into<String>, key: CacheKey, factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        Self {
            name: name.into(),
            key,
            factory: Box::new(move || factory().boxed()),
            ttl: None,
        }
    }

    /// Overrides the time-to-live of the cached result.
    ///
    /// Without this, the default of the [`Aggregator`](super::Aggregator) applies.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// The name under which the result is reported.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cache key of the resource.
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl<T, E> fmt::Debug for FetchRequest<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchRequest")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

/// All the resources needed to render one view.
pub struct AggregationRequest<T, E> {
    pub(super) view: String,
    pub(super) requests: Vec<FetchRequest<T, E>>,
}

impl<T, E> AggregationRequest<T, E> {
    /// Creates an empty request for the given view.
    ///
    /// The view name is only used for logging and metrics.
    pub fn new(view: impl Into<String>) -> Self {
        Self {
            view: view.into(),
            requests: Vec::new(),
        }
    }

    /// Adds a resource to this request.
    pub fn push(&mut self, request: FetchRequest<T, E>) {
        self.requests.push(request);
    }

    /// Adds a resource to this request, builder style.
    pub fn with(mut self, request: FetchRequest<T, E>) -> Self {
        self.push(request);
        self
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

impl<T, E> Extend<FetchRequest<T, E>> for AggregationRequest<T, E> {
    fn extend<I: IntoIterator<Item = FetchRequest<T, E>>>(&mut self, iter: I) {
        self.requests.extend(iter);
    }
}

impl<T, E> fmt::Debug for AggregationRequest<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregationRequest")
            .field("view", &self.view)
            .field("requests", &self.requests)
            .finish()
    }
}

/// Signals an in-flight aggregation that its results are no longer wanted.
///
/// Cancelling a scope only stops the aggregation from waiting. The computations it started keep
/// running, since other callers may share them through the cache.
#[derive(Debug, Clone, Default)]
pub struct CancellationScope {
    token: CancellationToken,
}

impl CancellationScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels this scope and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Returns the underlying token.
    ///
    /// Factories which want to stop early once nobody is interested anymore can capture it.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Creates a scope that is cancelled along with this one, but can also be cancelled alone.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }
}
