//! Concurrent fetching of all the resources that make up one view.
//!
//! An [`AggregationRequest`] names every resource a view needs, together with its [`CacheKey`]
//! and a factory to compute it. The [`Aggregator`] dispatches all of them at once through its
//! [`CoalescingCache`], waits for every one of them to settle, and merges the outcomes into an
//! [`AggregationResult`]. A failing resource is reported under its name and never affects the
//! others.
//!
//! [`CacheKey`]: crate::caching::CacheKey

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use futures::future;
use tokio_util::sync::CancellationToken;

use crate::caching::CoalescingCache;
use crate::config::CacheConfig;

mod request;
mod result;

pub use request::*;
pub use result::*;

/// Fetches the resources of a view concurrently.
///
/// The aggregator keeps no state between calls to [`fetch_all`](Self::fetch_all) besides what
/// is held in its cache. Rendering the same view again hits the cache for all resources that
/// are still fresh or in flight.
pub struct Aggregator<T, E> {
    cache: CoalescingCache<T, E>,
    default_ttl: Duration,
}

impl<T, E> Clone for Aggregator<T, E> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            default_ttl: self.default_ttl,
        }
    }
}

impl<T, E> fmt::Debug for Aggregator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("cache", &self.cache)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

impl<T, E> Aggregator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + fmt::Display + 'static,
{
    /// Creates an aggregator using `cache`.
    ///
    /// Resources that don't specify their own time-to-live are cached for `default_ttl`.
    pub fn new(cache: CoalescingCache<T, E>, default_ttl: Duration) -> Self {
        Self { cache, default_ttl }
    }

    /// Creates an aggregator with a new cache built from the configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(CoalescingCache::from_config(config), config.default_ttl)
    }

    /// The cache shared by all aggregations.
    pub fn cache(&self) -> &CoalescingCache<T, E> {
        &self.cache
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Fetches all resources of `request` concurrently and merges their outcomes.
    ///
    /// This waits until every resource has settled, so it takes about as long as the slowest
    /// resource. Failed resources are reported in the result, they never fail the call.
    ///
    /// When `scope` is cancelled before all resources settled, this stops waiting and returns
    /// right away. The outstanding resources are reported as [`Outcome::Abandoned`], while their
    /// computations keep running in the cache.
    ///
    /// Fails without fetching anything if the request is empty or uses a name twice.
    pub async fn fetch_all(
        &self,
        request: AggregationRequest<T, E>,
        scope: Option<&CancellationScope>,
    ) -> Result<AggregationResult<T, E>, AggregateError> {
        let AggregationRequest { view, requests } = request;

        if requests.is_empty() {
            return Err(AggregateError::Empty(view));
        }

        let mut names = BTreeSet::new();
        for request in &requests {
            if !names.insert(request.name.as_str()) {
                return Err(AggregateError::DuplicateName(request.name.clone()));
            }
        }

        let token = scope.map(CancellationScope::token).unwrap_or_default();
        let start = tokio::time::Instant::now();

        let fetches = requests
            .into_iter()
            .map(|request| self.fetch_one(request, &token));
        let outcomes: BTreeMap<_, _> = future::join_all(fetches).await.into_iter().collect();

        let result = AggregationResult::new(view, start.elapsed(), outcomes);
        self.record(&result);
        Ok(result)
    }

    async fn fetch_one(
        &self,
        request: FetchRequest<T, E>,
        token: &CancellationToken,
    ) -> (String, Outcome<T, E>) {
        let FetchRequest {
            name,
            key,
            factory,
            ttl,
        } = request;
        let ttl = ttl.unwrap_or(self.default_ttl);

        let outcome = tokio::select! {
            biased;

            result = self.cache.get_or_fetch(&key, factory, ttl) => Outcome::from(result),
            _ = token.cancelled() => Outcome::Abandoned,
        };

        if let Outcome::Failed(ref error) = outcome {
            tracing::debug!(
                resource = %name,
                key = %key,
                error = %error,
                "Failed to fetch resource"
            );
        }

        (name, outcome)
    }

    fn record(&self, result: &AggregationResult<T, E>) {
        let view = result.view();
        let state = result.state();
        let failed = result.failed().len();

        tracing::debug!(
            view,
            state = %state,
            resources = result.len(),
            failed,
            abandoned = result.abandoned().len(),
            elapsed = ?result.elapsed(),
            "Aggregated view"
        );

        metric!(
            timer("aggregation.duration") = result.elapsed(),
            "view" => view,
            "state" => state.as_str(),
        );
        if failed > 0 {
            metric!(counter("aggregation.failures") += failed as i64, "view" => view);
        }
    }
}
