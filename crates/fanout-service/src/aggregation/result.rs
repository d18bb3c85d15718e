use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::caching::FetchError;

/// An aggregation request that can not be dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregateError {
    /// Two resources of the request share the same name.
    #[error("duplicate resource name `{0}`")]
    DuplicateName(String),
    /// The request does not contain any resources.
    #[error("view `{0}` does not request any resources")]
    Empty(String),
}

/// The outcome of fetching a single named resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T, E> {
    /// The resource was fetched successfully.
    Ok(T),
    /// Fetching the resource failed.
    Failed(FetchError<E>),
    /// The aggregation was cancelled before the resource was available.
    Abandoned,
}

impl<T, E> Outcome<T, E> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    pub fn is_abandoned(&self) -> bool {
        matches!(self, Self::Abandoned)
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ok(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&FetchError<E>> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }
}

impl<T, E> From<Result<T, FetchError<E>>> for Outcome<T, E> {
    fn from(result: Result<T, FetchError<E>>) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(error) => Self::Failed(error),
        }
    }
}

/// The final state of an aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationState {
    /// Every resource settled, successfully or not.
    Completed,
    /// The aggregation was cancelled while some resources were still outstanding.
    Cancelled,
}

impl AggregationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AggregationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The merged results of all resources of a view.
///
/// There is exactly one [`Outcome`] for every resource that was requested. Failed resources do
/// not affect the others.
#[derive(Debug, Clone)]
pub struct AggregationResult<T, E> {
    view: String,
    state: AggregationState,
    elapsed: Duration,
    outcomes: BTreeMap<String, Outcome<T, E>>,
}

impl<T, E> AggregationResult<T, E> {
    pub(super) fn new(
        view: String,
        elapsed: Duration,
        outcomes: BTreeMap<String, Outcome<T, E>>,
    ) -> Self {
        let state = if outcomes.values().any(Outcome::is_abandoned) {
            AggregationState::Cancelled
        } else {
            AggregationState::Completed
        };

        Self {
            view,
            state,
            elapsed,
            outcomes,
        }
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn state(&self) -> AggregationState {
        self.state
    }

    /// Time from dispatching the first resource until the aggregation returned.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state == AggregationState::Cancelled
    }

    /// Returns `true` if at least one resource failed.
    ///
    /// Abandoned resources do not count as failures.
    pub fn has_failures(&self) -> bool {
        self.outcomes.values().any(Outcome::is_failed)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Outcome<T, E>> {
        self.outcomes.get(name)
    }

    /// Returns the value of the named resource if it was fetched successfully.
    pub fn value(&self, name: &str) -> Option<&T> {
        self.get(name)?.value()
    }

    /// Returns the error of the named resource if it failed.
    pub fn error(&self, name: &str) -> Option<&FetchError<E>> {
        self.get(name)?.error()
    }

    /// Iterates all outcomes ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Outcome<T, E>)> {
        self.outcomes
            .iter()
            .map(|(name, outcome)| (name.as_str(), outcome))
    }

    pub fn completed(&self) -> Vec<&str> {
        self.names_where(Outcome::is_ok)
    }

    pub fn failed(&self) -> Vec<&str> {
        self.names_where(Outcome::is_failed)
    }

    pub fn abandoned(&self) -> Vec<&str> {
        self.names_where(Outcome::is_abandoned)
    }

    fn names_where(&self, f: impl Fn(&Outcome<T, E>) -> bool) -> Vec<&str> {
        self.iter()
            .filter(|(_, outcome)| f(outcome))
            .map(|(name, _)| name)
            .collect()
    }

    pub fn into_outcomes(self) -> BTreeMap<String, Outcome<T, E>> {
        self.outcomes
    }

    /// Creates a serializable summary of this result, without the values.
    pub fn summary(&self) -> AggregationSummary
    where
        E: fmt::Display,
    {
        let to_owned = |names: Vec<&str>| -> Vec<String> {
            names.into_iter().map(String::from).collect()
        };

        AggregationSummary {
            view: self.view.clone(),
            state: self.state,
            elapsed: self.elapsed,
            completed: to_owned(self.completed()),
            failed: self
                .iter()
                .filter_map(|(name, outcome)| {
                    Some((name.to_owned(), outcome.error()?.to_string()))
                })
                .collect(),
            abandoned: to_owned(self.abandoned()),
        }
    }
}

impl<E> AggregationResult<serde_json::Value, E> {
    /// Deserializes the named JSON resource into `R`.
    ///
    /// Returns `None` if the resource was not fetched successfully.
    pub fn decode<R: DeserializeOwned>(&self, name: &str) -> Option<Result<R, serde_json::Error>> {
        let value = self.value(name)?;
        Some(<R as serde::Deserialize>::deserialize(value))
    }
}

/// A summary of an [`AggregationResult`], for logs and diagnostics output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregationSummary {
    pub view: String,
    pub state: AggregationState,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub completed: Vec<String>,
    /// Error messages of the failed resources, by name.
    pub failed: BTreeMap<String, String>,
    pub abandoned: Vec<String>,
}
