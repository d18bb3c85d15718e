use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use url::form_urlencoded;

use super::InvalidCacheKey;

/// Identifies one logical resource request in a [`CoalescingCache`](super::CoalescingCache).
///
/// A key is never empty. Keys built with [`CacheKey::for_endpoint`] are canonical: the same
/// endpoint with the same set of parameters always produces the same key, no matter in which
/// order the parameters were given.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    /// Creates a key from its raw string representation.
    pub fn new(key: impl Into<String>) -> Result<Self, InvalidCacheKey> {
        let key = key.into();
        if key.is_empty() {
            return Err(InvalidCacheKey::Empty);
        }
        Ok(Self(key.into()))
    }

    /// Creates a key for an `endpoint` queried with the given `params`.
    ///
    /// Parameters are sorted and form-urlencoded, so they are appended to the endpoint like a
    /// query string: `/api/projects/40/logs?page=2&per_page=50`. A query string that is already
    /// part of `endpoint` is merged with `params`.
    pub fn for_endpoint<I, K, V>(endpoint: &str, params: I) -> Result<Self, InvalidCacheKey>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        if endpoint.is_empty() {
            return Err(InvalidCacheKey::Empty);
        }

        let (path, query) = endpoint.split_once('?').unwrap_or((endpoint, ""));

        let mut params: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .chain(
                params
                    .into_iter()
                    .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned())),
            )
            .collect();
        params.sort();

        if params.is_empty() {
            return Self::new(path);
        }

        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params)
            .finish();

        Self::new(format!("{path}?{query}"))
    }

    /// Returns the string representation of this key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for CacheKey {
    type Error = InvalidCacheKey;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = InvalidCacheKey;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}
