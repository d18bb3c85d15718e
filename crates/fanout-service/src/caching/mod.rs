//! Request coalescing with a short-lived result cache.
//!
//! The [`CoalescingCache`] makes sure that for every [`CacheKey`], at most one computation is
//! running at a time. Callers that ask for a key while its computation is in flight wait on that
//! same computation instead of starting a new one, and its result is reused until its
//! time-to-live elapses.
//!
//! # Lifecycle of an entry
//!
//! An entry is created on the first lookup of a key that has no fresh entry. The factory
//! given to that lookup is invoked exactly once, and the resulting future is spawned onto the
//! tokio runtime. The entry then goes away for one of these reasons:
//!
//! - Its time-to-live elapses. Expiry is both passive, as lookups treat an entry of age `>= ttl`
//!   as absent, and active, as a timer removes the entry at its deadline.
//! - Its computation fails. Failures are never cached, the entry is removed before the error
//!   becomes visible to any caller.
//! - The cache is full and the entry is the oldest one. Eviction is strictly first-in first-out.
//! - It is removed explicitly via [`CoalescingCache::invalidate`] or [`CoalescingCache::clear`].
//!
//! # Time
//!
//! The cache reads time from a [`Clock`] and expires entries through an [`ExpiryScheduler`].
//! Both default to tokio's, which follows paused time in tests. [`ManualClock`] and
//! [`ManualScheduler`] are fully deterministic alternatives.

mod diagnostics;
mod error;
mod key;
mod memory;
mod time;

pub use diagnostics::*;
pub use error::*;
pub use key::*;
pub use memory::*;
pub use time::*;
