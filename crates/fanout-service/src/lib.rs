//! Request coalescing and fan-out aggregation of independent resources.
//!
//! The [`caching`] module provides a [`CoalescingCache`](caching::CoalescingCache) that makes
//! sure at most one computation is in flight per key, and keeps completed results around for a
//! short time. The [`aggregation`] module builds on top of it and fetches all the resources
//! belonging to one logical view concurrently, isolating failures by name.

#[macro_use]
pub mod metrics;

pub mod aggregation;
pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;
