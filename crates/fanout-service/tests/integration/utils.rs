use std::time::Duration;

use fanout_service::aggregation::{AggregationRequest, Aggregator, FetchRequest};
use fanout_service::caching::{CacheKey, CoalescingCache};
use fanout_service::config::CacheConfig;
use fanout_test as test;
use serde_json::{Value, json};

pub use test::{Calls, TestError};

/// Setup tests and create an aggregator over JSON resources.
///
/// The `update_config` closure can modify the default cache configuration before the aggregator
/// is created.
pub fn setup_aggregator(
    update_config: impl FnOnce(&mut CacheConfig),
) -> Aggregator<Value, TestError> {
    test::setup();

    let mut config = CacheConfig::default();
    update_config(&mut config);

    Aggregator::from_config(&config)
}

/// Creates a cache over plain numbers, used to test coalescing without an aggregator.
pub fn setup_cache(max_entries: usize) -> CoalescingCache<u64, TestError> {
    test::setup();
    CoalescingCache::new("integration", max_entries)
}

#[track_caller]
pub fn key(endpoint: &str, params: &[(&str, &str)]) -> CacheKey {
    CacheKey::for_endpoint(endpoint, params.iter().copied()).unwrap()
}

/// Invocation counters for each resource of the project dashboard.
#[derive(Debug, Default)]
pub struct DashboardCalls {
    pub project: Calls,
    pub work_items: Calls,
    pub daily_logs: Calls,
}

/// Creates the request for the dashboard of project `40`.
///
/// Work items take the longest to load, and fail when `fail_work_items` is set.
pub fn dashboard_request(
    calls: &DashboardCalls,
    fail_work_items: bool,
) -> AggregationRequest<Value, TestError> {
    let project = test::json_after(
        &calls.project,
        Duration::from_millis(20),
        json!({"id": 40, "name": "Harbor Bridge", "members": 12}),
    );

    let work_items = if fail_work_items {
        FetchRequest::new(
            "work_items",
            key("/api/projects/40/work_items", &[("status", "open")]),
            test::fail_after(&calls.work_items, Duration::from_millis(80), "upstream unavailable"),
        )
    } else {
        FetchRequest::new(
            "work_items",
            key("/api/projects/40/work_items", &[("status", "open")]),
            test::json_after(
                &calls.work_items,
                Duration::from_millis(80),
                json!([{"id": 1, "title": "Pour foundation"}]),
            ),
        )
    };

    let daily_logs = test::json_after(
        &calls.daily_logs,
        Duration::from_millis(50),
        json!([{"date": "2024-03-01", "weather": "rain"}]),
    );

    AggregationRequest::new("project-dashboard")
        .with(FetchRequest::new(
            "project",
            key("/api/projects/40", &[]),
            project,
        ))
        .with(work_items)
        .with(FetchRequest::new(
            "daily_logs",
            key("/api/projects/40/daily_logs", &[("page", "1"), ("per_page", "50")]),
            daily_logs,
        ))
}
