use std::time::Duration;

use fanout_service::aggregation::{
    AggregateError, AggregationRequest, AggregationState, CancellationScope, FetchRequest,
};
use fanout_service::caching::FetchError;
use serde::Deserialize;
use serde_json::json;

use crate::{Calls, DashboardCalls, TestError, dashboard_request, key, setup_aggregator};

#[derive(Debug, Deserialize, PartialEq)]
struct Project {
    id: u64,
    name: String,
}

#[tokio::test(start_paused = true)]
async fn test_dashboard_with_failing_resource() {
    let aggregator = setup_aggregator(|_| {});
    let calls = DashboardCalls::default();

    let result = aggregator
        .fetch_all(dashboard_request(&calls, true), None)
        .await
        .unwrap();

    assert_eq!(result.state(), AggregationState::Completed);
    assert_eq!(result.len(), 3);
    assert_eq!(result.completed(), ["daily_logs", "project"]);
    assert_eq!(result.failed(), ["work_items"]);
    assert_eq!(
        result.error("work_items"),
        Some(&FetchError::Factory(TestError::new("upstream unavailable")))
    );

    let project: Project = result.decode("project").unwrap().unwrap();
    assert_eq!(project.name, "Harbor Bridge");

    // The failure was not cached, rendering again only retries the failed resource.
    let result = aggregator
        .fetch_all(dashboard_request(&calls, false), None)
        .await
        .unwrap();
    assert!(!result.has_failures());
    assert_eq!(calls.project.count(), 1);
    assert_eq!(calls.work_items.count(), 2);
    assert_eq!(calls.daily_logs.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_latency_is_slowest_resource() {
    let aggregator = setup_aggregator(|_| {});
    let calls = DashboardCalls::default();

    let result = aggregator
        .fetch_all(dashboard_request(&calls, false), None)
        .await
        .unwrap();

    // 20ms, 80ms and 50ms run concurrently
    assert_eq!(result.elapsed(), Duration::from_millis(80));

    // Everything is cached now.
    let result = aggregator
        .fetch_all(dashboard_request(&calls, false), None)
        .await
        .unwrap();
    assert_eq!(result.elapsed(), Duration::ZERO);
    assert_eq!(result.completed().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_names() {
    let aggregator = setup_aggregator(|_| {});
    let calls = Calls::new();

    let request = AggregationRequest::new("project-stats")
        .with(FetchRequest::new(
            "stats",
            key("/api/projects/40/stats", &[("kind", "weekly")]),
            fanout_test::json_after(&calls, Duration::ZERO, json!({"hours": 120})),
        ))
        .with(FetchRequest::new(
            "stats",
            key("/api/projects/40/stats", &[("kind", "monthly")]),
            fanout_test::json_after(&calls, Duration::ZERO, json!({"hours": 480})),
        ));

    let error = aggregator.fetch_all(request, None).await.unwrap_err();
    assert_eq!(error, AggregateError::DuplicateName("stats".into()));
    assert_eq!(error.to_string(), "duplicate resource name `stats`");
    assert_eq!(calls.count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_views_share_resources() {
    let aggregator = setup_aggregator(|_| {});
    let calls = DashboardCalls::default();

    let (a, b) = tokio::join!(
        aggregator.fetch_all(dashboard_request(&calls, false), None),
        aggregator.fetch_all(dashboard_request(&calls, false), None),
    );

    assert_eq!(a.unwrap().completed().len(), 3);
    assert_eq!(b.unwrap().completed().len(), 3);
    assert_eq!(calls.project.count(), 1);
    assert_eq!(calls.work_items.count(), 1);
    assert_eq!(calls.daily_logs.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_and_reissue() {
    let aggregator = setup_aggregator(|_| {});
    let calls = DashboardCalls::default();

    // The user navigates away before work items are loaded.
    let scope = CancellationScope::new();
    let (result, ()) = tokio::join!(
        aggregator.fetch_all(dashboard_request(&calls, false), Some(&scope)),
        async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            scope.cancel();
        },
    );
    let result = result.unwrap();

    assert_eq!(result.state(), AggregationState::Cancelled);
    assert_eq!(result.completed(), ["daily_logs", "project"]);
    assert_eq!(result.abandoned(), ["work_items"]);
    assert_eq!(result.elapsed(), Duration::from_millis(60));

    // Coming back joins the work items computation that kept running.
    let result = aggregator
        .fetch_all(dashboard_request(&calls, false), None)
        .await
        .unwrap();

    assert_eq!(result.state(), AggregationState::Completed);
    assert_eq!(result.elapsed(), Duration::from_millis(20));
    assert_eq!(calls.work_items.count(), 1);
    assert_eq!(aggregator.cache().stats().abandoned, 1);

    let summary = serde_json::to_value(result.summary()).unwrap();
    assert_eq!(summary["state"], "completed");
    assert_eq!(summary["elapsed"], "20ms");
}

#[tokio::test(start_paused = true)]
async fn test_already_cancelled_scope_serves_cached() {
    let aggregator = setup_aggregator(|config| config.max_entries = 10);
    let calls = DashboardCalls::default();

    aggregator
        .fetch_all(dashboard_request(&calls, false), None)
        .await
        .unwrap();

    let scope = CancellationScope::new();
    scope.cancel();

    let result = aggregator
        .fetch_all(dashboard_request(&calls, false), Some(&scope))
        .await
        .unwrap();
    assert_eq!(result.state(), AggregationState::Completed);
    assert_eq!(result.completed().len(), 3);
}
