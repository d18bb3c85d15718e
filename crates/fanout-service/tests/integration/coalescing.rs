use std::time::Duration;

use fanout_service::caching::FetchError;
use fanout_test::{fail_after, resolve_after};

use crate::{Calls, TestError, key, setup_cache};

const TTL: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_coalesces_across_tasks() {
    let cache = setup_cache(100);
    let calls = Calls::new();
    let project = key("/api/projects/40", &[]);

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let cache = cache.clone();
            let calls = calls.clone();
            let project = project.clone();
            tokio::spawn(async move {
                cache
                    .get_or_fetch(
                        &project,
                        resolve_after(&calls, Duration::from_millis(200), i),
                        TTL,
                    )
                    .await
            })
        })
        .collect();

    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await.unwrap().unwrap());
    }

    assert_eq!(calls.count(), 1);
    // every caller observes the value of the one computation that ran
    assert!(values.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(cache.entry_count(), 1);

    let stats = cache.stats();
    assert_eq!(stats.requests, 32);
    assert_eq!(stats.hits, 31);
    assert_eq!(stats.abandoned, 0);
}

#[tokio::test(start_paused = true)]
async fn test_ttl_window() {
    let cache = setup_cache(100);
    let calls = Calls::new();
    let stats = key("/api/projects/40/stats", &[("kind", "weekly")]);

    let first = cache
        .get_or_fetch(&stats, resolve_after(&calls, Duration::ZERO, 1), TTL)
        .await;
    tokio::time::sleep(Duration::from_secs(29)).await;
    let second = cache
        .get_or_fetch(&stats, resolve_after(&calls, Duration::ZERO, 2), TTL)
        .await;
    assert_eq!((first, second), (Ok(1), Ok(1)));
    assert_eq!(calls.count(), 1);

    // The expiry timer removes the entry once the window is over.
    tokio::time::sleep(Duration::from_millis(1001)).await;
    assert_eq!(cache.entry_count(), 0);

    let third = cache
        .get_or_fetch(&stats, resolve_after(&calls, Duration::ZERO, 3), TTL)
        .await;
    assert_eq!(third, Ok(3));
    assert_eq!(calls.count(), 2);
    assert_eq!(cache.stats().expirations, 1);
}

#[tokio::test(start_paused = true)]
async fn test_zero_ttl_never_reuses() {
    let cache = setup_cache(100);
    let calls = Calls::new();
    let stats = key("/api/projects/40/stats", &[]);

    for expected in [1, 2] {
        let value = cache
            .get_or_fetch(
                &stats,
                resolve_after(&calls, Duration::from_millis(10), expected),
                Duration::ZERO,
            )
            .await;
        assert_eq!(value, Ok(expected));
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
    assert_eq!(calls.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_size_bound_under_concurrent_inserts() {
    let cache = setup_cache(4);
    let calls = Calls::new();

    let keys: Vec<_> = (0..10)
        .map(|page| key("/api/logs", &[("page", page.to_string().as_str())]))
        .collect();

    let fetches = keys.iter().enumerate().map(|(i, key)| {
        cache.get_or_fetch(
            key,
            resolve_after(&calls, Duration::from_millis(10), i as u64),
            TTL,
        )
    });
    let results = futures::future::join_all(fetches).await;

    // Evicted entries still deliver their result to the callers already waiting.
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result, Ok(i as u64));
    }
    assert_eq!(calls.count(), 10);
    assert_eq!(cache.entry_count(), 4);

    let remaining: Vec<_> = cache.entries().into_iter().map(|entry| entry.key).collect();
    assert_eq!(remaining, keys[6..]);
    assert_eq!(cache.stats().evictions, 6);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_failure() {
    let cache = setup_cache(100);
    let calls = Calls::new();
    let logs = key("/api/projects/40/daily_logs", &[]);

    let failed = cache
        .get_or_fetch(
            &logs,
            fail_after(&calls, Duration::from_millis(10), "database is locked"),
            TTL,
        )
        .await;
    assert_eq!(
        failed,
        Err(FetchError::Factory(TestError::new("database is locked")))
    );
    assert!(!cache.contains(&logs));

    let retried = cache
        .get_or_fetch(&logs, resolve_after(&calls, Duration::from_millis(10), 5), TTL)
        .await;
    assert_eq!(retried, Ok(5));
    assert_eq!(calls.count(), 2);
}
