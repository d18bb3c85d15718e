use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fanout_service::aggregation::Aggregator;
use fanout_service::config::Config;
use fanout_service::utils::futures::lock;
use sentry::SentryFutureExt;
use serde_json::Value;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{PreparedWorkload, SimulatedError, WorkloadsConfig, prepare_workload};

pub async fn perform_stresstest(
    service_config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    let aggregator: Arc<Aggregator<Value, SimulatedError>> =
        Arc::new(Aggregator::from_config(&service_config.cache));

    // initialize workloads
    let workloads: Vec<_> = workloads
        .workloads
        .into_iter()
        .map(|workload| prepare_workload(workload).map(Arc::new))
        .collect::<Result<_>>()?;

    // warmup: run each workload once to make sure caches are warm
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let aggregator = Arc::clone(&aggregator);
            let workload = Arc::clone(workload);
            tokio::spawn(async move { aggregator.fetch_all(workload.request(), None).await })
        });

        for result in futures::future::join_all(futures).await {
            let result = result.context("warmup task panicked")??;
            println!("{}", serde_json::to_string(&result.summary())?);
        }

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in workloads.into_iter() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);
        let aggregator = Arc::clone(&aggregator);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let workload = Arc::clone(&workload);
                        let aggregator = Arc::clone(&aggregator);
                        let task_durations = Arc::clone(&task_durations);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new(&workload.view, "stresstest");
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let result = aggregator.fetch_all(workload.request(), None).await;
                            if let Err(error) = result {
                                tracing::error!(error = %error, "Invalid workload");
                            }

                            transaction.finish();

                            lock(&task_durations).add(task_start.elapsed().as_secs_f64());

                            drop(permit);
                        };
                        let future = future.bind_hub(hub);

                        tokio::spawn(future);
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let task_durations: DDSketch = std::mem::take(&mut *lock(&task_durations));

            (workload, task_durations)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for task in finished_tasks {
        let (workload, task_durations) = task.context("workload task panicked")?;
        let PreparedWorkload {
            view, concurrency, ..
        } = workload.as_ref();

        let ops = task_durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!(
            "Workload {view} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s"
        );

        if ops == 0 {
            continue;
        }
        let quantile = |q| {
            let secs = task_durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(task_durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }
    println!();

    let stats = aggregator.cache().stats();
    println!("Cache: {}", serde_json::to_string_pretty(&stats)?);
    println!("  hit ratio: {:.2}%", stats.hit_ratio() * 100.0);

    Ok(())
}
