use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use fanout_service::aggregation::{AggregationRequest, FetchRequest};
use fanout_service::caching::CacheKey;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

impl WorkloadsConfig {
    /// Reads and validates the workloads file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).context("failed to open workloads file")?;
        let config: Self =
            serde_yaml::from_reader(file).context("failed to parse workloads YAML")?;

        for workload in &config.workloads {
            ensure!(
                workload.concurrency > 0,
                "workload `{}` needs a concurrency of at least 1",
                workload.view
            );
            for resource in &workload.resources {
                ensure!(
                    (0.0..=1.0).contains(&resource.failure_rate),
                    "failure rate of `{}` must be between 0 and 1",
                    resource.name
                );
            }
        }

        Ok(config)
    }
}

/// A view that is rendered over and over again.
#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub view: String,
    pub concurrency: usize,
    pub resources: Vec<Resource>,
}

/// A simulated upstream resource.
#[derive(Debug, Deserialize, Serialize)]
pub struct Resource {
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    /// How long a fetch takes.
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    /// Probability of a fetch failing, between `0` and `1`.
    #[serde(default)]
    pub failure_rate: f64,
    /// Overrides the default time-to-live of the cache.
    #[serde(default, with = "humantime_serde")]
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("simulated failure fetching `{0}`")]
pub struct SimulatedError(CacheKey);

#[derive(Debug, Clone)]
struct PreparedResource {
    name: String,
    key: CacheKey,
    latency: Duration,
    failure_rate: f64,
    ttl: Option<Duration>,
}

/// A workload with all of its cache keys resolved.
#[derive(Debug, Clone)]
pub struct PreparedWorkload {
    pub view: String,
    pub concurrency: usize,
    resources: Vec<PreparedResource>,
}

impl PreparedWorkload {
    /// Creates a request with fresh factories for every resource of the view.
    pub fn request(&self) -> AggregationRequest<Value, SimulatedError> {
        let mut request = AggregationRequest::new(self.view.clone());

        for resource in &self.resources {
            let PreparedResource {
                name,
                key,
                latency,
                failure_rate,
                ttl,
            } = resource.clone();

            let factory = {
                let key = key.clone();
                move || simulate_fetch(key, latency, failure_rate)
            };

            let mut fetch = FetchRequest::new(name, key, factory);
            if let Some(ttl) = ttl {
                fetch = fetch.with_ttl(ttl);
            }
            request.push(fetch);
        }

        request
    }
}

pub fn prepare_workload(workload: Workload) -> Result<PreparedWorkload> {
    let resources = workload
        .resources
        .into_iter()
        .map(|resource| {
            let key = CacheKey::for_endpoint(&resource.endpoint, &resource.params)
                .with_context(|| format!("invalid endpoint for resource `{}`", resource.name))?;

            Ok(PreparedResource {
                name: resource.name,
                key,
                latency: resource.latency,
                failure_rate: resource.failure_rate,
                ttl: resource.ttl,
            })
        })
        .collect::<Result<_>>()?;

    Ok(PreparedWorkload {
        view: workload.view,
        concurrency: workload.concurrency,
        resources,
    })
}

async fn simulate_fetch(
    key: CacheKey,
    latency: Duration,
    failure_rate: f64,
) -> Result<Value, SimulatedError> {
    tokio::time::sleep(latency).await;

    if failure_rate > 0.0 && rand::random_bool(failure_rate) {
        return Err(SimulatedError(key));
    }

    Ok(json!({
        "endpoint": key.as_str(),
        "latency_ms": latency.as_millis() as u64,
    }))
}
