use anyhow::Result;
use fanout_service::config::Config;
use fanout_service::{logging, metrics};

/// Keeps the Sentry client alive, flushing outstanding events when dropped.
#[derive(Default)]
pub struct Guard {
    _sentry: Option<sentry::ClientInitGuard>,
}

/// Sets up Sentry, logging and metrics from the service configuration.
///
/// Sentry is only enabled when a DSN is configured, and metrics only when a statsd host is.
///
/// # Safety
/// This calls [`logging::init_logging`], which modifies the environment. It must be called before
/// any other threads are spawned.
pub unsafe fn init(config: &Config) -> Result<Guard> {
    // SAFETY: As documented, this function may only be called in a single-threaded context.
    unsafe { logging::init_logging(config) };

    let mut guard = Guard::default();

    if let Some(dsn) = config.sentry_dsn.clone() {
        guard._sentry = Some(sentry::init(sentry::ClientOptions {
            dsn: Some(dsn),
            release: sentry::release_name!(),
            traces_sample_rate: 1.0,
            ..Default::default()
        }));
    }

    if let Some(ref statsd) = config.metrics.statsd {
        // have some default tags, just to be closer to the real world config
        let mut tags = config.metrics.custom_tags.clone();
        tags.entry("host".into()).or_insert_with(|| "stresstest".into());
        tags.entry("env".into()).or_insert_with(|| "stresstest".into());

        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    Ok(guard)
}
