//! Bootstrap utilities for streamq binaries.

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable holding the tracing filter.
pub const LOG_FILTER_ENV: &str = "STREAMQ_LOG";

/// Initialize tracing with the STREAMQ_LOG environment variable.
///
/// Defaults to "info" level if STREAMQ_LOG is not set.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_FILTER_ENV)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Backoff for connecting to backing services at startup.
///
/// 100ms doubling up to 5s, 30 retries, with jitter.
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(30)
        .with_jitter()
}

/// Connect to a backing service, retrying failures with `backoff`.
///
/// Returns the connected client, or the last error once retries run out.
pub async fn connect_with_retry<T, E, F, Fut>(
    service_name: &str,
    address: &str,
    backoff: ExponentialBuilder,
    connect: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let connected = connect
        .retry(backoff)
        .notify(|err: &E, dur: Duration| {
            warn!(service = %service_name, error = %err, delay = ?dur, "Connection failed, retrying");
        })
        .await;

    match &connected {
        Ok(_) => info!(service = %service_name, address = %address, "Connected"),
        Err(e) => error!(service = %service_name, address = %address, error = %e, "Connection failed, giving up"),
    }
    connected
}
