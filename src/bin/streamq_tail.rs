//! streamq-tail: log every message arriving on a Redis stream
//!
//! Joins a consumer group on one stream and prints each envelope as a
//! structured log line. Useful for debugging producers.
//!
//! ## Configuration
//! - STREAMQ_CONFIG: YAML config file (default: streamq.yaml)
//! - STREAMQ_REDIS_URL / STREAMQ_CONSUMER_NAME: override the config file
//! - STREAMQ_TAIL_STREAM: stream to tail (required)
//! - STREAMQ_TAIL_GROUP: consumer group (default: streamq-tail)
//! - STREAMQ_TAIL_BATCH: entries per read (default: 10)

use std::sync::Arc;

use tracing::{info, warn};

use streamq::config::Config;
use streamq::middleware::handler_fn;
use streamq::queue::redisq::{recover, trace, wire, Consumer, Context, RedisStreamLog, Route};
use streamq::queue::{CancelToken, Server};
use streamq::utils::bootstrap::{connect_with_retry, connection_backoff, init_tracing};

const DEFAULT_GROUP: &str = "streamq-tail";
const DEFAULT_BATCH: usize = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load()?;
    let stream = std::env::var("STREAMQ_TAIL_STREAM")
        .map_err(|_| "STREAMQ_TAIL_STREAM must name the stream to tail")?;
    let group = std::env::var("STREAMQ_TAIL_GROUP").unwrap_or_else(|_| DEFAULT_GROUP.to_string());
    let batch_size = std::env::var("STREAMQ_TAIL_BATCH")
        .ok()
        .and_then(|b| b.parse().ok())
        .unwrap_or(DEFAULT_BATCH);

    let url = config.redisq.url.clone();
    let log = connect_with_retry("redis", &url, connection_backoff(), || RedisStreamLog::new(&url)).await?;

    let mut consumer = Consumer::new(Arc::new(log), config.redisq.consumer.clone())
        .with_middlewares(vec![recover(), trace()]);
    consumer.must_add_route(
        Route::new(stream.clone(), group.clone())
            .with_batch_size(batch_size)
            .with_handler(handler_fn(|ctx: Context| async move {
                for raw in ctx.msgs() {
                    match wire::from_raw(raw) {
                        Ok(msg) => info!(
                            id = %msg.id,
                            content_type = %msg.content_type,
                            created_at = %msg.created_at,
                            metadata = ?msg.metadata,
                            body = %String::from_utf8_lossy(msg.body()),
                            "Message"
                        ),
                        Err(e) => warn!(id = %raw.id, error = %e, "Undecodable entry"),
                    }
                }
                Ok(())
            })),
    );
    let consumer = Arc::new(consumer);

    info!(stream = %stream, group = %group, batch_size, "streamq-tail started");

    let runner = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.start(&CancelToken::never()).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    consumer
        .stop(&CancelToken::with_timeout(std::time::Duration::from_secs(10)))
        .await?;
    runner.await??;

    Ok(())
}
