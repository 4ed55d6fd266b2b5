//! Durable consumer runtime over Redis Streams consumer groups.
//!
//! This module contains:
//! - `StreamLog` trait: the five log primitives the runtime needs
//! - `Consumer`: per-route workers with pending recovery, acknowledgement and trimming
//! - `Route` / `Context`: route declaration and per-batch handler context
//! - `publish`: producer side
//! - Implementations: `RedisStreamLog` (feature `redis`), `MemoryStreamLog`
//!
//! Delivery is at-least-once: a batch is acknowledged only after its
//! handler succeeds, or as far as the handler acknowledged it explicitly.

use serde::Serialize;
use tracing::debug;

pub mod consumer;
pub mod context;
pub mod log;
pub mod memory;
pub mod middleware;
#[cfg(feature = "redis")]
pub mod redis_log;
pub mod route;
pub mod wire;

// Re-exports
pub use consumer::{Consumer, ConsumerConfig, DEFAULT_CONSUMER_NAME, DEFAULT_MAX_LEN};
pub use context::Context;
pub use log::{GroupRead, LogError, LogResult, RawMessage, ReadCursor, StreamLog};
pub use memory::MemoryStreamLog;
pub use middleware::{recover, trace};
#[cfg(feature = "redis")]
pub use redis_log::RedisStreamLog;
pub use route::Route;

use super::message::{CodecError, TypedMessage};

/// Route handler.
pub type Handler = crate::middleware::Handler<Context, HandlerError>;

/// Route handler middleware.
pub type Middleware = crate::middleware::Middleware<Context, HandlerError>;

// ============================================================================
// Errors
// ============================================================================

/// Errors returned by route handlers.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Handler panicked: {message}")]
    Panicked { message: String },

    #[error("Failed to decode message {id}: {source}")]
    Decode { id: String, source: CodecError },

    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        HandlerError::Other(err.into())
    }
}

/// Failure of one read, dispatch and acknowledge cycle.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Nothing to read. Not a failure; the worker idles.
    #[error("No data")]
    NoData,

    #[error("Read timed out")]
    ReadTimeout,

    #[error("Read failed: {0}")]
    Read(LogError),

    #[error("Failed to ack deleted entries: {0}")]
    AckDeleted(LogError),

    #[error("Ack failed: {0}")]
    Ack(LogError),

    #[error("{0}")]
    Handler(HandlerError),

    #[error("{handler}; ack failed: {ack}")]
    HandlerAndAck { handler: HandlerError, ack: LogError },
}

// ============================================================================
// Producer
// ============================================================================

/// Encode a typed message and append it to `stream`, returning the entry id.
pub async fn publish<T: Serialize>(
    log: &dyn StreamLog,
    stream: &str,
    msg: &TypedMessage<T>,
) -> crate::queue::Result<String> {
    let encoded = msg.encode()?;
    let fields = wire::to_fields(&encoded)?;
    let id = log.append(stream, fields).await?;

    debug!(
        stream = %stream,
        id = %id,
        content_length = encoded.content_length(),
        "Published message"
    );
    Ok(id)
}

#[cfg(test)]
mod tests;
