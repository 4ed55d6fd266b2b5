//! Message queues.
//!
//! This module contains:
//! - `Server` trait: lifecycle of a long-running engine
//! - `PubSub` / `Subscription` traits: the publish-subscribe contract
//! - `QueueError`: error taxonomy shared by every engine
//! - Implementations: `memq` (in-process bus), `redisq` (Redis Streams consumer groups)

use async_trait::async_trait;

pub mod cancel;
pub mod memq;
pub mod message;
pub mod redisq;

// Re-exports
pub use cancel::{CancelHandle, CancelToken};
pub use memq::{MemQueue, MemSubscription, MemqConfig, PublishPolicy};
pub use message::{Codec, CodecError, Message, Metadata, TypedMessage, MIME_JSON};

// ============================================================================
// Errors
// ============================================================================

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur during queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The engine no longer accepts work. Terminal; do not retry.
    #[error("Queue stopped")]
    Stopped,

    /// The publish buffer has no room. Transient; retry after a delay.
    #[error("Queue full")]
    Full,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("Queue already started")]
    AlreadyStarted,

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Log error: {0}")]
    Log(#[from] redisq::LogError),

    #[error("Route task aborted: {0}")]
    RouteAborted(String),
}

impl QueueError {
    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Full | QueueError::Log(_))
    }

    /// Whether the error was caused by the caller's cancellation signal.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, QueueError::Cancelled | QueueError::DeadlineExceeded)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// A long-running engine.
#[async_trait]
pub trait Server: Send + Sync {
    /// Run the engine until `cancel` fires or `stop` is called.
    async fn start(&self, cancel: &CancelToken) -> Result<()>;

    /// Signal shutdown. Idempotent.
    async fn stop(&self, cancel: &CancelToken) -> Result<()>;
}

/// Receiving side of a subscription.
#[async_trait]
pub trait Subscription<E: Send>: Send {
    /// Wait for the next event.
    ///
    /// Returns `None` once the subscription is cancelled and drained,
    /// or after the engine stopped.
    async fn recv(&mut self) -> Option<E>;

    /// Unregister from the engine. Idempotent.
    fn cancel(&mut self);
}

/// Publish-subscribe over events of type `E` routed by keys of type `K`.
#[async_trait]
pub trait PubSub<K, E>: Server
where
    K: Send + 'static,
    E: Send + 'static,
{
    type Sub: Subscription<E>;

    /// Enqueue one event.
    async fn publish(&self, cancel: &CancelToken, event: E) -> Result<()>;

    /// Register a new subscription for `key`.
    async fn subscribe(&self, cancel: &CancelToken, key: K) -> Result<Self::Sub>;
}
