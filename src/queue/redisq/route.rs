//! Route declaration.

use std::fmt;

use super::Handler;

/// One (stream, group) pair consumed by a handler.
///
/// Zero or empty values are replaced by defaults when the route is added
/// to a consumer: pending id `"0"`, batch size 1 and the consumer's
/// default max length.
#[derive(Clone)]
pub struct Route {
    pub stream: String,
    pub group: String,
    /// Start id for pending recovery.
    pub pending_id: String,
    pub handler: Option<Handler>,
    /// Skip pending recovery and read new entries only.
    pub no_pending: bool,
    /// Entries fetched per read.
    pub batch_size: usize,
    /// Approximate length the trimmer keeps the stream at.
    pub max_len: u64,
}

impl Route {
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
            pending_id: String::new(),
            handler: None,
            no_pending: false,
            batch_size: 0,
            max_len: 0,
        }
    }

    pub fn with_handler(mut self, handler: Handler) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_pending_id(mut self, pending_id: impl Into<String>) -> Self {
        self.pending_id = pending_id.into();
        self
    }

    pub fn skip_pending(mut self) -> Self {
        self.no_pending = true;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_max_len(mut self, max_len: u64) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn is_batch(&self) -> bool {
        self.batch_size > 1
    }

    /// Span name used when tracing invocations.
    pub fn span_name(&self) -> String {
        format!("/redisq/{}/{}", self.stream, self.group)
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("stream", &self.stream)
            .field("group", &self.group)
            .field("pending_id", &self.pending_id)
            .field("has_handler", &self.handler.is_some())
            .field("no_pending", &self.no_pending)
            .field("batch_size", &self.batch_size)
            .field("max_len", &self.max_len)
            .finish()
    }
}
