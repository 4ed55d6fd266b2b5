//! Per-invocation handler context.

use std::sync::{Arc, Mutex, MutexGuard};

use super::log::RawMessage;
use super::route::Route;
use crate::queue::CancelToken;

/// What a handler sees for one read batch.
///
/// Created fresh for every batch and discarded once the batch is
/// acknowledged. Clones share the acknowledgement list.
#[derive(Clone)]
pub struct Context {
    cancel: CancelToken,
    route: Arc<Route>,
    msgs: Arc<[RawMessage]>,
    acks: Arc<Mutex<Vec<String>>>,
}

impl Context {
    pub fn new(cancel: CancelToken, route: Arc<Route>, msgs: Vec<RawMessage>) -> Self {
        Self {
            cancel,
            route,
            msgs: msgs.into(),
            acks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The same invocation observing a different cancellation signal.
    pub fn with_cancel(&self, cancel: CancelToken) -> Self {
        Self {
            cancel,
            ..self.clone()
        }
    }

    pub fn cancel(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Whether the route reads more than one entry at a time.
    pub fn is_batch(&self) -> bool {
        self.route.is_batch()
    }

    /// First message of the batch.
    pub fn msg(&self) -> Option<&RawMessage> {
        self.msgs.first()
    }

    pub fn msgs(&self) -> &[RawMessage] {
        &self.msgs
    }

    /// Acknowledge the given entries.
    ///
    /// When nothing is acknowledged explicitly, the whole batch is
    /// acknowledged if the handler succeeds.
    pub fn ack<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.acks().extend(ids.into_iter().map(Into::into));
    }

    /// Ids acknowledged so far.
    pub fn acked_ids(&self) -> Vec<String> {
        self.acks().clone()
    }

    fn acks(&self) -> MutexGuard<'_, Vec<String>> {
        self.acks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("route", &self.route.span_name())
            .field("msgs", &self.msgs.len())
            .field("acks", &self.acked_ids())
            .finish()
    }
}
