//! Cancellation signal for blocking queue operations.
//!
//! A `CancelToken` is observed by every operation that may wait: publishing
//! into a full buffer, running a dispatch loop, waiting for a consumer to
//! shut down. It fires either when its `CancelHandle` is cancelled or when
//! its deadline passes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use super::QueueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Active,
    Cancelled,
    DeadlineExceeded,
}

impl State {
    fn reason(self) -> Option<QueueError> {
        match self {
            State::Active => None,
            State::Cancelled => Some(QueueError::Cancelled),
            State::DeadlineExceeded => Some(QueueError::DeadlineExceeded),
        }
    }
}

/// Cancels every token created from it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<State>>,
}

impl CancelHandle {
    /// Fire the signal. Later calls are no-ops.
    pub fn cancel(&self) {
        self.fire(State::Cancelled);
    }

    /// Fire the signal, reporting `reason` to observers when it is a deadline.
    pub(crate) fn cancel_with(&self, reason: &QueueError) {
        match reason {
            QueueError::DeadlineExceeded => self.fire(State::DeadlineExceeded),
            _ => self.fire(State::Cancelled),
        }
    }

    fn fire(&self, fired: State) {
        self.tx.send_if_modified(|state| {
            if *state == State::Active {
                *state = fired;
                true
            } else {
                false
            }
        });
    }

    /// Create another token observing this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
            _anchor: self.tx.clone(),
            deadline: None,
        }
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<State>,
    // Keeps the channel open so a dropped handle never reads as cancellation.
    _anchor: Arc<watch::Sender<State>>,
    deadline: Option<Instant>,
}

impl CancelToken {
    /// Create a handle/token pair.
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> (CancelHandle, CancelToken) {
        let (tx, _) = watch::channel(State::Active);
        let handle = CancelHandle { tx: Arc::new(tx) };
        let token = handle.token();
        (handle, token)
    }

    /// A token that never fires.
    pub fn never() -> Self {
        Self::new().1
    }

    /// A token that fires once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::never().timeout(timeout)
    }

    /// Derive a token that also fires after `timeout`, keeping the earlier deadline.
    pub fn timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        let mut token = self.clone();
        token.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        token
    }

    /// Derive a token that also carries the deadline of `other`, if earlier.
    pub fn bounded_by(&self, other: &CancelToken) -> Self {
        let mut token = self.clone();
        token.deadline = match (self.deadline, other.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        token
    }

    /// The error describing why this token fired, if it has.
    pub fn err(&self) -> Option<QueueError> {
        let fired = *self.rx.borrow();
        if let Some(reason) = fired.reason() {
            return Some(reason);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(QueueError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Wait until the token fires and return the reason.
    pub async fn done(&self) -> QueueError {
        let mut rx = self.rx.clone();
        let cancelled = async move {
            // The sender is anchored by this token, so this only returns once fired.
            let fired = rx
                .wait_for(|state| *state != State::Active)
                .await
                .map(|state| *state)
                .unwrap_or(State::Cancelled);
            fired.reason().unwrap_or(QueueError::Cancelled)
        };

        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    reason = cancelled => reason,
                    _ = tokio::time::sleep_until(deadline) => QueueError::DeadlineExceeded,
                }
            }
            None => cancelled.await,
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::never()
    }
}
