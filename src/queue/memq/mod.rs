//! In-memory publish-subscribe bus.
//!
//! A single dispatcher drains one bounded event queue and fans each event
//! out to the subscribers registered under the event's routing key. Every
//! subscriber owns a bounded buffer; when it is full the event is dropped
//! for that subscriber only, so a slow consumer never blocks the dispatcher
//! or its peers. Nothing is persisted: a subscription only observes events
//! published after it was registered.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, Weak};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{CancelToken, PubSub, QueueError, Result, Server, Subscription};

/// Default capacity of the shared publish queue.
pub const DEFAULT_PUB_CAPACITY: usize = 1000;
/// Default capacity of each subscriber buffer.
pub const DEFAULT_SUB_CAPACITY: usize = 100;

/// What `publish` does when the shared queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishPolicy {
    /// Return `QueueError::Full` immediately.
    #[default]
    FailFast,
    /// Wait for room, the caller's cancellation, or shutdown.
    Block,
}

/// Configuration for the in-memory bus.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemqConfig {
    /// Capacity of the shared publish queue. Zero selects the default.
    pub pub_capacity: usize,
    /// Capacity of each subscriber buffer. Zero selects the default.
    pub sub_capacity: usize,
    pub publish_policy: PublishPolicy,
}

impl Default for MemqConfig {
    fn default() -> Self {
        Self {
            pub_capacity: DEFAULT_PUB_CAPACITY,
            sub_capacity: DEFAULT_SUB_CAPACITY,
            publish_policy: PublishPolicy::FailFast,
        }
    }
}

type KeyFn<K, E> = Box<dyn Fn(&E) -> K + Send + Sync>;

/// Senders of one key, rebuilt whenever its subscriptions change.
type Targets<E> = Arc<[(u64, mpsc::Sender<E>)]>;

/// Subscribers grouped by key, then by subscriber id.
struct Registry<K, E> {
    next_id: u64,
    subs: HashMap<K, HashMap<u64, mpsc::Sender<E>>>,
}

struct Shared<K, E> {
    key_fn: KeyFn<K, E>,
    sub_capacity: usize,
    policy: PublishPolicy,
    events_tx: mpsc::Sender<E>,
    /// Held by the running dispatcher.
    events_rx: tokio::sync::Mutex<mpsc::Receiver<E>>,
    /// Guards registration and removal only.
    registry: Mutex<Registry<K, E>>,
    /// Per-key snapshots read by the dispatcher.
    targets: RwLock<HashMap<K, Targets<E>>>,
    closed: AtomicBool,
    close_tx: watch::Sender<bool>,
}

impl<K, E> Shared<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    fn registry(&self) -> MutexGuard<'_, Registry<K, E>> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn targets(&self) -> RwLockReadGuard<'_, HashMap<K, Targets<E>>> {
        self.targets.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the dispatcher's snapshot of `key`. Called with the registry locked.
    fn refresh_targets(&self, registry: &Registry<K, E>, key: &K) {
        let mut targets = self.targets.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        match registry.subs.get(key) {
            Some(subs) => {
                let snapshot: Targets<E> = subs.iter().map(|(id, tx)| (*id, tx.clone())).collect();
                targets.insert(key.clone(), snapshot);
            }
            None => {
                targets.remove(key);
            }
        }
    }

    fn is_stopped(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Transition to stopped exactly once.
    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.close_tx.send_replace(true);
        // Dropping the senders ends every subscriber's stream.
        let mut registry = self.registry();
        registry.subs.clear();
        self.targets
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        drop(registry);
        info!("Memory bus stopped");
    }

    fn dispatch(&self, event: E) {
        let key = (self.key_fn)(&event);

        let targets = match self.targets().get(&key) {
            Some(targets) => targets.clone(),
            None => return,
        };

        for (id, tx) in targets.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(key = ?key, subscriber = *id, "Subscriber buffer full, message dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(key = ?key, subscriber = *id, "Subscriber gone, message dropped");
                }
            }
        }
    }

    fn unsubscribe(&self, key: &K, id: u64) {
        let mut registry = self.registry();
        if let Some(subs) = registry.subs.get_mut(key) {
            subs.remove(&id);
            if subs.is_empty() {
                registry.subs.remove(key);
            }
        }
        self.refresh_targets(&registry, key);
    }
}

/// In-memory implementation of the publish-subscribe contract.
///
/// The routing key of each event is computed by a caller-supplied
/// function; subscribers are matched purely by the key's value.
///
/// ```ignore
/// let bus = Arc::new(MemQueue::new(|log: &Log| log.id));
/// tokio::spawn({ let bus = bus.clone(); async move { bus.start(&CancelToken::never()).await } });
/// let mut sub = bus.subscribe(&CancelToken::never(), 7).await?;
/// bus.publish(&CancelToken::never(), Log { id: 7, status: 1 }).await?;
/// ```
pub struct MemQueue<K, E> {
    inner: Arc<Shared<K, E>>,
}

impl<K, E> MemQueue<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    /// Create a bus with default capacities and the fail-fast publish policy.
    pub fn new<F>(key_fn: F) -> Self
    where
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        Self::with_config(key_fn, MemqConfig::default())
    }

    pub fn with_config<F>(key_fn: F, config: MemqConfig) -> Self
    where
        F: Fn(&E) -> K + Send + Sync + 'static,
    {
        let pub_capacity = non_zero_or(config.pub_capacity, DEFAULT_PUB_CAPACITY);
        let sub_capacity = non_zero_or(config.sub_capacity, DEFAULT_SUB_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(pub_capacity);
        let (close_tx, _) = watch::channel(false);

        debug!(
            pub_capacity,
            sub_capacity,
            policy = ?config.publish_policy,
            "Memory bus initialized"
        );

        Self {
            inner: Arc::new(Shared {
                key_fn: Box::new(key_fn),
                sub_capacity,
                policy: config.publish_policy,
                events_tx,
                events_rx: tokio::sync::Mutex::new(events_rx),
                registry: Mutex::new(Registry {
                    next_id: 0,
                    subs: HashMap::new(),
                }),
                targets: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
                close_tx,
            }),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Number of live subscriptions for `key`.
    pub fn subscriber_count(&self, key: &K) -> usize {
        self.inner
            .registry()
            .subs
            .get(key)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    async fn wait_closed(&self) {
        let mut closed = self.inner.close_tx.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

fn non_zero_or(value: usize, default: usize) -> usize {
    if value == 0 {
        default
    } else {
        value
    }
}

#[async_trait]
impl<K, E> Server for MemQueue<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    /// Run the dispatcher.
    ///
    /// Returns `Stopped` once the bus is stopped, or the token's error when
    /// `cancel` fires; cancellation also stops the bus.
    async fn start(&self, cancel: &CancelToken) -> Result<()> {
        if self.is_stopped() {
            return Err(QueueError::Stopped);
        }
        let Ok(mut events) = self.inner.events_rx.try_lock() else {
            return Err(QueueError::AlreadyStarted);
        };

        info!("Memory bus dispatcher started");

        loop {
            tokio::select! {
                biased;
                err = cancel.done() => {
                    self.inner.close();
                    return Err(err);
                }
                _ = self.wait_closed() => return Err(QueueError::Stopped),
                Some(event) = events.recv() => self.inner.dispatch(event),
            }
        }
    }

    async fn stop(&self, cancel: &CancelToken) -> Result<()> {
        if let Some(err) = cancel.err() {
            return Err(err);
        }
        self.inner.close();
        Ok(())
    }
}

#[async_trait]
impl<K, E> PubSub<K, E> for MemQueue<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    type Sub = MemSubscription<K, E>;

    async fn publish(&self, cancel: &CancelToken, event: E) -> Result<()> {
        if let Some(err) = cancel.err() {
            return Err(err);
        }
        if self.is_stopped() {
            return Err(QueueError::Stopped);
        }

        match self.inner.policy {
            PublishPolicy::FailFast => match self.inner.events_tx.try_send(event) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(QueueError::Full),
                Err(TrySendError::Closed(_)) => Err(QueueError::Stopped),
            },
            PublishPolicy::Block => {
                tokio::select! {
                    biased;
                    err = cancel.done() => Err(err),
                    _ = self.wait_closed() => Err(QueueError::Stopped),
                    sent = self.inner.events_tx.send(event) => sent.map_err(|_| QueueError::Stopped),
                }
            }
        }
    }

    async fn subscribe(&self, cancel: &CancelToken, key: K) -> Result<MemSubscription<K, E>> {
        if let Some(err) = cancel.err() {
            return Err(err);
        }

        let (tx, rx) = mpsc::channel(self.inner.sub_capacity);
        let id = {
            let mut registry = self.inner.registry();
            // Checked under the lock so a concurrent stop cannot miss this entry.
            if self.is_stopped() {
                return Err(QueueError::Stopped);
            }
            registry.next_id += 1;
            let id = registry.next_id;
            registry.subs.entry(key.clone()).or_default().insert(id, tx);
            self.inner.refresh_targets(&registry, &key);
            id
        };

        debug!(key = ?key, subscriber = id, "Subscribed to memory bus");

        Ok(MemSubscription {
            id,
            key,
            rx,
            owner: Arc::downgrade(&self.inner),
            cancelled: false,
        })
    }
}

/// A subscription on a `MemQueue`.
///
/// Dropping the subscription unregisters it.
pub struct MemSubscription<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    id: u64,
    key: K,
    rx: mpsc::Receiver<E>,
    owner: Weak<Shared<K, E>>,
    cancelled: bool,
}

impl<K, E> MemSubscription<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Take an already buffered event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

#[async_trait]
impl<K, E> Subscription<E> for MemSubscription<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        if let Some(owner) = self.owner.upgrade() {
            owner.unsubscribe(&self.key, self.id);
        }
        self.rx.close();
        debug!(key = ?self.key, subscriber = self.id, "Unsubscribed from memory bus");
    }
}

impl<K, E> Drop for MemSubscription<K, E>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    E: Clone + Send + 'static,
{
    fn drop(&mut self) {
        self.cancel();
    }
}
