//! Consumer-group runtime.
//!
//! `Consumer::start` runs one worker per route plus a trimmer, all
//! sharing one shutdown signal. A worker first replays the entries still
//! pending for its consumer identity, then switches to new entries for
//! good. Each read batch goes through the middleware chain to the route
//! handler and is acknowledged according to what the handler reported.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::context::Context;
use super::log::{GroupRead, LogError, RawMessage, ReadCursor, StreamLog};
use super::route::Route;
use super::{wire, Handler, HandlerError, Middleware, RouteError};
use crate::middleware::{chain, handler_fn};
use crate::queue::{CancelHandle, CancelToken, QueueError, Result, Server, TypedMessage};

/// Default approximate stream length kept by the trimmer.
pub const DEFAULT_MAX_LEN: u64 = 10_000;
/// Default consumer identity within a group.
pub const DEFAULT_CONSUMER_NAME: &str = "c1";

/// Runtime settings of a consumer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Consumer identity used for group reads.
    pub consumer_name: String,
    /// Max length for routes that do not set one.
    pub default_max_len: u64,
    /// Upper bound of every log call made by a worker.
    pub read_timeout_ms: u64,
    /// Pause after a read that returned nothing.
    pub idle_backoff_ms: u64,
    /// Pause after any other failed cycle.
    pub error_backoff_ms: u64,
    pub trim_interval_ms: u64,
    pub trim_timeout_ms: u64,
    /// Create missing groups (and streams) when starting.
    pub create_groups: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_name: DEFAULT_CONSUMER_NAME.to_string(),
            default_max_len: DEFAULT_MAX_LEN,
            read_timeout_ms: 2_000,
            idle_backoff_ms: 60_000,
            error_backoff_ms: 3_000,
            trim_interval_ms: 180_000,
            trim_timeout_ms: 3_000,
            create_groups: true,
        }
    }
}

impl ConsumerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn trim_interval(&self) -> Duration {
        Duration::from_millis(self.trim_interval_ms)
    }

    pub fn trim_timeout(&self) -> Duration {
        Duration::from_millis(self.trim_timeout_ms)
    }
}

struct Registered {
    route: Arc<Route>,
    handler: Handler,
}

/// Durable consumer over a `StreamLog`.
///
/// ```ignore
/// let mut consumer = Consumer::new(log, ConsumerConfig::default())
///     .with_middlewares(vec![recover(), trace()]);
/// consumer.must_add_handler(Route::new("orders", "billing"), |ctx, msg: TypedMessage<Order>| async move {
///     bill(msg.payload).await.map_err(HandlerError::other)
/// });
/// consumer.start(&CancelToken::never()).await?;
/// ```
pub struct Consumer {
    log: Arc<dyn StreamLog>,
    config: ConsumerConfig,
    middlewares: Vec<Middleware>,
    routes: Vec<Registered>,
    started: AtomicBool,
    shutdown: CancelHandle,
    shutdown_token: CancelToken,
    finished: watch::Sender<bool>,
    trim_errors: Arc<AtomicU64>,
}

impl Consumer {
    pub fn new(log: Arc<dyn StreamLog>, config: ConsumerConfig) -> Self {
        let (shutdown, shutdown_token) = CancelToken::new();
        let (finished, _) = watch::channel(false);
        Self {
            log,
            config,
            middlewares: Vec::new(),
            routes: Vec::new(),
            started: AtomicBool::new(false),
            shutdown,
            shutdown_token,
            finished,
            trim_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Append middlewares, applied to every route handler in the given order.
    pub fn with_middlewares(mut self, middlewares: Vec<Middleware>) -> Self {
        self.middlewares.extend(middlewares);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Registered routes, with defaults applied.
    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.iter().map(|r| r.route.as_ref())
    }

    /// Consecutive failed trims; reset by the next successful one.
    pub fn trim_error_count(&self) -> u64 {
        self.trim_errors.load(Ordering::Relaxed)
    }

    /// Register a route.
    ///
    /// # Panics
    ///
    /// If the route has no handler or the consumer was already started.
    pub fn must_add_route(&mut self, mut route: Route) -> &mut Self {
        if self.started.load(Ordering::Acquire) {
            panic!("redisq: route {} added after start", route.span_name());
        }
        let Some(handler) = route.handler.clone() else {
            panic!("redisq: no handler provided for route {}", route.span_name());
        };

        if route.pending_id.is_empty() {
            route.pending_id = "0".to_string();
        }
        if route.batch_size == 0 {
            route.batch_size = 1;
        }
        if route.max_len == 0 {
            route.max_len = self.config.default_max_len;
        }

        debug!(
            stream = %route.stream,
            group = %route.group,
            batch_size = route.batch_size,
            max_len = route.max_len,
            "Route registered"
        );
        self.routes.push(Registered {
            route: Arc::new(route),
            handler,
        });
        self
    }

    /// Register a handler receiving the first entry of each batch, decoded.
    pub fn must_add_handler<T, F, Fut>(&mut self, route: Route, handler: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Context, TypedMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let raw = handler_fn(move |ctx: Context| {
            let handler = handler.clone();
            async move {
                let msg = match ctx.msg() {
                    Some(raw) => decode::<T>(raw)?,
                    None => return Ok(()),
                };
                handler(ctx, msg).await
            }
        });
        self.must_add_route(route.with_handler(raw))
    }

    /// Register a handler receiving the whole batch, decoded.
    ///
    /// The first entry that fails to decode fails the batch.
    pub fn must_add_batch_handler<T, F, Fut>(&mut self, route: Route, handler: F) -> &mut Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Context, Vec<TypedMessage<T>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let raw = handler_fn(move |ctx: Context| {
            let handler = handler.clone();
            async move {
                let msgs = ctx
                    .msgs()
                    .iter()
                    .map(decode::<T>)
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                handler(ctx, msgs).await
            }
        });
        self.must_add_route(route.with_handler(raw))
    }

    async fn create_groups(&self) {
        for Registered { route, .. } in &self.routes {
            let created = tokio::time::timeout(
                self.config.read_timeout(),
                self.log.create_group(&route.stream, &route.group, "0"),
            )
            .await
            .unwrap_or(Err(LogError::Timeout));

            if let Err(e) = created {
                warn!(
                    stream = %route.stream,
                    group = %route.group,
                    error = %e,
                    "Failed to create consumer group"
                );
            }
        }
    }

    async fn wait_finished(&self) {
        let mut finished = self.finished.subscribe();
        let _ = finished.wait_for(|finished| *finished).await;
    }
}

/// Outcome of `start` once the caller's token fired.
fn stopped_by(err: QueueError) -> Result<()> {
    match err {
        QueueError::Cancelled => Ok(()),
        err => Err(err),
    }
}

fn aborted(reason: String) -> QueueError {
    error!(reason = %reason, "Stream consumer task aborted");
    QueueError::RouteAborted(reason)
}

fn decode<T: DeserializeOwned>(raw: &RawMessage) -> std::result::Result<TypedMessage<T>, HandlerError> {
    wire::from_raw(raw)
        .and_then(|msg| msg.decode())
        .map_err(|source| HandlerError::Decode {
            id: raw.id.clone(),
            source,
        })
}

#[async_trait]
impl Server for Consumer {
    /// Run every route until `cancel` fires or `stop` is called.
    ///
    /// Returns `Ok` on cancellation or stop, the deadline error when the
    /// caller's deadline passes, and `RouteAborted` when a worker dies.
    async fn start(&self, cancel: &CancelToken) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(QueueError::AlreadyStarted);
        }

        info!(
            consumer = %self.config.consumer_name,
            routes = self.routes.len(),
            "Stream consumer starting"
        );

        if self.config.create_groups {
            self.create_groups().await;
        }

        // Workers see the caller's deadline as well as the shutdown signal.
        let worker_token = self.shutdown_token.bounded_by(cancel);

        let mut tasks = JoinSet::new();
        let trimmer = Trimmer {
            log: self.log.clone(),
            targets: trim_targets(self.routes.iter().map(|r| r.route.as_ref())),
            interval: self.config.trim_interval(),
            timeout: self.config.trim_timeout(),
            err_count: self.trim_errors.clone(),
        };
        tasks.spawn(
            trimmer
                .run(worker_token.clone())
                .instrument(info_span!("trim")),
        );

        for Registered { route, handler } in &self.routes {
            let span = info_span!("route", stream = %route.stream, group = %route.group);
            let worker = RouteWorker {
                log: self.log.clone(),
                handler: chain(self.middlewares.clone())(handler.clone()),
                consumer: self.config.consumer_name.clone(),
                pending_id: route.pending_id.clone(),
                pending_done: route.no_pending,
                route: route.clone(),
                config: self.config.clone(),
            };
            tasks.spawn(worker.run(worker_token.clone()).instrument(span));
        }

        let result = tokio::select! {
            biased;
            err = cancel.done() => {
                self.shutdown.cancel_with(&err);
                stopped_by(err)
            }
            _ = self.shutdown_token.done() => Ok(()),
            Some(joined) = tasks.join_next() => match joined {
                Ok(()) if self.shutdown_token.is_done() => Ok(()),
                Ok(()) => match cancel.err() {
                    Some(err) => stopped_by(err),
                    None => Err(aborted("task exited".to_string())),
                },
                Err(e) => Err(aborted(e.to_string())),
            },
        };

        self.shutdown.cancel();
        while tasks.join_next().await.is_some() {}
        self.finished.send_replace(true);
        info!(consumer = %self.config.consumer_name, "Stream consumer stopped");

        result
    }

    /// Signal shutdown and wait, bounded by `cancel`, for `start` to return.
    async fn stop(&self, cancel: &CancelToken) -> Result<()> {
        self.shutdown.cancel();
        if !self.started.load(Ordering::Acquire) {
            return Ok(());
        }
        tokio::select! {
            _ = self.wait_finished() => Ok(()),
            err = cancel.done() => Err(err),
        }
    }
}

// ============================================================================
// Route worker
// ============================================================================

/// Owns the read cursor of one route.
struct RouteWorker {
    log: Arc<dyn StreamLog>,
    route: Arc<Route>,
    handler: Handler,
    consumer: String,
    config: ConsumerConfig,
    pending_id: String,
    pending_done: bool,
}

impl RouteWorker {
    async fn run(mut self, cancel: CancelToken) {
        info!("Route started");
        while !cancel.is_done() {
            let pause = match self.handle(&cancel).await {
                Ok(()) => continue,
                Err(RouteError::NoData) => {
                    debug!("No message");
                    self.config.idle_backoff()
                }
                Err(e) => {
                    error!(error = %e, "Route cycle failed");
                    self.config.error_backoff()
                }
            };
            tokio::select! {
                _ = cancel.done() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!("Route stopped");
    }

    /// One read, dispatch and acknowledge cycle.
    async fn handle(&mut self, cancel: &CancelToken) -> std::result::Result<(), RouteError> {
        let msgs = self.read_checked().await?;
        let all_ids: Vec<String> = msgs.iter().map(|m| m.id.clone()).collect();

        let ctx = Context::new(cancel.clone(), self.route.clone(), msgs);
        let result = (self.handler)(ctx.clone()).await;

        let acked = ctx.acked_ids();
        if !acked.is_empty() {
            let ack = self.ack(&acked).await;
            return match (result, ack) {
                (Ok(()), Ok(())) => Ok(()),
                (Err(handler), Ok(())) => Err(RouteError::Handler(handler)),
                (Ok(()), Err(ack)) => Err(RouteError::Ack(ack)),
                (Err(handler), Err(ack)) => Err(RouteError::HandlerAndAck { handler, ack }),
            };
        }

        result.map_err(RouteError::Handler)?;
        self.ack(&all_ids).await.map_err(RouteError::Ack)
    }

    /// Read the next batch, acknowledging and skipping deleted entries.
    async fn read_checked(&mut self) -> std::result::Result<Vec<RawMessage>, RouteError> {
        loop {
            let (live, deleted): (Vec<_>, Vec<_>) =
                self.read().await?.into_iter().partition(|m| !m.is_deleted());

            if !deleted.is_empty() {
                let ids: Vec<String> = deleted.into_iter().map(|m| m.id).collect();
                debug!(count = ids.len(), "Acknowledging deleted entries");
                self.ack(&ids).await.map_err(RouteError::AckDeleted)?;
            }
            if !live.is_empty() {
                return Ok(live);
            }
        }
    }

    async fn read(&mut self) -> std::result::Result<Vec<RawMessage>, RouteError> {
        let mut msgs = Vec::new();

        if !self.pending_done {
            msgs = self.read_group(ReadCursor::After(self.pending_id.clone())).await?;
            self.pending_done = msgs.len() < self.route.batch_size;
            if self.pending_done {
                debug!("Pending entries recovered");
            }
        }

        // The last entry has the largest id.
        match msgs.last().map(|m| m.id.clone()) {
            Some(last_id) => self.pending_id = last_id,
            None => msgs = self.read_group(ReadCursor::New).await?,
        }

        if msgs.is_empty() {
            return Err(RouteError::NoData);
        }
        Ok(msgs)
    }

    async fn read_group(&self, cursor: ReadCursor) -> std::result::Result<Vec<RawMessage>, RouteError> {
        let read = GroupRead {
            stream: &self.route.stream,
            group: &self.route.group,
            consumer: &self.consumer,
            cursor,
            count: self.route.batch_size,
        };
        match tokio::time::timeout(self.config.read_timeout(), self.log.read_group(read)).await {
            Ok(result) => result.map_err(RouteError::Read),
            Err(_) => Err(RouteError::ReadTimeout),
        }
    }

    async fn ack(&self, ids: &[String]) -> std::result::Result<(), LogError> {
        let acked = tokio::time::timeout(
            self.config.read_timeout(),
            self.log.ack(&self.route.stream, &self.route.group, ids),
        )
        .await
        .unwrap_or(Err(LogError::Timeout))?;

        debug!(requested = ids.len(), acked, "Entries acknowledged");
        Ok(())
    }
}

// ============================================================================
// Trimmer
// ============================================================================

/// Largest declared max length per stream.
pub(crate) fn trim_targets<'a>(routes: impl IntoIterator<Item = &'a Route>) -> BTreeMap<String, u64> {
    let mut targets = BTreeMap::new();
    for route in routes {
        targets
            .entry(route.stream.clone())
            .and_modify(|max_len: &mut u64| *max_len = (*max_len).max(route.max_len))
            .or_insert(route.max_len);
    }
    targets
}

struct Trimmer {
    log: Arc<dyn StreamLog>,
    targets: BTreeMap<String, u64>,
    interval: Duration,
    timeout: Duration,
    err_count: Arc<AtomicU64>,
}

impl Trimmer {
    async fn run(self, cancel: CancelToken) {
        info!(streams = self.targets.len(), "Trimmer started");
        loop {
            for (stream, max_len) in &self.targets {
                let trimmed = tokio::time::timeout(self.timeout, self.log.trim_approx(stream, *max_len))
                    .await
                    .unwrap_or(Err(LogError::Timeout));

                match trimmed {
                    Ok(removed) => {
                        self.err_count.store(0, Ordering::Relaxed);
                        debug!(stream = %stream, removed, "Stream trimmed");
                    }
                    Err(e) => {
                        if cancel.is_done() {
                            info!("Trimmer stopped");
                            return;
                        }
                        let err_count = self.err_count.fetch_add(1, Ordering::Relaxed) + 1;
                        error!(stream = %stream, err_count, error = %e, "Trim failed");
                    }
                }
            }

            tokio::select! {
                _ = cancel.done() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Trimmer stopped");
    }
}
