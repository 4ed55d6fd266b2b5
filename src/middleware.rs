//! Handler middleware.
//!
//! A middleware takes a handler and returns a handler wrapping it, which
//! keeps cross-cutting behavior (panic recovery, tracing) out of the
//! handlers themselves:
//!
//! ```ignore
//! let handler = chain(vec![recover(), trace()])(handler_fn(|ctx: Context| async move {
//!     process(ctx.msgs()).await
//! }));
//! ```
//!
//! Middlewares are applied in declaration order: the first one is the
//! outermost and sees the call first and the result last.

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

/// Asynchronous handler of one invocation context.
pub type Handler<C, E> = Arc<dyn Fn(C) -> BoxFuture<'static, Result<(), E>> + Send + Sync>;

/// Wraps a handler into another handler.
pub type Middleware<C, E> = Arc<dyn Fn(Handler<C, E>) -> Handler<C, E> + Send + Sync>;

/// Build a handler from an async closure.
pub fn handler_fn<C, E, F, Fut>(f: F) -> Handler<C, E>
where
    C: 'static,
    E: 'static,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
{
    Arc::new(move |ctx: C| f(ctx).boxed())
}

/// Compose middlewares into one, the first being the outermost.
pub fn chain<C, E>(middlewares: Vec<Middleware<C, E>>) -> Middleware<C, E>
where
    C: 'static,
    E: 'static,
{
    Arc::new(move |handler: Handler<C, E>| -> Handler<C, E> {
        middlewares
            .iter()
            .rev()
            .fold(handler, |next, middleware| middleware(next))
    })
}
