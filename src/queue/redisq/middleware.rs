//! Standard consumer middlewares.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{error, field, info_span, Instrument};

use super::{Context, Handler, HandlerError, Middleware};

/// Turn a panic inside the handler into `HandlerError::Panicked`.
///
/// Covers panics raised while building the handler future as well as
/// while polling it. The batch is left unacknowledged.
pub fn recover() -> Middleware {
    Arc::new(|next: Handler| -> Handler {
        Arc::new(move |ctx: Context| {
            let next = next.clone();
            async move {
                let span_name = ctx.route().span_name();
                let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| next(ctx))) {
                    Ok(fut) => fut,
                    Err(payload) => return Err(panicked(&span_name, payload)),
                };
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Err(panicked(&span_name, payload)),
                }
            }
            .boxed()
        })
    })
}

fn panicked(route: &str, payload: Box<dyn Any + Send>) -> HandlerError {
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    error!(route = %route, panic = %message, "Handler panicked");
    HandlerError::Panicked { message }
}

/// Run every invocation inside a `queue.consume` span named after the route.
///
/// Handler errors are recorded on the span with OpenTelemetry status fields.
pub fn trace() -> Middleware {
    Arc::new(|next: Handler| -> Handler {
        Arc::new(move |ctx: Context| {
            let next = next.clone();
            let route = ctx.route();
            let span = info_span!(
                "queue.consume",
                otel.name = %route.span_name(),
                otel.kind = "consumer",
                messaging.system = "redis",
                messaging.destination = %route.stream,
                messaging.consumer_group = %route.group,
                messaging.batch_size = ctx.msgs().len(),
                otel.status_code = field::Empty,
                error = field::Empty,
            );
            let recorder = span.clone();
            async move {
                let result = next(ctx).await;
                if let Err(e) = &result {
                    recorder.record("otel.status_code", "ERROR");
                    recorder.record("error", field::display(e));
                }
                result
            }
            .instrument(span)
            .boxed()
        })
    })
}
