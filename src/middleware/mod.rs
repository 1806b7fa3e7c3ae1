//! Middleware and afterware: the steps wrapped around every route handler.
//!
//! - [`Middleware`] runs before the handler, in order. The first one to return
//!   an error stops the chain: later middleware and the handler are skipped and
//!   that error becomes the request's result.
//! - [`Afterware`] runs after the handler and cannot change the response: the
//!   context's response headers are sealed before it starts. It runs exactly
//!   once per request, whether the chain returned a value, returned
//!   an error, panicked, or was dropped mid-flight.
//!
//! [`compose`] folds a handler and both lists into a single [`Handler`].

use std::sync::Arc;

use tracing::trace;

use crate::Error;
use crate::context::Context;
use crate::http::CONTENT_TYPE;
use crate::reply::Reply;
use crate::router::{Handler, HandlerFuture};

/// A pre-handler step that may reject the request.
///
/// Implemented for any `Fn(&Context) -> Result<(), Error>` closure.
///
/// # Examples
///
/// ```
/// use vroute::{Error, context::Context, http::StatusCode, middleware::Middleware};
///
/// struct RequireToken;
///
/// impl Middleware for RequireToken {
///     fn run(&self, ctx: &Context) -> Result<(), Error> {
///         match ctx.request().headers().get("authorization") {
///             Some(_) => Ok(()),
///             None => Err(Error::status(StatusCode::UNAUTHORIZED, "missing token")),
///         }
///     }
/// }
/// ```
pub trait Middleware: Send + Sync + 'static {
    fn run(&self, ctx: &Context) -> Result<(), Error>;
}

impl<F> Middleware for F
where
    F: Fn(&Context) -> Result<(), Error> + Send + Sync + 'static,
{
    fn run(&self, ctx: &Context) -> Result<(), Error> {
        self(ctx)
    }
}

/// A post-handler step that always runs.
///
/// Implemented for any `Fn(&Context)` closure. Afterware must not panic: it
/// also runs while a panicking handler unwinds.
pub trait Afterware: Send + Sync + 'static {
    fn run(&self, ctx: &Context);
}

impl<F> Afterware for F
where
    F: Fn(&Context) + Send + Sync + 'static,
{
    fn run(&self, ctx: &Context) {
        self(ctx)
    }
}

/// Type-erased, shareable middleware.
pub type SharedMiddleware = Arc<dyn Middleware>;

/// Type-erased, shareable afterware.
pub type SharedAfterware = Arc<dyn Afterware>;

// Runs the afterware when dropped, which covers return, `?`, unwinding, and
// cancellation of the request future alike.
struct AfterwareGuard {
    afterware: Arc<[SharedAfterware]>,
    ctx: Context,
}

impl Drop for AfterwareGuard {
    fn drop(&mut self) {
        for afterware in self.afterware.iter() {
            afterware.run(&self.ctx);
        }
    }
}

/// Wraps `handler` so that `middleware` runs before it and `afterware` after it.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use vroute::{Error, reply::Reply, context::Context};
/// use vroute::middleware::{compose, SharedAfterware, SharedMiddleware};
/// use vroute::router::into_handler;
///
/// let handler = into_handler(|_ctx: Context| async { Ok::<_, Error>(Reply::Empty) });
/// let before: SharedMiddleware = Arc::new(|_: &Context| Ok::<_, Error>(()));
/// let after: SharedAfterware = Arc::new(|_: &Context| {});
///
/// let composed = compose(handler, vec![before], vec![after]);
/// ```
pub fn compose(
    handler: Handler,
    middleware: Vec<SharedMiddleware>,
    afterware: Vec<SharedAfterware>,
) -> Handler {
    if middleware.is_empty() && afterware.is_empty() {
        return handler;
    }

    let middleware: Arc<[SharedMiddleware]> = middleware.into();
    let afterware: Arc<[SharedAfterware]> = afterware.into();

    Arc::new(move |ctx: Context| -> HandlerFuture {
        let guard = AfterwareGuard {
            afterware: Arc::clone(&afterware),
            ctx: ctx.clone(),
        };
        let middleware = Arc::clone(&middleware);
        let handler = Arc::clone(&handler);

        Box::pin(async move {
            let _guard = guard;

            let result = run_chain(&middleware, &handler, &ctx).await;
            ctx.seal_response_headers();
            result
        })
    })
}

async fn run_chain(
    middleware: &[SharedMiddleware],
    handler: &Handler,
    ctx: &Context,
) -> Result<Reply, Error> {
    for (index, step) in middleware.iter().enumerate() {
        if let Err(err) = step.run(ctx) {
            trace!(index, "middleware stopped the chain");
            return Err(err);
        }
    }
    handler(ctx.clone()).await
}

/// Middleware that sets the response `Content-Type`, which then takes
/// precedence over the type detected from the handler's reply.
pub fn content_type(content_type: impl Into<String>) -> impl Middleware {
    let content_type = content_type.into();
    move |ctx: &Context| -> Result<(), Error> {
        ctx.set_header(CONTENT_TYPE, content_type.as_str());
        Ok(())
    }
}
