//! Request dispatch: route registration, finalization and per-request
//! resolution into wire responses.
//!
//! Routes are registered on a [`RouteGroup`] tree held by the [`Router`]. The
//! first call to [`Router::finalize`] (or the first request) expands the tree
//! into a flat dispatch table; from then on the table is read-only and further
//! registrations are ignored with a warning.
//!
//! For every request that hits a pipeline route the router:
//!
//! 1. creates a [`Context`] and enters its `request` span,
//! 2. logs `"{METHOD} {uri}"`, the path plus any query string,
//! 3. runs the composed middleware → handler → afterware chain,
//! 4. resolves the result with [`reply::resolve`],
//! 5. logs `"{METHOD} {uri} completed ({status}: {reason}) in {ms}ms"`.
//!
//! Both lines are logged at `info`, or at `debug` for quiet routes. Requests
//! that match nothing go to the fallback proxy when one is configured, and
//! otherwise get a `405` (path known, method not) or a `404`.

pub mod group;
mod matcher;

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use tokio::time::Instant;
use tracing::{Instrument, debug, warn};

use crate::Error;
use crate::config::Options;
use crate::context::{Context, Parameters};
use crate::http::{CONTENT_TYPE, Method, Request, Response, StatusCode};
use crate::middleware::{Afterware, Middleware, SharedMiddleware};
use crate::proxy::FallbackProxy;
use crate::realtime::WebSocketHandler;
use crate::reply::{self, Reply, TEXT_PLAIN};

pub use group::{CompiledRoute, RouteGroup, join_paths};
use matcher::{DispatchTable, Lookup};

/// Future returned by a [`Handler`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Reply, Error>> + Send + 'static>>;

/// Type-erased, shareable async handler.
///
/// In practice you never build one by hand: registration methods accept
/// `impl IntoHandler` and erase the closure with [`into_handler`].
pub type Handler = Arc<dyn Fn(Context) -> HandlerFuture + Send + Sync + 'static>;

/// Future returned by a [`RawHandler`].
pub type RawFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// A handler that works on the bare request, outside the pipeline.
pub type RawHandler = Arc<dyn Fn(Request) -> RawFuture + Send + Sync + 'static>;

/// Conversion trait for async handler functions.
///
/// Any `Fn(Context) -> impl Future<Output = Result<R, Error>>` where
/// `R: Into<Reply>` implements it through the blanket impl below, so handlers
/// may return a [`Reply`], a [`TypedResponse`](crate::reply::TypedResponse),
/// raw bytes, or `()`.
pub trait IntoHandler: Send + Sync + 'static {
    /// Call the handler with the given context, boxing the returned future.
    fn call(&self, ctx: Context) -> HandlerFuture;
}

impl<T, F, R> IntoHandler for T
where
    T: Fn(Context) -> F + Send + Sync + 'static,
    F: Future<Output = Result<R, Error>> + Send + 'static,
    R: Into<Reply> + Send + 'static,
{
    fn call(&self, ctx: Context) -> HandlerFuture {
        let fut = (self)(ctx);
        Box::pin(async move { fut.await.map(Into::into) })
    }
}

/// Erases a concrete handler into a shareable [`Handler`].
pub fn into_handler(handler: impl IntoHandler) -> Handler {
    Arc::new(move |ctx: Context| handler.call(ctx))
}

// Logs at `debug` for quiet routes and at `info` otherwise.
macro_rules! log_at {
    ($quiet:expr, $($arg:tt)+) => {
        if $quiet {
            tracing::debug!($($arg)+)
        } else {
            tracing::info!($($arg)+)
        }
    };
}

enum Endpoint {
    Pipeline(Handler),
    Raw(RawHandler),
}

/// HTTP request router.
///
/// # Examples
///
/// ```
/// use vroute::{Error, Router, context::Context, reply::Reply};
/// use vroute::http::Method;
///
/// let mut router = Router::new();
/// router.get("/ping", |_ctx: Context| async { Ok::<_, Error>(Reply::Empty) });
///
/// let api = router.group("/api");
/// api.get("/users/:id", |ctx: Context| async move {
///     Ok::<_, Error>(Reply::json(ctx.param("id").map(str::to_owned)))
/// });
///
/// assert!(!router.can_handle(&Method::Get, "/ping"));
/// router.finalize();
/// assert!(router.can_handle(&Method::Get, "/api/users/7"));
/// ```
pub struct Router {
    root: RouteGroup,
    raw_routes: Vec<(Method, String, RawHandler)>,
    table: OnceLock<DispatchTable<Endpoint>>,
    fallback: Option<FallbackProxy>,
    quiet_routes: HashSet<String>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates an empty router with no fallback and no quiet routes.
    pub fn new() -> Self {
        Self {
            root: RouteGroup::new(""),
            raw_routes: Vec::new(),
            table: OnceLock::new(),
            fallback: None,
            quiet_routes: HashSet::new(),
        }
    }

    /// Builds a router with the fallback target and quiet routes from `options`.
    pub fn from_options(options: &Options) -> Self {
        let mut router = Self::new();
        if let Some(target) = options.fallback_address.as_deref().filter(|t| !t.is_empty()) {
            router.fallback(target);
        }
        router.use_quiet_routes(options.quiet_routes.iter().cloned());
        router
    }

    /// Forwards unmatched requests to `target` (an `http://host[:port][/base]` URL).
    ///
    /// An invalid target disables the fallback and is logged at warn level.
    pub fn fallback(&mut self, target: &str) -> &mut Self {
        match FallbackProxy::new(target) {
            Ok(proxy) => {
                debug!(target, "fallback proxy enabled");
                self.fallback = Some(proxy);
            }
            Err(err) => {
                warn!(target, error = %err, "fallback proxy disabled");
                self.fallback = None;
            }
        }
        self
    }

    /// Marks paths whose request logs are emitted at debug level.
    pub fn use_quiet_routes<I, S>(&mut self, paths: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.quiet_routes.extend(paths.into_iter().map(Into::into));
        self
    }

    /// The root group, for registering routes at `/`.
    pub fn root(&mut self) -> &mut RouteGroup {
        self.warn_if_finalized();
        &mut self.root
    }

    /// Registers `handler` for `method` and `path` on the root group.
    pub fn handle(&mut self, method: Method, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.root().handle(method, path, handler);
        self
    }

    /// Like [`handle`](Self::handle), with middleware that runs for this route only.
    pub fn handle_with(
        &mut self,
        method: Method,
        path: &str,
        handler: impl IntoHandler,
        middleware: Vec<SharedMiddleware>,
    ) -> &mut Self {
        self.root().handle_with(method, path, handler, middleware);
        self
    }

    /// Registers a `GET` route.
    pub fn get(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Get, path, handler)
    }

    /// Registers a `POST` route.
    pub fn post(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Post, path, handler)
    }

    /// Registers a `PUT` route.
    pub fn put(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Put, path, handler)
    }

    /// Registers a `PATCH` route.
    pub fn patch(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Patch, path, handler)
    }

    /// Registers a `DELETE` route.
    pub fn delete(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Delete, path, handler)
    }

    /// Registers a `HEAD` route. The body it produces is never written.
    pub fn head(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Head, path, handler)
    }

    /// Registers an `OPTIONS` route, e.g. a CORS preflight handler.
    pub fn options(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Options, path, handler)
    }

    /// Registers a websocket endpoint at `path`.
    pub fn websocket(&mut self, path: &str, handler: impl WebSocketHandler) -> &mut Self {
        self.root().websocket(path, handler);
        self
    }

    /// Creates a child group of the root under `prefix`.
    pub fn group(&mut self, prefix: &str) -> &mut RouteGroup {
        self.root().group(prefix)
    }

    /// Attaches a group built separately as a child of the root.
    pub fn add_group(&mut self, group: RouteGroup) -> &mut Self {
        self.root().add_group(group);
        self
    }

    /// Adds middleware that runs for every pipeline route.
    pub fn before(&mut self, middleware: impl Middleware) -> &mut Self {
        self.root().before(middleware);
        self
    }

    /// Adds afterware that runs for every pipeline route.
    pub fn after(&mut self, afterware: impl Afterware) -> &mut Self {
        self.root().after(afterware);
        self
    }

    /// Mounts a raw handler. It receives the request as parsed and its
    /// response is written as-is: no context, no middleware, no resolution,
    /// no request logging.
    pub fn handle_raw<H, F>(&mut self, method: Method, path: &str, handler: H) -> &mut Self
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.warn_if_finalized();
        let handler: RawHandler = Arc::new(move |request| Box::pin(handler(request)));
        self.raw_routes.push((method, path.to_owned(), handler));
        self
    }

    /// Builds the dispatch table. Only the first call has any effect.
    pub fn finalize(&self) {
        self.table();
    }

    /// Whether the router has a route for `method` and `path`. Always `false`
    /// before [`finalize`](Self::finalize).
    pub fn can_handle(&self, method: &Method, path: &str) -> bool {
        self.table
            .get()
            .is_some_and(|table| table.contains(method, path))
    }

    /// Dispatches one request.
    pub async fn serve(&self, request: Request) -> Response {
        let lookup = self.table().lookup(request.method(), request.path());
        match lookup {
            Lookup::Found(Endpoint::Pipeline(handler), params) => {
                self.dispatch(handler, request, params).await
            }
            Lookup::Found(Endpoint::Raw(handler), _) => handler(request).await,
            Lookup::MethodNotAllowed(allowed) => self.unhandled(request, Some(allowed)).await,
            Lookup::NotFound => self.unhandled(request, None).await,
        }
    }

    fn table(&self) -> &DispatchTable<Endpoint> {
        self.table.get_or_init(|| self.mount())
    }

    fn mount(&self) -> DispatchTable<Endpoint> {
        let mut table = DispatchTable::new();

        let pipeline = self
            .root
            .expand()
            .into_iter()
            .map(|route| (route.method, route.path, Endpoint::Pipeline(route.handler)));
        let raw = self
            .raw_routes
            .iter()
            .map(|(method, path, handler)| {
                (method.clone(), path.clone(), Endpoint::Raw(Arc::clone(handler)))
            });

        for (method, path, endpoint) in pipeline.chain(raw) {
            debug!(%method, %path, "mounting route");
            if !table.insert(method.clone(), &path, endpoint) {
                warn!(%method, %path, "duplicate route ignored");
            }
        }

        debug!(routes = table.len(), "router finalized");
        table
    }

    fn warn_if_finalized(&self) {
        if self.table.get().is_some() {
            warn!("router already finalized; registration ignored");
        }
    }

    async fn dispatch(&self, handler: &Handler, request: Request, params: Parameters) -> Response {
        let method = request.method().clone();
        let uri = request.uri();
        let quiet = self.quiet_routes.contains(request.path());

        let ctx = Context::new(request, params);
        let span = ctx.span().clone();

        async move {
            let started = Instant::now();
            log_at!(quiet, "{method} {uri}");

            let resolved = reply::resolve(handler(ctx.clone()).await);

            let mut headers = ctx.response_headers();
            if let Some(content_type) = resolved.content_type {
                if headers.contains(CONTENT_TYPE) {
                    debug!(detected = %content_type, "keeping content type set by middleware");
                } else {
                    headers.set(CONTENT_TYPE, content_type);
                }
            }

            let status = resolved.status;
            log_at!(
                quiet,
                "{method} {uri} completed ({}: {}) in {}ms",
                status.as_u16(),
                status.canonical_reason(),
                started.elapsed().as_millis()
            );

            Response::new(status)
                .with_headers(headers)
                .body_bytes(resolved.body)
        }
        .instrument(span)
        .await
    }

    async fn unhandled(&self, request: Request, allowed: Option<Vec<Method>>) -> Response {
        if let Some(proxy) = &self.fallback {
            debug!(method = %request.method(), path = request.path(), "forwarding to fallback");
            return proxy.forward(request).await;
        }

        debug!(method = %request.method(), path = request.path(), "no route");
        match allowed {
            Some(methods) => {
                let allow = methods
                    .iter()
                    .map(Method::as_str)
                    .collect::<Vec<_>>()
                    .join(", ");
                Response::new(StatusCode::METHOD_NOT_ALLOWED)
                    .header("Allow", allow)
                    .header(CONTENT_TYPE, TEXT_PLAIN)
                    .body("Method Not Allowed")
            }
            None => Response::new(StatusCode::NOT_FOUND)
                .header(CONTENT_TYPE, TEXT_PLAIN)
                .body("404 page not found"),
        }
    }
}
