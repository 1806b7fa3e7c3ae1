//! Route groups: a tree of path prefixes sharing middleware and afterware.
//!
//! A [`RouteGroup`] owns its routes and child groups. Middleware and afterware
//! attached to a group apply to every route in it and in all of its
//! descendants. [`RouteGroup::expand`] flattens the tree into
//! [`CompiledRoute`]s, each carrying its full path and fully composed handler.
//!
//! Expansion order is stable: a group's own routes in registration order,
//! then each child group, depth-first, in registration order. For each route
//! the middleware chain runs ancestors first, then the route's own group, then
//! the middleware passed with the route itself. Afterware runs innermost
//! group first and ancestors last.

use std::sync::Arc;

use crate::http::Method;
use crate::middleware::{Afterware, Middleware, SharedAfterware, SharedMiddleware, compose};
use crate::realtime::{WebSocketHandler, websocket};

use super::{Handler, IntoHandler, into_handler};

struct Route {
    method: Method,
    path: String,
    handler: Handler,
    middleware: Vec<SharedMiddleware>,
}

/// A route after expansion: method, full path, and composed handler.
pub struct CompiledRoute {
    pub method: Method,
    pub path: String,
    pub handler: Handler,
}

impl std::fmt::Debug for CompiledRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRoute")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// A node in the route tree.
///
/// # Examples
///
/// ```
/// use vroute::{Error, context::Context, reply::Reply, router::RouteGroup};
///
/// let mut api = RouteGroup::new("/api");
/// api.before(|ctx: &Context| -> Result<(), Error> {
///     ctx.set_header("X-Api", "1");
///     Ok(())
/// });
///
/// let v1 = api.group("/v1");
/// v1.get("/users/:id", |ctx: Context| async move {
///     let id = ctx.param("id").unwrap_or_default().to_owned();
///     Ok::<_, Error>(Reply::json(id))
/// });
///
/// let routes = api.expand();
/// assert_eq!(routes[0].path, "/api/v1/users/:id");
/// ```
pub struct RouteGroup {
    prefix: String,
    routes: Vec<Route>,
    middleware: Vec<SharedMiddleware>,
    afterware: Vec<SharedAfterware>,
    children: Vec<RouteGroup>,
}

impl RouteGroup {
    /// Creates a group whose routes live under `prefix`. An empty prefix is
    /// valid and mounts routes at the root.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            routes: Vec::new(),
            middleware: Vec::new(),
            afterware: Vec::new(),
            children: Vec::new(),
        }
    }

    /// The prefix this group was created with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Registers a route relative to this group's prefix.
    pub fn handle(&mut self, method: Method, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle_with(method, path, handler, Vec::new())
    }

    /// Registers a route with middleware that applies to this route only. It
    /// runs after every group-level middleware.
    pub fn handle_with(
        &mut self,
        method: Method,
        path: &str,
        handler: impl IntoHandler,
        middleware: Vec<SharedMiddleware>,
    ) -> &mut Self {
        self.routes.push(Route {
            method,
            path: path.to_owned(),
            handler: into_handler(handler),
            middleware,
        });
        self
    }

    pub fn get(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Get, path, handler)
    }

    pub fn head(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Head, path, handler)
    }

    pub fn options(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Options, path, handler)
    }

    pub fn post(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Post, path, handler)
    }

    pub fn put(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Put, path, handler)
    }

    pub fn patch(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Patch, path, handler)
    }

    pub fn delete(&mut self, path: &str, handler: impl IntoHandler) -> &mut Self {
        self.handle(Method::Delete, path, handler)
    }

    /// Registers a `GET` route that upgrades to a websocket and hands the
    /// connection to `handler`.
    pub fn websocket(&mut self, path: &str, handler: impl WebSocketHandler) -> &mut Self {
        self.handle(Method::Get, path, websocket(handler))
    }

    /// Creates a child group under `prefix` and returns it for registration.
    pub fn group(&mut self, prefix: &str) -> &mut RouteGroup {
        self.children.push(RouteGroup::new(prefix));
        let last = self.children.len() - 1;
        &mut self.children[last]
    }

    /// Adopts an already-built group as a child.
    pub fn add_group(&mut self, group: RouteGroup) -> &mut Self {
        self.children.push(group);
        self
    }

    /// Adds middleware for every route in this group and its descendants.
    pub fn before(&mut self, middleware: impl Middleware) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// Adds afterware for every route in this group and its descendants.
    pub fn after(&mut self, afterware: impl Afterware) -> &mut Self {
        self.afterware.push(Arc::new(afterware));
        self
    }

    /// Number of routes in this group and all descendants.
    pub fn route_count(&self) -> usize {
        self.routes.len() + self.children.iter().map(RouteGroup::route_count).sum::<usize>()
    }

    /// Flattens the tree into compiled routes.
    pub fn expand(&self) -> Vec<CompiledRoute> {
        let mut out = Vec::with_capacity(self.route_count());
        self.expand_into("", &[], &[], &mut out);
        out
    }

    fn expand_into(
        &self,
        parent_prefix: &str,
        parent_middleware: &[SharedMiddleware],
        parent_afterware: &[SharedAfterware],
        out: &mut Vec<CompiledRoute>,
    ) {
        let prefix = join_paths(parent_prefix, &self.prefix);

        let middleware: Vec<SharedMiddleware> = parent_middleware
            .iter()
            .chain(&self.middleware)
            .cloned()
            .collect();
        // Innermost first, so the chain unwinds like nested scopes.
        let afterware: Vec<SharedAfterware> = self
            .afterware
            .iter()
            .chain(parent_afterware)
            .cloned()
            .collect();

        for route in &self.routes {
            let route_middleware = middleware
                .iter()
                .chain(&route.middleware)
                .cloned()
                .collect();
            out.push(CompiledRoute {
                method: route.method.clone(),
                path: join_paths(&prefix, &route.path),
                handler: compose(Arc::clone(&route.handler), route_middleware, afterware.clone()),
            });
        }

        for child in &self.children {
            child.expand_into(&prefix, &middleware, &afterware, out);
        }
    }
}

impl Default for RouteGroup {
    fn default() -> Self {
        Self::new("")
    }
}

/// Joins two path fragments with exactly one `/` between them.
///
/// The result always starts with `/`; joining only empty fragments yields `/`.
pub fn join_paths(base: &str, path: &str) -> String {
    let base = base.trim_matches('/');
    let path = path.trim_start_matches('/');

    let mut joined = String::with_capacity(base.len() + path.len() + 2);
    joined.push('/');
    joined.push_str(base);
    if !base.is_empty() && !path.is_empty() {
        joined.push('/');
    }
    joined.push_str(path);
    joined
}
