//! Per-request context: request data, response headers, the correlation
//! scope and the log span.
//!
//! A [`Context`] is created by the router for every dispatched request and
//! dropped when the request completes. It is a cheap-to-clone handle: the
//! middleware chain, the handler, and the afterware all see the same state.
//! Clones must stay within the request that created them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{Span, debug, warn};
use uuid::Uuid;

use crate::http::{Headers, OnUpgrade, Request};

/// Path parameters extracted from the matched route.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Parameters {
    map: HashMap<String, String>,
}

impl Parameters {
    /// Create a new empty parameters map
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value into the parameters map
    pub fn insert(&mut self, key: String, value: String) {
        self.map.insert(key, value);
    }

    /// Get a value from the parameters map
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Why a scope could not be installed.
#[derive(Debug, Error)]
pub enum ScopeError {
    #[error("request scope was already replaced")]
    AlreadySet,

    #[error("scope is not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct ScopeState {
    value: Value,
    replaced: bool,
}

struct Inner {
    request: Request,
    params: Parameters,
    request_id: String,
    span: Span,
    response_headers: Mutex<Headers>,
    headers_sealed: AtomicBool,
    scope: Mutex<ScopeState>,
    upgrade: Mutex<Option<OnUpgrade>>,
}

/// Per-request state shared by middleware, handler, and afterware.
///
/// # Examples
///
/// ```
/// use vroute::context::{Context, Parameters};
/// use vroute::http::Request;
///
/// let (request, _) = Request::parse(b"GET /users/7 HTTP/1.1\r\n\r\n").unwrap();
/// let mut params = Parameters::new();
/// params.insert("id".into(), "7".into());
///
/// let ctx = Context::new(request, params);
/// ctx.set_header("X-Powered-By", "vroute");
///
/// assert_eq!(ctx.param("id"), Some("7"));
/// assert_eq!(ctx.scope()["request_id"], ctx.request_id());
/// assert_eq!(ctx.response_header("x-powered-by").as_deref(), Some("vroute"));
/// ```
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Creates the context for one request.
    ///
    /// Generates a request id, opens the request's log span, seeds the scope
    /// with `{"request_id": <id>}`, and takes ownership of the request's
    /// upgrade handle.
    pub fn new(mut request: Request, params: Parameters) -> Self {
        let request_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "request",
            request_id = %request_id,
            scope = tracing::field::Empty,
        );
        let upgrade = request.take_upgrade();

        Self {
            inner: Arc::new(Inner {
                request,
                params,
                span,
                response_headers: Mutex::new(Headers::new()),
                headers_sealed: AtomicBool::new(false),
                scope: Mutex::new(ScopeState {
                    value: json!({ "request_id": request_id }),
                    replaced: false,
                }),
                upgrade: Mutex::new(upgrade),
                request_id,
            }),
        }
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn params(&self) -> &Parameters {
        &self.inner.params
    }

    /// Shorthand for `ctx.params().get(name)`.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.inner.params.get(name)
    }

    /// The generated identifier of this request.
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// The request's log span. Everything logged while the request is being
    /// handled is recorded inside it.
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Deserializes the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.inner.request.body())
    }

    /// Sets a response header, replacing any earlier value.
    ///
    /// Ignored once the handler chain has produced its result.
    pub fn set_header(&self, name: impl Into<String>, value: impl Into<String>) {
        if self.headers_writable() {
            lock(&self.inner.response_headers).set(name, value);
        }
    }

    /// Appends a response header value.
    pub fn add_header(&self, name: impl Into<String>, value: impl Into<String>) {
        if self.headers_writable() {
            lock(&self.inner.response_headers).insert(name, value);
        }
    }

    // Afterware runs after this point and must not change the response.
    pub(crate) fn seal_response_headers(&self) {
        self.inner.headers_sealed.store(true, Ordering::Release);
    }

    fn headers_writable(&self) -> bool {
        let sealed = self.inner.headers_sealed.load(Ordering::Acquire);
        if sealed {
            debug!(request_id = %self.inner.request_id, "response already resolved; header ignored");
        }
        !sealed
    }

    /// Returns the first response header value for `name`.
    pub fn response_header(&self, name: &str) -> Option<String> {
        lock(&self.inner.response_headers)
            .get(name)
            .map(str::to_owned)
    }

    /// Snapshot of the response headers set so far.
    pub fn response_headers(&self) -> Headers {
        lock(&self.inner.response_headers).clone()
    }

    /// The current correlation scope.
    pub fn scope(&self) -> Value {
        lock(&self.inner.scope).value.clone()
    }

    /// Replaces the default `{request_id}` scope with custom correlation data.
    ///
    /// The scope can be replaced once per request; the new value is recorded
    /// on the request span.
    ///
    /// # Errors
    ///
    /// - [`ScopeError::AlreadySet`] — a custom scope is already installed.
    /// - [`ScopeError::Serialize`] — `scope` does not serialize to JSON.
    pub fn use_scope<T: Serialize>(&self, scope: T) -> Result<(), ScopeError> {
        let mut state = lock(&self.inner.scope);
        if state.replaced {
            warn!(request_id = %self.inner.request_id, "ignoring second scope replacement");
            return Err(ScopeError::AlreadySet);
        }

        let value = serde_json::to_value(scope)?;
        self.inner
            .span
            .record("scope", tracing::field::display(&value));
        state.value = value;
        state.replaced = true;
        Ok(())
    }

    /// Takes the connection-upgrade handle. Returns `None` if the transport
    /// does not support upgrades or the handle was already taken.
    pub fn take_upgrade(&self) -> Option<OnUpgrade> {
        lock(&self.inner.upgrade).take()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("request_id", &self.inner.request_id)
            .field("method", self.inner.request.method())
            .field("path", &self.inner.request.path())
            .finish_non_exhaustive()
    }
}

// A panicking handler must not take the response headers down with it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
