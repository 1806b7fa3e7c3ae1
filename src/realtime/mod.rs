//! WebSocket endpoints.
//!
//! [`websocket`] adapts a [`WebSocketHandler`] into an ordinary route handler.
//! When the route is hit it validates the RFC 6455 opening handshake, asks the
//! connection task to write `101 Switching Protocols`, takes over the TCP
//! stream, and runs the handler on the resulting [`WebSocket`].
//!
//! Origins are not checked here. Routes that must restrict them should do it
//! in middleware, which runs before the upgrade.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::debug;

use crate::Error;
use crate::context::Context;
use crate::http::{Method, Request, Response, StatusCode};
use crate::reply::{Reply, TypedResponse};
use crate::router::IntoHandler;

/// A server-side websocket over the upgraded connection.
pub type WebSocket = WebSocketStream<TcpStream>;

/// Future returned by a [`WebSocketHandler`].
pub type WebSocketFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'static>>;

/// Why a request could not be upgraded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("websocket upgrade requires GET, got {0}")]
    MethodNotAllowed(Method),

    #[error("Connection header must contain 'upgrade'")]
    MissingConnectionUpgrade,

    #[error("Upgrade header must contain 'websocket'")]
    MissingUpgradeWebsocket,

    #[error("unsupported websocket version {0:?}, expected 13")]
    UnsupportedVersion(String),

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("connection does not support upgrades")]
    UpgradeUnavailable,
}

impl HandshakeError {
    /// The status the failed handshake is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            HandshakeError::UpgradeUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<HandshakeError> for Error {
    fn from(err: HandshakeError) -> Self {
        Error::status(err.status(), err.to_string())
    }
}

/// Application logic for one websocket connection.
///
/// Implemented for any `Fn(Context, WebSocket) -> impl Future<Output = Result<(), Error>>`.
/// The context is the one the upgrade request ran with, so path parameters
/// and the request's log span stay available for the connection's lifetime.
pub trait WebSocketHandler: Send + Sync + 'static {
    fn call(&self, ctx: Context, socket: WebSocket) -> WebSocketFuture;
}

impl<T, F> WebSocketHandler for T
where
    T: Fn(Context, WebSocket) -> F + Send + Sync + 'static,
    F: Future<Output = Result<(), Error>> + Send + 'static,
{
    fn call(&self, ctx: Context, socket: WebSocket) -> WebSocketFuture {
        Box::pin((self)(ctx, socket))
    }
}

/// Checks the opening handshake and returns the client's `Sec-WebSocket-Key`.
///
/// # Errors
///
/// Returns the first [`HandshakeError`] found, in this order: method,
/// `Connection`, `Upgrade`, `Sec-WebSocket-Version`, `Sec-WebSocket-Key`.
pub fn validate_handshake(request: &Request) -> Result<&str, HandshakeError> {
    if request.method() != &Method::Get {
        return Err(HandshakeError::MethodNotAllowed(request.method().clone()));
    }

    let headers = request.headers();
    if !headers.contains_token("connection", "upgrade") {
        return Err(HandshakeError::MissingConnectionUpgrade);
    }
    if !headers.contains_token("upgrade", "websocket") {
        return Err(HandshakeError::MissingUpgradeWebsocket);
    }

    let version = headers.get("sec-websocket-version").unwrap_or("").trim();
    if version != "13" {
        return Err(HandshakeError::UnsupportedVersion(version.to_owned()));
    }

    match headers.get("sec-websocket-key").map(str::trim) {
        Some(key) if !key.is_empty() => Ok(key),
        _ => Err(HandshakeError::MissingKey),
    }
}

/// Turns a websocket handler into a route handler.
///
/// # Examples
///
/// ```
/// use futures_util::{SinkExt, StreamExt};
/// use vroute::{Error, Router, context::Context, realtime::WebSocket};
///
/// let mut router = Router::new();
/// router.websocket("/echo", |_ctx: Context, mut socket: WebSocket| async move {
///     while let Some(message) = socket.next().await {
///         socket.send(message?).await?;
///     }
///     Ok::<_, Error>(())
/// });
/// ```
pub fn websocket(handler: impl WebSocketHandler) -> impl IntoHandler {
    let handler = Arc::new(handler);
    move |ctx: Context| {
        let handler = Arc::clone(&handler);
        async move { accept(ctx, handler).await }
    }
}

async fn accept<H>(ctx: Context, handler: Arc<H>) -> Result<Reply, Error>
where
    H: WebSocketHandler,
{
    let accept_key = derive_accept_key(validate_handshake(ctx.request())?.as_bytes());
    let on_upgrade = ctx
        .take_upgrade()
        .ok_or(HandshakeError::UpgradeUnavailable)?;

    let switching = Response::new(StatusCode::SWITCHING_PROTOCOLS)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Accept", accept_key);
    let upgraded = on_upgrade.upgrade(switching).await.map_err(Error::other)?;

    let (stream, read_buf) = upgraded.into_parts();
    let socket =
        WebSocketStream::from_partially_read(stream, read_buf.to_vec(), Role::Server, None).await;
    debug!(path = ctx.request().path(), "websocket connected");

    handler.call(ctx.clone(), socket).await?;

    debug!(path = ctx.request().path(), "websocket closed");
    Ok(TypedResponse::new(StatusCode::SWITCHING_PROTOCOLS, "").into())
}
