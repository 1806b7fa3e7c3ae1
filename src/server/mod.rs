//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler
//! function, usually a finalized [`Router`]. Persistent connections
//! (keep-alive) are supported, and a handler may take a connection over
//! through the request's upgrade handle (see [`crate::http::upgrade`]).

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::Options;
use crate::http::upgrade::{self, UpgradeRequest};
use crate::http::{
    CONTENT_TYPE, Method, StatusCode,
    request::{Request, RequestError},
    response::Response,
};
use crate::reply::TEXT_PLAIN;
use crate::router::Router;

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no HTTP port configured")]
    NoAddress,
}

/// Maximum size of a complete HTTP request we will buffer before rejecting it (8 MiB).
const MAX_REQUEST_SIZE: usize = 8 * 1024 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// The HTTP server.
///
/// # Examples
///
/// ```rust,no_run
/// use vroute::{Error, Router, Server, context::Context};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut router = Router::new();
///     router.get("/hello", |_ctx: Context| async { Ok::<_, Error>("Hello!".as_bytes()) });
///
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.serve(router).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Binds to the address configured in `options`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NoAddress`] when no port is configured, or
    /// [`ServerError::Bind`] if binding fails.
    pub async fn from_options(options: &Options) -> Result<Self, ServerError> {
        let addr = options.http_addr().ok_or(ServerError::NoAddress)?;
        Self::bind(addr).await
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Finalizes `router` and serves it until the listener fails.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn serve(self, router: Router) -> Result<(), ServerError> {
        router.finalize();
        let router = Arc::new(router);
        self.run(move |request| {
            let router = Arc::clone(&router);
            async move { router.serve(request).await }
        })
        .await
    }

    /// Starts accepting connections and dispatching requests to `handler`.
    ///
    /// The handler is shared across all spawned Tokio tasks, so it must be
    /// `Send + Sync + 'static`. This method runs until the process is
    /// terminated or an unrecoverable listener error occurs.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, "listening");

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

fn reject(status: StatusCode, message: impl Into<String>) -> Response {
    Response::new(status)
        .header(CONTENT_TYPE, TEXT_PLAIN)
        .body(message)
        .keep_alive(false)
}

/// Handles a single TCP connection over its lifetime.
///
/// Requests are read and answered one at a time until the peer closes the
/// connection, either side asks for `Connection: close`, or a handler
/// upgrades the connection. After an upgrade the stream belongs to the
/// handler and this task only waits for it to finish.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
) -> Result<(), std::io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Pipelined requests may already be buffered; only read when the
        // buffer cannot hold a complete request.
        let parsed = if buf.is_empty() {
            Err(RequestError::Incomplete)
        } else {
            Request::parse(&buf)
        };

        let (mut request, body_offset) = match parsed {
            Ok(pair) => pair,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_REQUEST_SIZE {
                    warn!(peer = %peer_addr, "request too large, sending 413");
                    let response =
                        reject(StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large");
                    stream.write_all(&response.into_bytes()).await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                let status = e.status();
                warn!(peer = %peer_addr, error = %e, status = status.as_u16(), "rejecting request");
                let response = reject(status, format!("{}: {e}", status.canonical_reason()));
                stream.write_all(&response.into_bytes()).await?;
                break;
            }
        };

        // Wait for the full body to arrive if Content-Length is set. Chunked
        // bodies only parse once complete, so they are already buffered here.
        let total_needed = body_offset + request.framed_len();
        if total_needed > MAX_REQUEST_SIZE {
            warn!(peer = %peer_addr, "request body too large, sending 413");
            let response = reject(StatusCode::PAYLOAD_TOO_LARGE, "Request entity too large");
            stream.write_all(&response.into_bytes()).await?;
            break;
        }
        if buf.len() < total_needed {
            if stream.read_buf(&mut buf).await? == 0 {
                debug!(peer = %peer_addr, "connection closed mid-request");
                break;
            }
            continue;
        }
        // Drop the consumed request bytes; anything left is the next request
        // or, after an upgrade, the first bytes of the new protocol.
        let _ = buf.split_to(total_needed);

        let keep_alive = request.is_keep_alive();
        let head = request.method() == &Method::Head;
        let (on_upgrade, mut pending) = upgrade::pair();
        request.set_on_upgrade(on_upgrade);

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            "dispatching request"
        );

        let mut response_fut = Box::pin(handler(request));
        let response = tokio::select! {
            response = &mut response_fut => response,
            Ok(UpgradeRequest { response, reply }) = &mut pending => {
                stream.write_all(&response.into_bytes()).await?;
                stream.flush().await?;
                debug!(peer = %peer_addr, "connection upgraded");

                let read_buf = buf.split().freeze();
                if reply.send(upgrade::upgraded(stream, read_buf)).is_err() {
                    debug!(peer = %peer_addr, "upgrade abandoned by handler");
                    return Ok(());
                }
                let _ = response_fut.await;
                return Ok(());
            }
        };

        let close = !keep_alive || !response.is_keep_alive();
        let mut response = if keep_alive {
            response
        } else {
            response.keep_alive(false)
        };
        if head {
            response = response.omit_body();
        }
        stream.write_all(&response.into_bytes()).await?;
        stream.flush().await?;

        if close {
            debug!(peer = %peer_addr, "Connection: close, shutting down");
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::context::Context;
    use crate::reply::Reply;

    async fn start(router: Router) -> SocketAddr {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(router));
        addr
    }

    async fn exchange(addr: SocketAddr, raw: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw.as_bytes()).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    fn hello_router() -> Router {
        let mut router = Router::new();
        router.get("/hello", |_ctx: Context| async {
            Ok::<_, Error>(Reply::from(&b"hi"[..]))
        });
        router.post("/echo", |ctx: Context| async move {
            Ok::<_, Error>(Reply::from(ctx.request().body().clone()))
        });
        router.head("/h", |_ctx: Context| async {
            Ok::<_, Error>(Reply::json(vec![1, 2, 3]))
        });
        router
    }

    #[tokio::test]
    async fn bind_reports_local_addr() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn from_options_requires_a_port() {
        let err = Server::from_options(&Options::default()).await.err().unwrap();
        assert!(matches!(err, ServerError::NoAddress));
    }

    #[tokio::test]
    async fn serves_router_responses() {
        let addr = start(hello_router()).await;
        let out = exchange(addr, "GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(out.contains("Content-Length: 2\r\n"));
        assert!(out.contains("Connection: close\r\n"));
        assert!(out.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn keep_alive_serves_pipelined_requests() {
        let addr = start(hello_router()).await;
        let out = exchange(
            addr,
            "POST /echo HTTP/1.1\r\nContent-Length: 3\r\n\r\none\
             GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2, "{out}");
        assert!(out.contains("\r\n\r\none"));
        assert!(out.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn malformed_request_is_400() {
        let addr = start(hello_router()).await;
        let out = exchange(addr, "GET /hello HTTP/1.1\r\nContent-Length: nope\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{out}");
    }

    #[tokio::test]
    async fn unknown_route_is_404_over_the_wire() {
        let addr = start(hello_router()).await;
        let out = exchange(addr, "GET /nowhere HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(out.starts_with("HTTP/1.1 404 Not Found\r\n"), "{out}");
        assert!(out.ends_with("404 page not found"));
    }

    #[tokio::test]
    async fn head_response_has_no_body_on_keep_alive() {
        let addr = start(hello_router()).await;
        let out = exchange(
            addr,
            "HEAD /h HTTP/1.1\r\n\r\nGET /hello HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (first, second) = out.split_once("\r\n\r\n").unwrap();
        assert!(first.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(first.contains("Content-Length: 7\r\n"));
        assert!(second.starts_with("HTTP/1.1 200 OK\r\n"), "{out}");
        assert!(second.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn header_value_with_crlf_cannot_split_the_response() {
        let mut router = Router::new();
        router.get("/echo-header", |ctx: Context| async move {
            let value = ctx.request().headers().get("x-value").unwrap_or("").replace('|', "\r\n");
            ctx.set_header("X-Echo", value);
            Ok::<_, Error>(())
        });
        let addr = start(router).await;

        let out = exchange(
            addr,
            "GET /echo-header HTTP/1.1\r\nX-Value: a|Set-Cookie: pwned=1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(out.contains("X-Echo: a  Set-Cookie: pwned=1\r\n"), "{out}");
        assert!(!out.contains("\r\nSet-Cookie"));
    }

    #[tokio::test]
    async fn chunked_request_body_is_decoded() {
        let addr = start(hello_router()).await;
        let out = exchange(
            addr,
            "POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
             5\r\nhello\r\n0\r\n\r\n\
             GET /hello HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert_eq!(out.matches("HTTP/1.1 200 OK").count(), 2, "{out}");
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.contains("\r\n\r\nhello"));
        assert!(!out.contains("400 Bad Request"));
        assert!(out.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn unsupported_transfer_encoding_is_501_and_closes() {
        let addr = start(hello_router()).await;
        let out = exchange(
            addr,
            "POST /echo HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n",
        )
        .await;
        assert!(out.starts_with("HTTP/1.1 501 Not Implemented\r\n"), "{out}");
        assert!(out.contains("Connection: close\r\n"));
    }
}
