//! Fallback reverse proxy for requests no route claims.
//!
//! The proxy forwards the request to a single configured `http://` origin and
//! relays whatever comes back byte-for-byte. It speaks the simplest possible
//! HTTP/1.1 to the upstream: one request per connection with
//! `Connection: close`, and the response is read until the upstream closes.
//! Because the relayed framing may depend on that EOF, the client connection
//! is closed after the relay as well.
//!
//! Once the upstream response head has arrived, the proxy takes the client
//! connection over through the request's upgrade handle and streams the rest
//! as it is read. Without a connection to take over (a request built by
//! hand), the response is buffered up to a size limit instead.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

use crate::http::upgrade::OnUpgrade;
use crate::http::{CONTENT_TYPE, Request, Response, StatusCode};
use crate::reply::TEXT_PLAIN;

/// Default bound on one upstream exchange.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const MAX_RESPONSE_HEADERS: usize = 64;

/// Largest upstream response head accepted before giving up with a 502.
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

/// Default limit on a response the proxy has to hold in memory (8 MiB).
pub const MAX_BUFFERED_RESPONSE: usize = 8 * 1024 * 1024;

const RELAY_CHUNK: usize = 16 * 1024;

/// Errors from configuring or using the fallback proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid fallback target {target:?}: {source}")]
    InvalidTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("unsupported fallback scheme {0:?}; only http is supported")]
    UnsupportedScheme(String),

    #[error("fallback target has no host")]
    MissingHost,

    #[error("upstream I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed upstream response: {0}")]
    Parse(#[from] httparse::Error),

    #[error("upstream response has no status line")]
    IncompleteResponse,

    #[error("upstream response exceeds {limit} bytes")]
    ResponseTooLarge { limit: usize },
}

/// Reverse proxy to a single upstream origin.
///
/// # Examples
///
/// ```
/// use vroute::proxy::FallbackProxy;
///
/// let proxy = FallbackProxy::new("http://127.0.0.1:9000/legacy").unwrap();
/// assert_eq!(proxy.authority(), "127.0.0.1:9000");
///
/// assert!(FallbackProxy::new("https://example.com").is_err());
/// ```
#[derive(Debug, Clone)]
pub struct FallbackProxy {
    authority: String,
    base_path: String,
    base_query: Option<String>,
    timeout: Duration,
    max_buffered: usize,
}

// An upstream connection whose response head has been read.
struct Upstream {
    stream: TcpStream,
    status: StatusCode,
    // Everything read so far: the head and possibly the start of the body.
    received: BytesMut,
}

impl FallbackProxy {
    /// Parses `target` as an `http://host[:port][/base][?query]` URL.
    ///
    /// # Errors
    ///
    /// - [`ProxyError::InvalidTarget`] — `target` is not a URL.
    /// - [`ProxyError::UnsupportedScheme`] — the scheme is not `http`.
    /// - [`ProxyError::MissingHost`] — the URL has no host.
    pub fn new(target: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(target).map_err(|source| ProxyError::InvalidTarget {
            target: target.to_owned(),
            source,
        })?;

        if url.scheme() != "http" {
            return Err(ProxyError::UnsupportedScheme(url.scheme().to_owned()));
        }
        let host = url.host_str().ok_or(ProxyError::MissingHost)?;
        let port = url.port_or_known_default().unwrap_or(80);

        Ok(Self {
            authority: format!("{host}:{port}"),
            base_path: url.path().trim_end_matches('/').to_owned(),
            base_query: url.query().map(str::to_owned),
            timeout: UPSTREAM_TIMEOUT,
            max_buffered: MAX_BUFFERED_RESPONSE,
        })
    }

    /// Overrides the upstream exchange timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Overrides the limit on responses that have to be buffered.
    #[must_use]
    pub fn with_max_buffered(mut self, limit: usize) -> Self {
        self.max_buffered = limit;
        self
    }

    /// The `host:port` the proxy connects to.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Forwards `request` upstream and relays the response.
    ///
    /// Never fails: upstream errors before the response head arrives become
    /// `502 Bad Gateway` and an expired timeout becomes `504 Gateway Timeout`.
    /// The timeout bounds the wait for the head and then each read of the
    /// streamed body.
    pub async fn forward(&self, mut request: Request) -> Response {
        let upstream = match timeout(self.timeout, self.open(&request)).await {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => return self.failed(&err),
            Err(_) => return self.timed_out(),
        };

        match request.take_upgrade() {
            Some(on_upgrade) => self.stream_back(upstream, on_upgrade).await,
            None => match timeout(self.timeout, self.buffer(upstream)).await {
                Ok(Ok(response)) => {
                    debug!(
                        upstream = %self.authority,
                        status = response.status().as_u16(),
                        "relayed fallback response"
                    );
                    response
                }
                Ok(Err(err)) => self.failed(&err),
                Err(_) => self.timed_out(),
            },
        }
    }

    fn failed(&self, err: &ProxyError) -> Response {
        warn!(upstream = %self.authority, error = %err, "fallback proxy failed");
        gateway_error(StatusCode::BAD_GATEWAY)
    }

    fn timed_out(&self) -> Response {
        warn!(upstream = %self.authority, timeout = ?self.timeout, "fallback proxy timed out");
        gateway_error(StatusCode::GATEWAY_TIMEOUT)
    }

    // Sends the request and reads until the response head is complete.
    async fn open(&self, request: &Request) -> Result<Upstream, ProxyError> {
        let target = self.upstream_uri(request);

        // Headers named in `Connection` are hop-by-hop too.
        let listed: Vec<String> = request
            .headers()
            .get_all("connection")
            .flat_map(|value| value.split(','))
            .map(|name| name.trim().to_ascii_lowercase())
            .filter(|name| !name.is_empty())
            .collect();
        let skip: Vec<&str> = HOP_BY_HOP
            .iter()
            .copied()
            .chain(listed.iter().map(String::as_str))
            .collect();

        let mut stream = TcpStream::connect(&self.authority).await?;
        stream
            .write_all(&request.encode_for_upstream(&target, &skip))
            .await?;
        stream.flush().await?;

        let mut received = BytesMut::with_capacity(RELAY_CHUNK);
        loop {
            if stream.read_buf(&mut received).await? == 0 {
                return Err(ProxyError::IncompleteResponse);
            }
            if let Some(status) = parse_status(&received)? {
                return Ok(Upstream {
                    stream,
                    status,
                    received,
                });
            }
            if received.len() > MAX_RESPONSE_HEAD {
                return Err(ProxyError::ResponseTooLarge {
                    limit: MAX_RESPONSE_HEAD,
                });
            }
        }
    }

    // Reads the rest of the response into memory, up to `max_buffered` bytes.
    async fn buffer(&self, upstream: Upstream) -> Result<Response, ProxyError> {
        let Upstream {
            mut stream,
            status,
            mut received,
        } = upstream;

        while stream.read_buf(&mut received).await? != 0 {
            if received.len() > self.max_buffered {
                return Err(ProxyError::ResponseTooLarge {
                    limit: self.max_buffered,
                });
            }
        }
        Ok(Response::passthrough(status, received.freeze()))
    }

    // Hands what was read so far to the connection task, takes the client
    // stream over and copies the remainder as it arrives.
    async fn stream_back(&self, upstream: Upstream, on_upgrade: OnUpgrade) -> Response {
        let Upstream {
            stream: mut origin,
            status,
            received,
        } = upstream;

        let head = Response::passthrough(status, received.freeze());
        let (mut client, _) = match on_upgrade.upgrade(head).await {
            Ok(upgraded) => upgraded.into_parts(),
            Err(err) => {
                debug!(upstream = %self.authority, error = %err, "client went away before relay");
                return Response::passthrough(status, Bytes::new());
            }
        };

        let mut chunk = BytesMut::with_capacity(RELAY_CHUNK);
        let mut relayed = 0usize;
        loop {
            chunk.clear();
            match timeout(self.timeout, origin.read_buf(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if let Err(err) = client.write_all(&chunk).await {
                        debug!(upstream = %self.authority, error = %err, "client closed during relay");
                        break;
                    }
                    relayed += n;
                }
                Ok(Err(err)) => {
                    warn!(upstream = %self.authority, error = %err, "upstream failed mid-response");
                    break;
                }
                Err(_) => {
                    warn!(upstream = %self.authority, timeout = ?self.timeout, "upstream stalled mid-response");
                    break;
                }
            }
        }
        let _ = client.shutdown().await;

        debug!(
            upstream = %self.authority,
            status = status.as_u16(),
            streamed = relayed,
            "relayed fallback response"
        );
        Response::passthrough(status, Bytes::new())
    }

    // `base_path` never ends in a slash, so one is only added when the request
    // path lacks it. Queries are merged base-first.
    fn upstream_uri(&self, request: &Request) -> String {
        let path = request.path();
        let mut uri = if path.starts_with('/') {
            format!("{}{}", self.base_path, path)
        } else {
            format!("{}/{}", self.base_path, path)
        };

        let query = match (self.base_query.as_deref(), request.query_string()) {
            (Some(base), Some(own)) if !base.is_empty() && !own.is_empty() => {
                Some(format!("{base}&{own}"))
            }
            (Some(base), _) if !base.is_empty() => Some(base.to_owned()),
            (_, Some(own)) if !own.is_empty() => Some(own.to_owned()),
            _ => None,
        };
        if let Some(query) = query {
            uri.push('?');
            uri.push_str(&query);
        }
        uri
    }
}

// `None` until the whole response head has been received.
fn parse_status(raw: &[u8]) -> Result<Option<StatusCode>, ProxyError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(raw)? {
        httparse::Status::Complete(_) => response
            .code
            .map(|code| Some(StatusCode::from_u16(code)))
            .ok_or(ProxyError::IncompleteResponse),
        httparse::Status::Partial => Ok(None),
    }
}

fn gateway_error(status: StatusCode) -> Response {
    Response::new(status)
        .header(CONTENT_TYPE, TEXT_PLAIN)
        .body(status.canonical_reason())
        .keep_alive(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::Router;
    use crate::server::Server;
    use crate::{Error, context::Context};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const UPSTREAM_REPLY: &[u8] =
        b"HTTP/1.1 201 Created\r\nX-Upstream: yes\r\nContent-Length: 5\r\n\r\nhello";

    fn make_request(raw: &str) -> Request {
        let (request, _) = Request::parse(raw.as_bytes()).unwrap();
        request
    }

    // Reads one complete request (headers plus Content-Length body).
    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        loop {
            let mut chunk = [0u8; 1024];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up early");
            buf.extend_from_slice(&chunk[..n]);

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut req = httparse::Request::new(&mut headers);
            if let httparse::Status::Complete(offset) = req.parse(&buf).unwrap() {
                let length = req
                    .headers
                    .iter()
                    .find(|h| h.name.eq_ignore_ascii_case("content-length"))
                    .map(|h| std::str::from_utf8(h.value).unwrap().parse::<usize>().unwrap())
                    .unwrap_or(0);
                if buf.len() >= offset + length {
                    return String::from_utf8(buf).unwrap();
                }
            }
        }
    }

    // Accepts one connection, captures its request, and answers with `reply`.
    async fn upstream(reply: &'static [u8]) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            stream.write_all(reply).await.unwrap();
            let _ = tx.send(request);
        });

        (format!("http://{addr}"), rx)
    }

    #[test]
    fn rejects_unusable_targets() {
        assert!(matches!(
            FallbackProxy::new("not a url"),
            Err(ProxyError::InvalidTarget { .. })
        ));
        assert!(matches!(
            FallbackProxy::new("https://example.com"),
            Err(ProxyError::UnsupportedScheme(s)) if s == "https"
        ));
        assert!(FallbackProxy::new("http://").is_err());
    }

    #[test]
    fn default_port_is_80() {
        let proxy = FallbackProxy::new("http://legacy.internal").unwrap();
        assert_eq!(proxy.authority(), "legacy.internal:80");
    }

    #[test]
    fn upstream_uri_joins_base_path_and_merges_query() {
        let proxy = FallbackProxy::new("http://up/base?token=1").unwrap();
        let request = make_request("GET /items?page=2 HTTP/1.1\r\n\r\n");
        assert_eq!(proxy.upstream_uri(&request), "/base/items?token=1&page=2");

        let proxy = FallbackProxy::new("http://up").unwrap();
        let request = make_request("GET /items HTTP/1.1\r\n\r\n");
        assert_eq!(proxy.upstream_uri(&request), "/items");
    }

    #[tokio::test]
    async fn forwards_request_and_relays_response_verbatim() {
        let (target, captured) = upstream(UPSTREAM_REPLY).await;
        let proxy = FallbackProxy::new(&format!("{target}/legacy")).unwrap();

        let request = make_request(
            "POST /items?x=1 HTTP/1.1\r\n\
             Host: app.test\r\n\
             Connection: keep-alive, X-Session\r\n\
             X-Session: secret\r\n\
             Keep-Alive: timeout=5\r\n\
             X-Trace: abc\r\n\
             Content-Length: 2\r\n\r\nhi",
        );

        let response = proxy.forward(request).await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(!response.is_keep_alive());
        assert_eq!(response.into_bytes().as_ref(), UPSTREAM_REPLY);

        let forwarded = captured.await.unwrap();
        assert!(forwarded.starts_with("POST /legacy/items?x=1 HTTP/1.1\r\n"));
        assert!(forwarded.contains("Host: app.test\r\n"));
        assert!(forwarded.contains("X-Trace: abc\r\n"));
        assert!(forwarded.contains("Connection: close\r\n"));
        assert!(!forwarded.contains("Keep-Alive"));
        assert!(!forwarded.contains("X-Session"));
        assert!(forwarded.ends_with("\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let proxy = FallbackProxy::new(&format!("http://{addr}")).unwrap();
        let response = proxy.forward(make_request("GET / HTTP/1.1\r\n\r\n")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn garbage_upstream_response_is_502() {
        let (target, _captured) = upstream(b"definitely not http").await;
        let proxy = FallbackProxy::new(&target).unwrap();
        let response = proxy.forward(make_request("GET / HTTP/1.1\r\n\r\n")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn silent_upstream_times_out_with_504() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            std::future::pending::<()>().await;
            drop(stream);
        });

        let proxy = FallbackProxy::new(&format!("http://{addr}"))
            .unwrap()
            .with_timeout(Duration::from_millis(50));
        let response = proxy.forward(make_request("GET / HTTP/1.1\r\n\r\n")).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn router_sends_misses_to_fallback_even_for_known_paths() {
        let (target, captured) = upstream(UPSTREAM_REPLY).await;

        let mut router = Router::new();
        router.fallback(&target);
        router.get("/known", |_ctx: Context| async { Ok::<_, Error>(()) });

        let response = router
            .serve(make_request("DELETE /known HTTP/1.1\r\n\r\n"))
            .await;
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(captured.await.unwrap().starts_with("DELETE /known HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn oversized_buffered_response_is_502() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4096\r\n\r\n")
                .await;
            let _ = stream.write_all(&[b'x'; 4096]).await;
        });

        let proxy = FallbackProxy::new(&format!("http://{addr}"))
            .unwrap()
            .with_max_buffered(1024);
        let response = proxy.forward(make_request("GET / HTTP/1.1\r\n\r\n")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn response_is_streamed_before_upstream_finishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_request(&mut stream).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nfirst")
                .await
                .unwrap();
            release_rx.await.unwrap();
            stream.write_all(b"second").await.unwrap();
        });

        let mut router = Router::new();
        router.fallback(&format!("http://{upstream_addr}"));
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.serve(router));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /stream HTTP/1.1\r\nHost: app.test\r\n\r\n")
            .await
            .unwrap();

        let mut seen = Vec::new();
        while !seen.ends_with(b"first") {
            let mut chunk = [0u8; 256];
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed before the first part arrived");
            seen.extend_from_slice(&chunk[..n]);
        }

        release_tx.send(()).unwrap();
        client.read_to_end(&mut seen).await.unwrap();
        assert_eq!(
            seen,
            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\n\r\nfirstsecond".to_vec()
        );
    }

    #[tokio::test]
    async fn chunked_request_body_reaches_upstream() {
        let (target, captured) = upstream(UPSTREAM_REPLY).await;
        let mut router = Router::new();
        router.fallback(&target);

        let request = make_request(
            "POST /upload HTTP/1.1\r\n\
             Transfer-Encoding: chunked\r\n\r\n\
             3\r\nhel\r\n2\r\nlo\r\n0\r\n\r\n",
        );
        let response = router.serve(request).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let forwarded = captured.await.unwrap();
        assert!(forwarded.contains("Content-Length: 5\r\n"), "{forwarded}");
        assert!(!forwarded.contains("Transfer-Encoding"));
        assert!(forwarded.ends_with("\r\n\r\nhello"));
    }
}
