//! HTTP/1.1 request parsing using the [`httparse`] crate.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::{Headers, Method, OnUpgrade, StatusCode};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete — more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },

    #[error("request has both Transfer-Encoding and Content-Length")]
    ConflictingFraming,

    #[error("unsupported Transfer-Encoding: {value:?}")]
    UnsupportedTransferEncoding { value: String },

    #[error("malformed chunked body")]
    InvalidChunk,
}

impl RequestError {
    /// The status a request failing with this error is answered with.
    pub fn status(&self) -> StatusCode {
        match self {
            RequestError::UnsupportedTransferEncoding { .. } => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// A fully parsed HTTP/1.1 request.
///
/// Created by [`Request::parse`] from a raw byte buffer. The body holds at most
/// `Content-Length` bytes, or the decoded payload of a `chunked` body; anything
/// after it in the buffer belongs to the next request on the connection.
///
/// # Examples
///
/// ```
/// use vroute::http::request::Request;
///
/// let raw = b"GET /hello?name=world HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/hello");
/// assert_eq!(request.uri(), "/hello?name=world");
/// assert_eq!(request.query_param("name"), Some("world"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    body: Bytes,
    // Bytes the body occupies on the wire, after the header block.
    framed_len: usize,
    params: HashMap<String, String>,
    upgrade: Option<OnUpgrade>,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parse a raw HTTP/1.1 request from a byte slice.
    ///
    /// Returns the parsed `Request` and the byte offset at which the body begins
    /// in `buf` (i.e. immediately after the `\r\n\r\n` header terminator).
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`] — more data is needed to complete the request headers.
    /// - [`RequestError::Parse`] — the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`] — a required field (method, path, version) is absent.
    /// - [`RequestError::InvalidContentLength`] — `Content-Length` is not a number.
    /// - [`RequestError::ConflictingFraming`] — both `Transfer-Encoding` and `Content-Length` are set.
    /// - [`RequestError::UnsupportedTransferEncoding`] — a coding other than `chunked` is used.
    /// - [`RequestError::InvalidChunk`] — the chunked body is malformed.
    ///
    /// A `chunked` body must be fully buffered before parsing succeeds; until
    /// then [`RequestError::Incomplete`] is returned.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let body_offset = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let method = match raw_req.method {
            Some(method) => method.parse::<Method>().unwrap_or_else(|never| match never {}),
            None => return Err(RequestError::MissingField { field: "method" }),
        };

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let rest = &buf[body_offset..];
        let (body, framed_len) = match header_map.get("transfer-encoding") {
            Some(_) if header_map.contains("content-length") => {
                return Err(RequestError::ConflictingFraming);
            }
            Some(value) => {
                if !value.trim().eq_ignore_ascii_case("chunked") {
                    return Err(RequestError::UnsupportedTransferEncoding {
                        value: value.to_owned(),
                    });
                }
                decode_chunked(rest)?
            }
            None => {
                let content_length = match header_map.get("content-length") {
                    Some(value) => value.trim().parse::<usize>().map_err(|_| {
                        RequestError::InvalidContentLength {
                            value: value.to_owned(),
                        }
                    })?,
                    None => 0,
                };
                let body_end = content_length.min(rest.len());
                (Bytes::copy_from_slice(&rest[..body_end]), content_length)
            }
        };

        let params = query.as_deref().map(parse_query_string).unwrap_or_default();

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                body,
                framed_len,
                params,
                upgrade: None,
            },
            body_offset,
        ))
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the request target as received: the path plus `?query` when present.
    pub fn uri(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns a parsed query parameter value by key.
    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Returns the request body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        if self.headers.contains_token("connection", "close") {
            return false;
        }
        self.version == 1 || self.headers.contains_token("connection", "keep-alive")
    }

    /// Returns the value of the `Content-Length` header parsed as a `usize`, if present.
    pub fn content_length(&self) -> Option<usize> {
        self.headers.get("content-length")?.trim().parse().ok()
    }

    /// Returns how many bytes after the header block belong to this request:
    /// `Content-Length`, or the encoded size of a `chunked` body.
    pub fn framed_len(&self) -> usize {
        self.framed_len
    }

    /// Attaches the connection-upgrade handle. Called by the server for every
    /// request it dispatches.
    pub(crate) fn set_on_upgrade(&mut self, upgrade: OnUpgrade) {
        self.upgrade = Some(upgrade);
    }

    /// Detaches the connection-upgrade handle, if the transport provided one.
    pub fn take_upgrade(&mut self) -> Option<OnUpgrade> {
        self.upgrade.take()
    }

    /// Serializes the request for forwarding to an upstream origin.
    ///
    /// `target` replaces the request target in the request line. Headers in
    /// `skip` (case-insensitive) are dropped, `Content-Length` is rewritten from
    /// the actual body and `Connection: close` is appended.
    pub(crate) fn encode_for_upstream(&self, target: &str, skip: &[&str]) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256 + self.headers.len() * 64 + self.body.len());

        buf.put(format!("{} {} HTTP/1.1\r\n", self.method, target).as_bytes());
        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length")
                || skip.iter().any(|s| name.eq_ignore_ascii_case(s))
            {
                continue;
            }
            buf.put(format!("{name}: {value}\r\n").as_bytes());
        }
        if !self.body.is_empty() || self.headers.contains("content-length") {
            buf.put(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        buf.put(&b"Connection: close\r\n\r\n"[..]);
        buf.put(self.body.as_ref());

        buf
    }
}

/// Decodes a complete `chunked` body from the start of `buf`.
///
/// Returns the payload and the number of bytes consumed, trailers included.
/// Trailer fields are discarded.
fn decode_chunked(buf: &[u8]) -> Result<(Bytes, usize), RequestError> {
    let mut body = BytesMut::new();
    let mut pos = 0;

    loop {
        let (used, size) = match httparse::parse_chunk_size(&buf[pos..]) {
            Ok(httparse::Status::Complete(pair)) => pair,
            Ok(httparse::Status::Partial) => return Err(RequestError::Incomplete),
            Err(_) => return Err(RequestError::InvalidChunk),
        };
        pos += used;

        if size == 0 {
            // Trailer section: header lines up to an empty line.
            loop {
                let line_end = buf[pos..]
                    .windows(2)
                    .position(|w| w == b"\r\n")
                    .ok_or(RequestError::Incomplete)?;
                pos += line_end + 2;
                if line_end == 0 {
                    return Ok((body.freeze(), pos));
                }
            }
        }

        let size = usize::try_from(size).map_err(|_| RequestError::InvalidChunk)?;
        let data_end = pos.checked_add(size).ok_or(RequestError::InvalidChunk)?;
        if buf.len() < data_end + 2 {
            return Err(RequestError::Incomplete);
        }
        if &buf[data_end..data_end + 2] != b"\r\n" {
            return Err(RequestError::InvalidChunk);
        }
        body.extend_from_slice(&buf[pos..data_end]);
        pos = data_end + 2;
    }
}

/// Parses a URL query string (`key=value&key2=value2`) into a `HashMap`.
///
/// Keys and values have `+` decoded as a space; percent-decoding is left to
/// handlers that need it.
fn parse_query_string(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key.replace('+', " "), value.replace('+', " "))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_get() {
        let raw = b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n";
        let (req, offset) = Request::parse(raw).unwrap();
        assert_eq!(req.method().as_str(), "GET");
        assert_eq!(req.path(), "/");
        assert_eq!(req.version(), 1);
        assert_eq!(req.headers().get("host"), Some("localhost"));
        assert_eq!(offset, raw.len());
    }

    #[test]
    fn parse_query_string() {
        let raw = b"GET /search?q=rust+lang&page=2 HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let (req, _) = Request::parse(raw).unwrap();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query_string(), Some("q=rust+lang&page=2"));
        assert_eq!(req.query_param("q"), Some("rust lang"));
        assert_eq!(req.query_param("page"), Some("2"));
    }

    #[test]
    fn incomplete_request() {
        let raw = b"GET / HTTP/1.1\r\nHost:";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn keep_alive_rules() {
        let (req, _) = Request::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert!(req.is_keep_alive());

        let (req, _) =
            Request::parse(b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());

        let (req, _) = Request::parse(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n").unwrap();
        assert!(!req.is_keep_alive());
    }

    #[test]
    fn body_stops_at_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhelloGET /next HTTP/1.1\r\n\r\n";
        let (req, body_offset) = Request::parse(raw).unwrap();
        assert_eq!(req.content_length(), Some(5));
        assert_eq!(req.body().as_ref(), b"hello");
        assert_eq!(&raw[body_offset..body_offset + 5], b"hello");
    }

    #[test]
    fn rejects_non_numeric_content_length() {
        let raw = b"POST / HTTP/1.1\r\nContent-Length: five\r\n\r\n";
        assert!(matches!(
            Request::parse(raw),
            Err(RequestError::InvalidContentLength { .. })
        ));
    }

    #[test]
    fn upstream_encoding_drops_hop_by_hop_headers() {
        let raw = b"POST /api?x=1 HTTP/1.1\r\nHost: front\r\nConnection: keep-alive\r\nX-Trace: 7\r\nContent-Length: 2\r\n\r\nhi";
        let (req, _) = Request::parse(raw).unwrap();

        let encoded = req.encode_for_upstream("/base/api?x=1", &["connection"]);
        let text = std::str::from_utf8(&encoded).unwrap();

        assert!(text.starts_with("POST /base/api?x=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: front\r\n"));
        assert!(text.contains("X-Trace: 7\r\n"));
        assert!(!text.contains("keep-alive"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("Connection: close\r\n\r\nhi"));
    }

    #[test]
    fn decodes_chunked_body_and_reports_framed_len() {
        let raw = b"POST /echo HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
                    3\r\nhel\r\n2;ext=1\r\nlo\r\n0\r\nX-Trailer: t\r\n\r\nGET / HTTP/1.1\r\n\r\n";
        let (req, body_offset) = Request::parse(raw).unwrap();
        assert_eq!(req.body().as_ref(), b"hello");
        assert_eq!(req.content_length(), None);
        let next = &raw[body_offset + req.framed_len()..];
        assert!(next.starts_with(b"GET / HTTP/1.1"));
    }

    #[test]
    fn partial_chunked_body_is_incomplete() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhel";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));

        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n";
        assert!(matches!(Request::parse(raw), Err(RequestError::Incomplete)));
    }

    #[test]
    fn rejects_ambiguous_or_unsupported_framing() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nContent-Length: 3\r\n\r\n";
        let err = Request::parse(raw).unwrap_err();
        assert!(matches!(err, RequestError::ConflictingFraming));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n";
        let err = Request::parse(raw).unwrap_err();
        assert!(matches!(err, RequestError::UnsupportedTransferEncoding { .. }));
        assert_eq!(err.status(), StatusCode::NOT_IMPLEMENTED);

        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        assert!(matches!(Request::parse(raw), Err(RequestError::InvalidChunk)));
    }
}
