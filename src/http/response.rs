//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and
//! serializing them to a byte buffer for transmission over TCP.

use bytes::{BufMut, Bytes, BytesMut};

use tracing::warn;

use super::{Headers, StatusCode};

/// An HTTP/1.1 response, ready to be serialized and sent.
///
/// # Examples
///
/// ```
/// use vroute::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::OK)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// let bytes = response.into_bytes();
/// let text = std::str::from_utf8(&bytes).unwrap();
/// assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
/// assert!(text.contains("Content-Length: 15\r\n"));
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Bytes,
    keep_alive: bool,
    // Set for responses to HEAD: framing headers are written, the body is not.
    omit_body: bool,
    // Pre-serialized upstream bytes written verbatim instead of status/headers/body.
    passthrough: Option<Bytes>,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: true,
            omit_body: false,
            passthrough: None,
        }
    }

    /// Wraps a complete upstream response that must reach the client unmodified.
    ///
    /// `status` is only used for logging. The connection is closed after the
    /// bytes are written, since the upstream framing may rely on EOF.
    pub fn passthrough(status: StatusCode, raw: Bytes) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
            keep_alive: false,
            omit_body: false,
            passthrough: Some(raw),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the whole header map.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the response body from a string.
    ///
    /// The `Content-Length` header is written automatically by [`into_bytes`](Self::into_bytes).
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Bytes::from(body.into());
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Marks this as the answer to a `HEAD` request: `Content-Length` still
    /// describes the body, but the body itself is not written.
    #[must_use]
    pub fn omit_body(mut self) -> Self {
        self.omit_body = true;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the response body. Empty for passthrough responses.
    pub fn body_ref(&self) -> &Bytes {
        &self.body
    }

    /// Returns `true` if the connection may serve another request after this one.
    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Serializes the response into a `BytesMut` buffer using HTTP/1.1 wire format.
    ///
    /// - `Content-Type` is written only when present in the header map.
    /// - `Content-Length` and `Connection` are added for every non-1xx response;
    ///   informational responses (e.g. `101 Switching Protocols`) carry only
    ///   their explicit headers.
    /// - 1xx, `204` and `304` responses never carry a body, and neither does a
    ///   response marked with [`omit_body`](Self::omit_body). The first three
    ///   also carry no `Content-Length`.
    /// - CR and LF in header values are replaced with spaces; headers whose
    ///   name is not a valid token are dropped.
    /// - Passthrough responses are returned byte-for-byte.
    pub fn into_bytes(mut self) -> BytesMut {
        if let Some(raw) = self.passthrough {
            return BytesMut::from(raw.as_ref());
        }

        let informational = self.status.is_informational();
        if !informational {
            let connection = if self.keep_alive {
                "keep-alive"
            } else {
                "close"
            };
            self.headers.set("Connection", connection);
        }

        let bodiless = informational
            || self.status == StatusCode::NO_CONTENT
            || self.status == StatusCode::NOT_MODIFIED;
        let content_length = self.body.len();
        let estimated_size = 128 + self.headers.len() * 64 + content_length;
        let mut buf = BytesMut::with_capacity(estimated_size);

        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                self.status.as_u16(),
                self.status.canonical_reason()
            )
            .as_bytes(),
        );

        for (name, value) in self.headers.iter() {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            if !is_token(name) {
                warn!(header = ?name, "dropping response header with invalid name");
                continue;
            }
            buf.put(name.as_bytes());
            buf.put(&b": "[..]);
            put_header_value(&mut buf, value);
            buf.put(&b"\r\n"[..]);
        }

        if !bodiless {
            buf.put(format!("Content-Length: {content_length}\r\n").as_bytes());
        }

        buf.put(&b"\r\n"[..]);

        if !bodiless && !self.omit_body && !self.body.is_empty() {
            buf.put(self.body.as_ref());
        }

        buf
    }
}

// RFC 9110 `token`: the characters allowed in a header field name.
fn is_token(name: &str) -> bool {
    !name.is_empty()
        && name.bytes().all(|b| {
            b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
        })
}

fn put_header_value(buf: &mut BytesMut, value: &str) {
    for byte in value.bytes() {
        match byte {
            b'\r' | b'\n' | 0 => buf.put_u8(b' '),
            other => buf.put_u8(other),
        }
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn to_string(bytes: BytesMut) -> String {
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[test]
    fn simple_ok_response() {
        let r = Response::new(StatusCode::OK).body("Hello");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(s.contains("Content-Length: 5\r\n"));
        assert!(s.ends_with("\r\n\r\nHello"));
    }

    #[test]
    fn no_implicit_content_type() {
        let r = Response::new(StatusCode::OK).body_bytes(vec![0u8, 1, 2]);
        let s = to_string(r.into_bytes());
        assert!(!s.contains("Content-Type"));
    }

    #[test]
    fn explicit_content_length_is_not_duplicated() {
        let r = Response::new(StatusCode::OK)
            .header("Content-Length", "999")
            .body("ok");
        let s = to_string(r.into_bytes());
        assert_eq!(s.matches("Content-Length").count(), 1);
        assert!(s.contains("Content-Length: 2\r\n"));
    }

    #[test]
    fn switching_protocols_has_no_framing_headers() {
        let r = Response::new(StatusCode::SWITCHING_PROTOCOLS)
            .header("Upgrade", "websocket")
            .header("Connection", "Upgrade");
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(s.contains("Connection: Upgrade\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn connection_close() {
        let r = Response::new(StatusCode::OK).keep_alive(false);
        let s = to_string(r.into_bytes());
        assert!(s.contains("Connection: close\r\n"));
    }

    #[test]
    fn unknown_status_line() {
        let r = Response::new(StatusCode::from_u16(599));
        let s = to_string(r.into_bytes());
        assert!(s.starts_with("HTTP/1.1 599 \r\n"));
    }

    #[test]
    fn passthrough_is_verbatim() {
        let raw = Bytes::from_static(b"HTTP/1.1 201 Created\r\nX-Up: 1\r\n\r\nmade");
        let r = Response::passthrough(StatusCode::CREATED, raw.clone());
        assert!(!r.is_keep_alive());
        assert_eq!(r.into_bytes().as_ref(), raw.as_ref());
    }

    #[test]
    fn head_response_keeps_length_but_drops_body() {
        let r = Response::new(StatusCode::OK).body("[1,2,3]").omit_body();
        let s = to_string(r.into_bytes());
        assert!(s.contains("Content-Length: 7\r\n"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn no_content_and_not_modified_have_no_body() {
        let s = to_string(Response::new(StatusCode::NO_CONTENT).body("x").into_bytes());
        assert!(s.starts_with("HTTP/1.1 204 No Content\r\n"));
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));

        let s = to_string(Response::new(StatusCode::NOT_MODIFIED).body("x").into_bytes());
        assert!(!s.contains("Content-Length"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn informational_status_drops_body() {
        let s = to_string(Response::new(StatusCode::from_u16(103)).body("hint").into_bytes());
        assert!(!s.contains("hint"));
        assert!(s.ends_with("\r\n\r\n"));
    }

    #[test]
    fn header_values_cannot_inject_lines() {
        let r = Response::new(StatusCode::OK)
            .header("X-Echo", "a\r\nSet-Cookie: pwned=1")
            .header("Bad\r\nName", "v");
        let s = to_string(r.into_bytes());
        assert!(s.contains("X-Echo: a  Set-Cookie: pwned=1\r\n"));
        assert!(!s.contains("\r\nSet-Cookie"));
        assert!(!s.contains("Bad"));
    }
}
