//! Handler return values and their resolution into wire responses.
//!
//! A handler returns `Result<Reply, Error>`. [`Reply`] is a closed union of
//! the four things a handler can hand back:
//!
//! | Variant                 | Status            | Body                 | Content type        |
//! |-------------------------|-------------------|----------------------|---------------------|
//! | [`Reply::Response`]     | as given (200 if 0) | as given           | as given, or none   |
//! | [`Reply::Bytes`]        | 200               | as-is                | none                |
//! | [`Reply::Json`]         | 200               | JSON encoding        | `application/json`  |
//! | [`Reply::Empty`]        | 200               | empty                | none                |
//!
//! Errors resolve through [`resolve_error`]: a typed error keeps its status
//! and sends its message as plain text, any other error is a 500 with the
//! error's text.
//!
//! Both resolvers are total. The router applies one more rule afterwards: a
//! `Content-Type` already present in the context's response headers wins over
//! the resolved one.

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error};

use crate::Error;
use crate::http::StatusCode;

/// `Content-Type` for JSON bodies.
pub const APPLICATION_JSON: &str = "application/json";

/// `Content-Type` for error bodies.
pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// A value that can be written as a JSON response body.
///
/// Implemented for every `Serialize + Send` type; it exists so [`Reply::Json`]
/// can hold any serializable value without committing to a concrete type.
pub trait JsonBody: Send {
    /// Encodes the value as JSON bytes.
    fn to_json(&self) -> serde_json::Result<Vec<u8>>;
}

impl<T> JsonBody for T
where
    T: Serialize + Send,
{
    fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// A response with an explicit status, body, and optional content type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TypedResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl TypedResponse {
    /// Creates a response with the given status and body.
    pub fn new(status: impl Into<StatusCode>, body: impl Into<Bytes>) -> Self {
        Self {
            status: status.into(),
            body: body.into(),
            content_type: None,
        }
    }

    /// Creates a response whose body is the JSON encoding of `value`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Other`] if `value` cannot be serialized.
    pub fn json<T: Serialize>(status: impl Into<StatusCode>, value: &T) -> Result<Self, Error> {
        Ok(Self {
            status: status.into(),
            body: Bytes::from(serde_json::to_vec(value)?),
            content_type: Some(APPLICATION_JSON.to_owned()),
        })
    }

    /// Sets the content type.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Shorthand for [`TypedResponse::new`] wrapped in a [`Reply`].
///
/// # Examples
///
/// ```
/// use vroute::{reply::respond, http::StatusCode};
///
/// let reply = respond(StatusCode::CREATED, "made");
/// ```
pub fn respond(status: impl Into<StatusCode>, body: impl Into<Bytes>) -> Reply {
    Reply::Response(TypedResponse::new(status, body))
}

/// What a handler hands back on success.
pub enum Reply {
    /// Explicit status, body, and content type.
    Response(TypedResponse),
    /// Raw body bytes; status 200, content type left to the handler.
    Bytes(Bytes),
    /// Any serializable value, sent as JSON with status 200.
    Json(Box<dyn JsonBody>),
    /// Nothing to send; status 200 with an empty body.
    Empty,
}

impl Reply {
    /// Wraps a serializable value for a JSON response.
    pub fn json<T>(value: T) -> Self
    where
        T: Serialize + Send + 'static,
    {
        Reply::Json(Box::new(value))
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Reply::Bytes(bytes) => f.debug_tuple("Bytes").field(bytes).finish(),
            Reply::Json(_) => f.write_str("Json(..)"),
            Reply::Empty => f.write_str("Empty"),
        }
    }
}

impl From<TypedResponse> for Reply {
    fn from(response: TypedResponse) -> Self {
        Reply::Response(response)
    }
}

impl From<Bytes> for Reply {
    fn from(bytes: Bytes) -> Self {
        Reply::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Reply {
    fn from(bytes: Vec<u8>) -> Self {
        Reply::Bytes(Bytes::from(bytes))
    }
}

impl From<&'static [u8]> for Reply {
    fn from(bytes: &'static [u8]) -> Self {
        Reply::Bytes(Bytes::from_static(bytes))
    }
}

impl From<()> for Reply {
    fn from(_: ()) -> Self {
        Reply::Empty
    }
}

/// The status, body, and detected content type of a resolved handler result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<String>,
}

impl Resolved {
    fn plain(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            body: Bytes::from(message.into()),
            content_type: Some(TEXT_PLAIN.to_owned()),
        }
    }
}

/// Resolves a successful handler value.
pub fn resolve_value(reply: Reply) -> Resolved {
    match reply {
        Reply::Response(TypedResponse {
            status,
            body,
            content_type,
        }) => Resolved {
            status: if status.as_u16() == 0 {
                StatusCode::OK
            } else {
                status
            },
            body,
            content_type,
        },
        Reply::Bytes(body) => Resolved {
            status: StatusCode::OK,
            body,
            content_type: None,
        },
        Reply::Json(value) => match value.to_json() {
            Ok(body) => Resolved {
                status: StatusCode::OK,
                body: Bytes::from(body),
                content_type: Some(APPLICATION_JSON.to_owned()),
            },
            Err(err) => {
                error!(error = %err, "failed to serialize response body");
                Resolved::plain(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to serialize response",
                )
            }
        },
        Reply::Empty => Resolved {
            status: StatusCode::OK,
            body: Bytes::new(),
            content_type: None,
        },
    }
}

/// Resolves a handler error.
pub fn resolve_error(err: &Error) -> Resolved {
    match err {
        Error::Status { status, message } => {
            // Zero means unset.
            let status = if status.as_u16() == 0 {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                *status
            };
            if status.is_server_error() {
                error!(status = status.as_u16(), "{message}");
            } else {
                debug!(status = status.as_u16(), "{message}");
            }
            Resolved::plain(status, message.clone())
        }
        Error::Other(source) => {
            error!(error = %source, "handler failed");
            Resolved::plain(StatusCode::INTERNAL_SERVER_ERROR, source.to_string())
        }
    }
}

/// Resolves a complete handler result.
pub fn resolve(result: Result<Reply, Error>) -> Resolved {
    match result {
        Ok(reply) => resolve_value(reply),
        Err(err) => resolve_error(&err),
    }
}
