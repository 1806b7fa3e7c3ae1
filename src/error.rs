//! Handler errors.
//!
//! Every handler and middleware reports failure through [`Error`]. The router
//! turns it into a wire response with [`resolve_error`](crate::reply::resolve_error):
//! a [`Error::Status`] keeps its status and message, anything else becomes a
//! `500 Internal Server Error` carrying the error's text.

use thiserror::Error;

use crate::http::StatusCode;

/// Boxed error type accepted by [`Error::other`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure returned by a handler, middleware, or websocket handler.
///
/// # Examples
///
/// ```
/// use vroute::{Error, http::StatusCode};
///
/// let missing = Error::status(StatusCode::NOT_FOUND, "not found");
/// assert_eq!(missing.status_code(), StatusCode::NOT_FOUND);
///
/// let boom = Error::other("boom");
/// assert_eq!(boom.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
/// assert_eq!(boom.to_string(), "boom");
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// A failure with an explicit wire status and message.
    #[error("{message}")]
    Status { status: StatusCode, message: String },

    /// Any other failure; always reported as a 500.
    #[error(transparent)]
    Other(BoxError),
}

impl Error {
    /// Creates a typed error with the given status and message.
    pub fn status(status: impl Into<StatusCode>, message: impl Into<String>) -> Self {
        Error::Status {
            status: status.into(),
            message: message.into(),
        }
    }

    /// Wraps any error (or a plain message) as a generic failure.
    pub fn other(err: impl Into<BoxError>) -> Self {
        Error::Other(err.into())
    }

    /// The status this error resolves to.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Status { status, .. } if status.as_u16() != 0 => *status,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Other(Box::new(err))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Other(Box::new(err))
    }
}
