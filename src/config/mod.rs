//! Server options.
//!
//! [`Options`] is a plain serde document. Missing fields take their defaults,
//! so `{}` is a valid (if not very useful) configuration.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for loading options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid options: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Options for a router and its server.
///
/// # Examples
///
/// ```
/// use vroute::config::Options;
///
/// let options = Options::from_json(r#"{
///     "app_name": "billing",
///     "http_port": 8080,
///     "quiet_routes": ["/health"]
/// }"#).unwrap();
///
/// assert_eq!(options.http_addr().as_deref(), Some("0.0.0.0:8080"));
/// assert!(options.fallback_address.is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Options {
    /// Application name, for log and banner purposes.
    pub app_name: String,

    /// Public domain the application is served on.
    pub domain: String,

    /// Plain HTTP port. `None` or `0` means no listener is configured.
    pub http_port: Option<u16>,

    /// Origin that unmatched requests are proxied to, e.g. `http://127.0.0.1:9000`.
    pub fallback_address: Option<String>,

    /// Paths whose per-request logs are emitted at debug level.
    pub quiet_routes: Vec<String>,
}

impl Options {
    /// Parses options from a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] if `json` is malformed or a field has
    /// the wrong type.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads options from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Parse`] if its contents are invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    /// The listen address when an HTTP port is configured.
    pub fn http_addr(&self) -> Option<String> {
        self.http_port
            .filter(|port| *port != 0)
            .map(|port| format!("0.0.0.0:{port}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let options = Options::from_json("{}").unwrap();
        assert_eq!(options, Options::default());
        assert_eq!(options.http_addr(), None);
    }

    #[test]
    fn zero_port_means_no_listener() {
        let options = Options::from_json(r#"{"http_port": 0}"#).unwrap();
        assert_eq!(options.http_addr(), None);
    }

    #[test]
    fn full_document() {
        let options = Options::from_json(
            r#"{
                "app_name": "billing",
                "domain": "billing.example.com",
                "http_port": 9090,
                "fallback_address": "http://127.0.0.1:3000",
                "quiet_routes": ["/health", "/metrics"]
            }"#,
        )
        .unwrap();

        assert_eq!(options.app_name, "billing");
        assert_eq!(options.domain, "billing.example.com");
        assert_eq!(options.http_addr().as_deref(), Some("0.0.0.0:9090"));
        assert_eq!(
            options.fallback_address.as_deref(),
            Some("http://127.0.0.1:3000")
        );
        assert_eq!(options.quiet_routes, vec!["/health", "/metrics"]);
    }

    #[test]
    fn wrong_types_are_rejected() {
        let err = Options::from_json(r#"{"http_port": "eighty"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Options::from_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
