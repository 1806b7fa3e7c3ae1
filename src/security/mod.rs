//! Security middleware.
//!
//! Currently implemented:
//!
//! - [`Cors`] — Cross-Origin Resource Sharing header injection, usable as
//!   middleware ([`cors`]) or as a terminal preflight handler ([`cors_handler`]).

mod cors;

pub use cors::{ALLOWED_HEADERS, Cors, cors, cors_handler};
