//! # vroute
//!
//! A request-dispatch core for async HTTP/1.1 services: nested route groups,
//! middleware and afterware, typed handler results, websocket endpoints, and
//! a fallback reverse proxy for everything else.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde::Serialize;
//! use vroute::{Error, Router, Server, context::Context, http::StatusCode, reply::Reply};
//!
//! #[derive(Serialize)]
//! struct User {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut router = Router::new();
//!
//!     let api = router.group("/api");
//!     api.before(vroute::security::cors("*"));
//!     api.get("/users/:id", |ctx: Context| async move {
//!         match ctx.param("id") {
//!             Some("0") => Err(Error::status(StatusCode::NOT_FOUND, "no such user")),
//!             Some(id) => Ok(Reply::json(User { id: id.to_owned() })),
//!             None => Err(Error::other("route without :id")),
//!         }
//!     });
//!
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     server.serve(router).await?;
//!     Ok(())
//! }
//! ```

// ── Wire protocol ─────────────────────────────────────────────────────────────
pub mod http;
pub mod server;

// ── Dispatch core ─────────────────────────────────────────────────────────────
pub mod context;
pub mod error;
pub mod middleware;
pub mod reply;
pub mod router;

// ── Edges ─────────────────────────────────────────────────────────────────────
pub mod config;
pub mod proxy;
pub mod realtime;
pub mod security;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use context::Context;
pub use error::Error;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use reply::Reply;
pub use router::{RouteGroup, Router};
pub use server::{Server, ServerError};
