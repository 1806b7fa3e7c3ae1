use std::future::{Ready, ready};

use crate::Error;
use crate::context::Context;
use crate::middleware::Middleware;
use crate::reply::Reply;
use crate::router::IntoHandler;

/// Request headers a cross-origin caller may send.
pub const ALLOWED_HEADERS: &str =
    "Accept, Content-Type, Content-Length, Accept-Encoding, Authorization, cache-control";

/// CORS header injection for a single configured domain.
///
/// # Behavior
///
/// - `"*"` allows every origin.
/// - Any other non-empty value is sent verbatim as the allowed origin.
/// - An empty domain disables CORS: no headers are set.
///
/// The request's `Origin` is not inspected; the browser enforces the policy.
///
/// # Examples
///
/// ```
/// use vroute::{Router, security};
///
/// let mut router = Router::new();
/// router.before(security::cors("https://app.example.com"));
/// router.options("/api/*", security::cors_handler("https://app.example.com"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cors {
    domain: String,
}

impl Cors {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }

    /// `false` when configured with an empty domain.
    pub fn is_enabled(&self) -> bool {
        !self.domain.is_empty()
    }

    /// Sets the CORS response headers on `ctx`.
    pub fn apply(&self, ctx: &Context) {
        if !self.is_enabled() {
            return;
        }
        ctx.set_header("Access-Control-Allow-Origin", self.domain.as_str());
        ctx.set_header("X-Requested-With", "XMLHttpRequest");
        ctx.set_header("Access-Control-Allow-Headers", ALLOWED_HEADERS);
    }
}

impl Middleware for Cors {
    fn run(&self, ctx: &Context) -> Result<(), Error> {
        self.apply(ctx);
        Ok(())
    }
}

/// CORS middleware for `domain`.
pub fn cors(domain: impl Into<String>) -> Cors {
    Cors::new(domain)
}

/// Terminal handler for preflight routes: sets the CORS headers and answers
/// with an empty `200`.
pub fn cors_handler(domain: impl Into<String>) -> impl IntoHandler {
    let cors = Cors::new(domain);
    move |ctx: Context| -> Ready<Result<Reply, Error>> {
        cors.apply(&ctx);
        ready(Ok(Reply::Empty))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Parameters;
    use crate::http::{Method, Request, StatusCode};
    use crate::router::Router;

    fn ctx() -> Context {
        let (request, _) = Request::parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        Context::new(request, Parameters::new())
    }

    #[test]
    fn wildcard_domain_sets_all_headers() {
        let ctx = ctx();
        cors("*").run(&ctx).unwrap();

        let headers = ctx.response_headers();
        assert_eq!(headers.get("access-control-allow-origin"), Some("*"));
        assert_eq!(headers.get("x-requested-with"), Some("XMLHttpRequest"));
        assert_eq!(
            headers.get("access-control-allow-headers"),
            Some(ALLOWED_HEADERS)
        );
    }

    #[test]
    fn empty_domain_sets_nothing() {
        let ctx = ctx();
        assert!(!cors("").is_enabled());
        cors("").run(&ctx).unwrap();
        assert!(ctx.response_headers().is_empty());
    }

    #[tokio::test]
    async fn preflight_handler_answers_empty_200() {
        let mut router = Router::new();
        router.handle(Method::Options, "/api/*", cors_handler("https://app.test"));

        let (request, _) = Request::parse(b"OPTIONS /api/users HTTP/1.1\r\n\r\n").unwrap();
        let res = router.serve(request).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert!(res.body_ref().is_empty());
        assert_eq!(
            res.headers().get("access-control-allow-origin"),
            Some("https://app.test")
        );
    }
}
