//! Request routing.
//!
//! Routes are literal `(method, path)` keys resolved against the path with
//! its query string stripped. The table is built before the server starts
//! and immutable afterwards; registering the same key twice is a startup
//! error, not a last-write-wins surprise.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::constants::{DEFAULT_HANDLER_TIMEOUT, DEFAULT_MAX_BODY_BYTES};
use crate::error::{Error, Result};
use crate::handlers::Handler;
use crate::protocol::Method;

// =============================================================================
// Route Options
// =============================================================================

/// Per-route limits and flags.
#[derive(Debug, Clone)]
pub struct RouteOptions {
    /// Body cap for this route; the global cap still applies on top.
    pub max_body_bytes: usize,
    /// Handler budget when the request names none.
    pub default_timeout: Duration,
    /// Requires the configured auth policy to admit the request.
    pub auth_required: bool,
}

impl Default for RouteOptions {
    fn default() -> Self {
        Self {
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            default_timeout: DEFAULT_HANDLER_TIMEOUT,
            auth_required: false,
        }
    }
}

impl RouteOptions {
    /// Sets the per-route body cap.
    #[must_use]
    pub fn with_max_body(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Sets the default handler timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Marks the route as requiring authentication.
    #[must_use]
    pub fn with_auth(mut self) -> Self {
        self.auth_required = true;
        self
    }
}

/// One resolved route table entry.
pub struct Route {
    pub handler: Arc<dyn Handler>,
    pub options: RouteOptions,
}

// =============================================================================
// Router
// =============================================================================

/// The immutable route table. Mutation happens only while the server is
/// being assembled.
#[derive(Default)]
pub struct Router {
    routes: HashMap<(Method, String), Route>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `(method, path)`.
    ///
    /// # Errors
    ///
    /// `DuplicateRoute` when the key is already taken.
    pub fn add(
        &mut self,
        method: Method,
        path: &str,
        handler: Arc<dyn Handler>,
        options: RouteOptions,
    ) -> Result<()> {
        let key = (method, path.to_string());
        if self.routes.contains_key(&key) {
            return Err(Error::DuplicateRoute {
                method: method.to_string(),
                path: path.to_string(),
            });
        }
        tracing::debug!(method = %method, path, "route registered");
        self.routes.insert(key, Route { handler, options });
        Ok(())
    }

    /// Looks up the route for a request. `path` must already have its query
    /// string stripped.
    #[must_use]
    pub fn resolve(&self, method: Method, path: &str) -> Option<&Route> {
        self.routes.get(&(method, path.to_string()))
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// =============================================================================
// Query Strings
// =============================================================================

/// Splits a raw request path into the route path and its percent-decoded
/// query parameters.
#[must_use]
pub fn split_query(raw_path: &str) -> (&str, HashMap<String, String>) {
    let Some((path, query)) = raw_path.split_once('?') else {
        return (raw_path, HashMap::new());
    };
    let mut params = HashMap::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        params.insert(percent_decode(key), percent_decode(value));
    }
    (path, params)
}

/// Percent-decoding with `+` treated as space. Malformed escapes pass
/// through literally.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let decoded = hex_val(bytes[i + 1])
                    .zip(hex_val(bytes[i + 2]))
                    .map(|(hi, lo)| hi << 4 | lo);
                if let Some(byte) = decoded {
                    out.push(byte);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::RequestContext;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Noop;

    #[async_trait]
    impl Handler for Noop {
        async fn handle(&self, _ctx: &RequestContext) -> Result<Value> {
            Ok(json!({}))
        }
    }

    fn noop() -> Arc<dyn Handler> {
        Arc::new(Noop)
    }

    #[test]
    fn duplicate_registration_is_fatal() {
        let mut router = Router::new();
        router
            .add(Method::Get, "/api/v1/ping", noop(), RouteOptions::default())
            .unwrap();
        let err = router
            .add(Method::Get, "/api/v1/ping", noop(), RouteOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRoute { .. }));

        // Same path under a different method is its own key.
        router
            .add(Method::Post, "/api/v1/ping", noop(), RouteOptions::default())
            .unwrap();
        assert_eq!(router.len(), 2);
    }

    #[test]
    fn resolve_is_literal() {
        let mut router = Router::new();
        router
            .add(Method::Get, "/api/v1/ping", noop(), RouteOptions::default())
            .unwrap();

        assert!(router.resolve(Method::Get, "/api/v1/ping").is_some());
        assert!(router.resolve(Method::Post, "/api/v1/ping").is_none());
        assert!(router.resolve(Method::Get, "/api/v1/ping/").is_none());
        assert!(router.resolve(Method::Get, "/api/v1/nope").is_none());
    }

    #[test]
    fn query_split_and_decode() {
        let (path, params) = split_query("/api/v1/file/info?path=%2Ftmp%2Fmy+file&flag");
        assert_eq!(path, "/api/v1/file/info");
        assert_eq!(params["path"], "/tmp/my file");
        assert_eq!(params["flag"], "");

        let (path, params) = split_query("/api/v1/ping");
        assert_eq!(path, "/api/v1/ping");
        assert!(params.is_empty());
    }

    #[test]
    fn malformed_escapes_pass_through() {
        let (_, params) = split_query("/x?k=%zz%2");
        assert_eq!(params["k"], "%zz%2");
    }
}
