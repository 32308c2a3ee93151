//! Built-in guest handlers and the handler seam.
//!
//! A handler consumes a parsed request context and produces the `data`
//! payload for a success envelope, or an error the envelope layer maps to a
//! code. Handlers never touch the channel and never panic the process.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::envelope::RequestBody;
use crate::error::Result;
use crate::protocol::Method;

pub mod file;
pub mod service;
pub mod shell;
pub mod system;

// =============================================================================
// Request Context
// =============================================================================

/// Everything a handler may inspect about one request. Borrowed for the
/// duration of the call; handlers must not retain it.
#[derive(Debug)]
pub struct RequestContext {
    pub method: Method,
    /// Route path, query string stripped.
    pub path: String,
    /// Percent-decoded query parameters.
    pub query: HashMap<String, String>,
    /// Decoded JSON body.
    pub body: RequestBody,
    /// Correlation ID, from the header or generated.
    pub request_id: String,
    /// Wall-clock budget for this invocation. The server also enforces it
    /// from outside; long-running handlers (subprocesses) use it to bound
    /// their own children.
    pub deadline: Duration,
    /// Seconds since the server started.
    pub uptime_secs: u64,
}

impl RequestContext {
    /// Fetches a parameter from the body, falling back to the query string.
    #[must_use]
    pub fn param(&self, key: &str) -> Option<String> {
        self.body
            .params
            .get(key)
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .or_else(|| self.query.get(key).cloned())
    }
}

// =============================================================================
// Handler Trait
// =============================================================================

/// One endpoint's implementation. Registered into the route table behind an
/// `Arc`, invoked strictly sequentially per channel.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Handles one request, returning the success payload for
    /// `envelope.data`.
    async fn handle(&self, ctx: &RequestContext) -> Result<Value>;
}
