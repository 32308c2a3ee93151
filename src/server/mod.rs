//! Guest-side RPC server.
//!
//! The server owns the virtio-serial character device and turns the raw
//! byte stream into dispatched requests:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Server                                                     │
//! │                                                            │
//! │  INITIALIZING ──open──▶ RUNNING ──lost──▶ RECONNECTING     │
//! │                            │    ◀──backoff, reopen──┘      │
//! │                          stop                              │
//! │                            ▼                               │
//! │                        STOPPING ──▶ STOPPED                │
//! │                                                            │
//! │  per channel: read request → route → handler (deadline)    │
//! │               → envelope → write response, strictly        │
//! │               sequential                                   │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Requests on one channel are processed strictly sequentially: the
//! transport is a single byte stream with no multiplexing, so interleaved
//! writes would corrupt framing. Reconnecting backs off from 1 s doubling
//! to 30 s and resets on success. In-flight work at the moment of
//! disconnect is lost; the next connection is a fresh session.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::{Channel, Deadline};
use crate::config::GuestConfig;
use crate::constants::{
    API_PREFIX, DEFAULT_READ_TIMEOUT, DEFAULT_WRITE_TIMEOUT, KILL_GRACE_PERIOD, MAX_CHUNK,
    MAX_HANDLER_SECONDS, RECONNECT_BACKOFF_INITIAL, RECONNECT_BACKOFF_MAX,
};
use crate::envelope::{
    generate_request_id, RequestBody, ResponseEnvelope, HEADER_REQUEST_ID, HEADER_RESPONSE_TIME,
};
use crate::error::{Error, Result};
use crate::handlers::{
    file::{
        ChunkedDownloadHandler, ChunkedUploadAbortHandler, ChunkedUploadChunkHandler,
        ChunkedUploadFinishHandler, ChunkedUploadInitHandler, FileDownloadHandler, FileInfoHandler,
        FileState, FileUploadHandler,
    },
    service::ServiceControlHandler,
    shell::ShellExecHandler,
    system::{PingHandler, SystemInfoHandler, SystemStatusHandler},
    Handler, RequestContext,
};
use crate::policy::{CommandPolicy, PathPolicy, RateLimiter};
use crate::protocol::{self, Headers, Method};

mod router;

pub use router::{split_query, Route, RouteOptions, Router};

// =============================================================================
// Auth Hook
// =============================================================================

/// Pluggable request authentication. Routes flagged `auth_required` pass
/// their headers through this when `enable_auth` is set; the token scheme
/// itself lives with the deployment, not here.
pub trait AuthPolicy: Send + Sync {
    fn authorize(&self, headers: &Headers) -> bool;
}

// =============================================================================
// Lifecycle
// =============================================================================

/// Observable server lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Initializing,
    Running,
    Reconnecting,
    Stopping,
    Stopped,
}

// =============================================================================
// Server
// =============================================================================

/// The guest RPC server. Build with [`Server::new`], optionally add routes
/// with [`Server::register`], then drive it with [`Server::serve`].
pub struct Server {
    config: GuestConfig,
    router: Router,
    auth: Option<Arc<dyn AuthPolicy>>,
    rate_limiter: Option<RateLimiter>,
    started: Instant,
    state: std::sync::Mutex<ServerState>,
    shutdown_tx: watch::Sender<bool>,
}

impl Server {
    /// Creates a server with the built-in handler set registered.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRoute` if the built-in table is inconsistent.
    pub fn new(config: GuestConfig) -> Result<Self> {
        let mut router = Router::new();
        register_builtin(&mut router, &config)?;

        let rate_limiter = config.rate_limit.as_ref().map(RateLimiter::new);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            router,
            auth: None,
            rate_limiter,
            started: Instant::now(),
            state: std::sync::Mutex::new(ServerState::Initializing),
            shutdown_tx,
        })
    }

    /// Registers a user handler. Must happen before [`Server::serve`].
    ///
    /// # Errors
    ///
    /// Returns `DuplicateRoute` when `(method, path)` is already taken.
    pub fn register(
        &mut self,
        method: Method,
        path: &str,
        handler: Arc<dyn Handler>,
        options: RouteOptions,
    ) -> Result<()> {
        self.router.add(method, path, handler, options)
    }

    /// Installs the authentication hook for `auth_required` routes.
    #[must_use]
    pub fn with_auth_policy(mut self, policy: Arc<dyn AuthPolicy>) -> Self {
        self.auth = Some(policy);
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Signals the serve loop to finish the in-flight request and stop.
    pub fn stop(&self) {
        info!("stop requested");
        let _ = self.shutdown_tx.send(true);
    }

    fn set_state(&self, state: ServerState) {
        let mut slot = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if *slot != state {
            debug!(from = ?*slot, to = ?state, "state transition");
            *slot = state;
        }
    }

    /// Opens the configured character device and serves it, reconnecting
    /// with backoff until [`Server::stop`] is called.
    ///
    /// # Errors
    ///
    /// Only configuration-level failures escape; channel-level failures
    /// feed the reconnect loop.
    pub async fn serve(&self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = RECONNECT_BACKOFF_INITIAL;

        info!(device = %self.config.device_path.display(), "server starting");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match Channel::open_device(&self.config.device_path, self.config.buffer_size).await {
                Ok(channel) => {
                    self.set_state(ServerState::Running);
                    backoff = RECONNECT_BACKOFF_INITIAL;
                    info!(device = %self.config.device_path.display(), "channel open");

                    match self.serve_channel(channel).await {
                        Ok(()) => break, // clean shutdown
                        Err(e) => warn!(error = %e, "channel lost"),
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to open channel");
                }
            }

            if *shutdown_rx.borrow() {
                break;
            }
            self.set_state(ServerState::Reconnecting);
            debug!(backoff_secs = backoff.as_secs(), "reconnect backoff");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown_rx.changed() => break,
            }
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX);
        }

        self.set_state(ServerState::Stopping);
        self.set_state(ServerState::Stopped);
        info!("server stopped");
        Ok(())
    }

    /// Serves one channel until it dies or shutdown is requested. Public so
    /// tests and alternative transports can drive the request loop over any
    /// stream.
    ///
    /// # Errors
    ///
    /// Returns the transport error that killed the channel; `Ok` means a
    /// clean stop.
    pub async fn serve_stream<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        self.serve_channel(Channel::new(stream, self.config.buffer_size))
            .await
    }

    async fn serve_channel<S>(&self, mut channel: Channel<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                return Ok(());
            }
            let head = tokio::select! {
                _ = shutdown_rx.changed() => return Ok(()),
                head = protocol::read_request_head(&mut channel, Deadline::none()) => head,
            };

            let head = match head {
                Ok(head) => head,
                Err(e @ (Error::Malformed(_) | Error::Oversize { .. })) => {
                    // Framing is unrecoverable: answer and drop the channel.
                    let envelope = ResponseEnvelope::failure(&e);
                    let _ = self.write_response(&mut channel, envelope, None, 0).await;
                    return Err(Error::ConnectionLost(format!("bad request head: {e}")));
                }
                Err(e) => return Err(e),
            };

            let started = Instant::now();
            let request_id = head
                .headers
                .get(HEADER_REQUEST_ID)
                .map(ToString::to_string)
                .unwrap_or_else(generate_request_id);
            let (path, query) = split_query(&head.path);
            info!(
                method = %head.method,
                path,
                request_id = %request_id,
                "request received"
            );

            let route = self.router.resolve(head.method, path);
            let body_cap = route
                .map(|r| r.options.max_body_bytes)
                .unwrap_or(self.config.max_request_size)
                .min(self.config.max_request_size);

            let body = match protocol::read_body(
                &mut channel,
                head.content_length,
                body_cap,
                Deadline::after(DEFAULT_READ_TIMEOUT),
            )
            .await
            {
                Ok(body) => body,
                Err(e @ Error::Oversize { .. }) => {
                    // The unread body would corrupt framing; reject and
                    // force a fresh channel.
                    let envelope = ResponseEnvelope::failure(&e);
                    let _ = self
                        .write_response(&mut channel, envelope, Some(&request_id), 0)
                        .await;
                    return Err(Error::ConnectionLost(format!("oversized body: {e}")));
                }
                Err(e) => return Err(e),
            };

            let envelope = match route {
                None => {
                    let err = Error::EndpointNotFound {
                        method: head.method.to_string(),
                        path: path.to_string(),
                    };
                    warn!(method = %head.method, path, "no route");
                    ResponseEnvelope::failure(&err)
                }
                Some(route) => {
                    self.dispatch(route, &head.headers, head.method, path, query, &body, &request_id)
                        .await
                }
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(
                request_id = %request_id,
                code = envelope.code,
                elapsed_ms,
                "request completed"
            );
            self.write_response(&mut channel, envelope, Some(&request_id), elapsed_ms)
                .await?;
        }
    }

    /// Runs policy gates and the handler for one resolved route.
    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        route: &Route,
        headers: &Headers,
        method: Method,
        path: &str,
        query: std::collections::HashMap<String, String>,
        body: &[u8],
        request_id: &str,
    ) -> ResponseEnvelope {
        if self.config.enable_auth && route.options.auth_required {
            let authorized = self
                .auth
                .as_ref()
                .is_some_and(|policy| policy.authorize(headers));
            if !authorized {
                return ResponseEnvelope::failure(&Error::PermissionDenied(
                    "authentication required".into(),
                ));
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.try_acquire() {
                return ResponseEnvelope::failure(&Error::ServiceUnavailable(
                    "rate limit exceeded".into(),
                ));
            }
        }

        let decoded = match RequestBody::decode(body) {
            Ok(decoded) => decoded,
            Err(e) => return ResponseEnvelope::failure(&e),
        };

        let deadline = Duration::from_secs(
            decoded
                .timeout
                .unwrap_or(u64::MAX)
                .min(route.options.default_timeout.as_secs())
                .min(MAX_HANDLER_SECONDS)
                .max(1),
        );

        let ctx = RequestContext {
            method,
            path: path.to_string(),
            query,
            body: decoded,
            request_id: request_id.to_string(),
            deadline,
            uptime_secs: self.started.elapsed().as_secs(),
        };

        // The deadline is the only cancellation signal, but the handler
        // owns the unwind: it gets the kill grace window on top of the
        // deadline to deliver SIGTERM, escalate, and reap its child before
        // the future is abandoned outright.
        let unwind_budget = deadline + KILL_GRACE_PERIOD + Duration::from_secs(1);
        match tokio::time::timeout(unwind_budget, route.handler.handle(&ctx)).await {
            Ok(Ok(data)) => ResponseEnvelope::success(data),
            Ok(Err(e)) => {
                warn!(request_id = %request_id, error = %e, "handler failed");
                ResponseEnvelope::failure(&e)
            }
            Err(_) => {
                // Handler failed to unwind within the grace window; drop it
                // and discard whatever it produces after this point.
                warn!(request_id = %request_id, deadline_secs = deadline.as_secs(), "handler deadline expired");
                ResponseEnvelope::failure(&Error::CmdTimeout {
                    timeout_secs: deadline.as_secs(),
                })
            }
        }
    }

    /// Serializes and writes one response as a single atomic message.
    async fn write_response<S>(
        &self,
        channel: &mut Channel<S>,
        envelope: ResponseEnvelope,
        request_id: Option<&str>,
        elapsed_ms: u64,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut response = envelope.into_http(request_id);
        response
            .headers
            .set(HEADER_RESPONSE_TIME, elapsed_ms.to_string());
        channel
            .write_all(&response.to_bytes(), Deadline::after(DEFAULT_WRITE_TIMEOUT))
            .await
    }
}

// =============================================================================
// Built-in Routes
// =============================================================================

/// Wires the default handler set into a fresh router.
fn register_builtin(router: &mut Router, config: &GuestConfig) -> Result<()> {
    let path_policy = Arc::new(PathPolicy::new(&config.allowed_paths));
    let command_policy = Arc::new(CommandPolicy::new(&config.allowed_commands));
    let file_state = Arc::new(FileState::new(Arc::clone(&path_policy)));

    let defaults = RouteOptions::default().with_timeout(config.request_timeout);
    // Chunk payloads are base64-inflated; leave generous headroom over the
    // decoded 1 MiB cap.
    let chunk_body = RouteOptions::default()
        .with_timeout(config.request_timeout)
        .with_max_body(2 * MAX_CHUNK);

    router.add(
        Method::Get,
        &format!("{API_PREFIX}/ping"),
        Arc::new(PingHandler),
        defaults.clone(),
    )?;
    router.add(
        Method::Get,
        &format!("{API_PREFIX}/system/info"),
        Arc::new(SystemInfoHandler),
        defaults.clone(),
    )?;
    router.add(
        Method::Get,
        &format!("{API_PREFIX}/system/status"),
        Arc::new(SystemStatusHandler),
        defaults.clone(),
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/shell/exec"),
        Arc::new(ShellExecHandler::new(command_policy, Arc::clone(&path_policy))),
        defaults.clone(),
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/file/upload"),
        Arc::new(FileUploadHandler::new(Arc::clone(&file_state))),
        defaults.clone(),
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/file/download"),
        Arc::new(FileDownloadHandler::new(Arc::clone(&file_state))),
        defaults.clone(),
    )?;
    router.add(
        Method::Get,
        &format!("{API_PREFIX}/file/info"),
        Arc::new(FileInfoHandler::new(Arc::clone(&file_state))),
        defaults.clone(),
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/file/chunked/upload/init"),
        Arc::new(ChunkedUploadInitHandler::new(Arc::clone(&file_state))),
        defaults.clone(),
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/file/chunked/upload/chunk"),
        Arc::new(ChunkedUploadChunkHandler::new(Arc::clone(&file_state))),
        chunk_body,
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/file/chunked/upload/finish"),
        Arc::new(ChunkedUploadFinishHandler::new(Arc::clone(&file_state))),
        defaults.clone(),
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/file/chunked/upload/abort"),
        Arc::new(ChunkedUploadAbortHandler::new(Arc::clone(&file_state))),
        defaults.clone(),
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/file/chunked/download"),
        Arc::new(ChunkedDownloadHandler::new(Arc::clone(&file_state))),
        defaults.clone(),
    )?;
    router.add(
        Method::Get,
        &format!("{API_PREFIX}/file/chunked/download"),
        Arc::new(ChunkedDownloadHandler::new(Arc::clone(&file_state))),
        defaults.clone(),
    )?;
    router.add(
        Method::Post,
        &format!("{API_PREFIX}/service/control"),
        Arc::new(ServiceControlHandler),
        defaults,
    )?;

    info!(routes = router.len(), "built-in handlers registered");
    Ok(())
}
