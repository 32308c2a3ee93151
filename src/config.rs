//! Host and guest configuration.
//!
//! Configuration is a plain value passed into the client/server
//! constructors; there is no process-wide mutable state.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_BODY_BYTES,
    DEFAULT_MAX_RETRIES, DEFAULT_READ_TIMEOUT, DEFAULT_RETRY_INTERVAL, DEFAULT_WRITE_TIMEOUT,
    RATE_LIMIT_PER_MINUTE, RATE_LIMIT_PER_SECOND,
};

// =============================================================================
// Host Configuration
// =============================================================================

/// Configuration for the host-side RPC client.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Path of the UNIX domain socket exposed by QEMU/libvirt, typically
    /// `/var/lib/libvirt/qemu/channel/target/domain-<N>-<name>/<port>`.
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    /// Transport-level retries per request; envelope errors never retry.
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub backoff_factor: f64,
    /// When true, a request after `disconnect()` (or a lost channel)
    /// reconnects transparently; when false it fails with `NotConnected`.
    pub auto_reconnect: bool,
}

impl HostConfig {
    /// Creates a config for the given socket path with default timeouts.
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            auto_reconnect: true,
        }
    }

    /// Sets the per-response read timeout.
    #[must_use]
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Sets the transport retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Enables or disables transparent reconnect.
    #[must_use]
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }
}

// =============================================================================
// Guest Configuration
// =============================================================================

/// Optional global token-bucket limits for the guest server.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub per_second: u32,
    pub per_minute: u32,
    /// Concurrent-handler cap. A single channel is strictly sequential, so
    /// this only matters for a multi-channel future; recorded, not enforced
    /// beyond 1.
    pub max_concurrent: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: RATE_LIMIT_PER_SECOND,
            per_minute: RATE_LIMIT_PER_MINUTE,
            max_concurrent: 1,
        }
    }
}

/// Configuration for the guest-side RPC server.
#[derive(Debug, Clone)]
pub struct GuestConfig {
    /// Character device path, e.g. `/dev/virtio-ports/org.qemu.rpc.0`.
    pub device_path: PathBuf,
    /// Channel read buffer size in bytes.
    pub buffer_size: usize,
    /// Global request body cap; routes may set a lower one.
    pub max_request_size: usize,
    /// Default handler timeout for routes that do not override it.
    pub request_timeout: Duration,
    /// Gates `auth_required` routes through the configured [`AuthPolicy`].
    ///
    /// [`AuthPolicy`]: crate::server::AuthPolicy
    pub enable_auth: bool,
    /// Command allow-list for `shell/exec`; empty means the built-in
    /// defaults.
    pub allowed_commands: Vec<String>,
    /// Path prefix allow-list for the file handlers; empty means the
    /// built-in defaults.
    pub allowed_paths: Vec<PathBuf>,
    /// Token-bucket rate limiting; `None` disables it.
    pub rate_limit: Option<RateLimitConfig>,
}

impl GuestConfig {
    /// Creates a config for the given device path with default policy.
    #[must_use]
    pub fn new(device_path: impl Into<PathBuf>) -> Self {
        Self {
            device_path: device_path.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_request_size: DEFAULT_MAX_BODY_BYTES,
            request_timeout: crate::constants::DEFAULT_HANDLER_TIMEOUT,
            enable_auth: false,
            allowed_commands: Vec::new(),
            allowed_paths: Vec::new(),
            rate_limit: None,
        }
    }

    /// Overrides the command allow-list.
    #[must_use]
    pub fn with_allowed_commands<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_commands = commands.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the path allow-list.
    #[must_use]
    pub fn with_allowed_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.allowed_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Enables token-bucket rate limiting with the default budget.
    #[must_use]
    pub fn with_rate_limit(mut self, limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(limit);
        self
    }
}
