//! Constants for the RPC transport.
//!
//! All limits, timeouts, and wire defaults are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Wire Limits
// =============================================================================

/// Maximum size of an HTTP header block (16 KiB).
/// Bounds the `read_until` scan for the header terminator so a peer cannot
/// stream unbounded garbage before the blank line.
pub const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Default maximum request body size (10 MiB).
/// Routes may lower this; the guest rejects larger bodies before allocating.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Maximum window for a single file chunk transfer (1 MiB).
pub const MAX_CHUNK: usize = 1024 * 1024;

/// Default chunk size used by the host-side chunked upload/download loops.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Protocol version carried in every envelope.
pub const PROTOCOL_VERSION: &str = "1.0";

// =============================================================================
// Channel Defaults
// =============================================================================

/// Default read buffer size for channel endpoints.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default host-side connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default host-side read timeout for one response.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Default host-side write timeout for one request.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Retry / Reconnect
// =============================================================================

/// Default number of transport-level retries per host request.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial retry interval for host requests.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Multiplier applied to the retry interval after each failed attempt.
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

/// Initial guest-side reconnect backoff after a lost channel.
pub const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Ceiling for the guest-side reconnect backoff.
pub const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(30);

// =============================================================================
// Handler Execution
// =============================================================================

/// Hard ceiling on any handler deadline (seconds). The effective deadline is
/// `min(request timeout, route default, MAX_HANDLER_SECONDS)`.
pub const MAX_HANDLER_SECONDS: u64 = 120;

/// Default per-route handler timeout.
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace period between SIGTERM and SIGKILL when a command overruns its
/// deadline.
pub const KILL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Maximum captured bytes for each of a child's stdout and stderr streams.
/// Overflow truncates and flags the response.
pub const MAX_CAPTURE: usize = 1024 * 1024;

// =============================================================================
// File Handlers
// =============================================================================

/// Files larger than this skip MD5 computation in `file/info` (64 MiB).
pub const MD5_CAP: u64 = 64 * 1024 * 1024;

/// Read granularity for streaming MD5 over large files.
pub const MD5_READ_CHUNK: usize = 8 * 1024;

/// Idle lifetime of a chunked-upload session before lazy eviction.
pub const UPLOAD_SESSION_TTL: Duration = Duration::from_secs(3600);

/// Prefix for chunked-upload temp files under the system temp dir.
pub const UPLOAD_TEMP_PREFIX: &str = "virtrpc-upload-";

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket: sustained requests per second.
pub const RATE_LIMIT_PER_SECOND: u32 = 10;

/// Token bucket: sustained requests per minute.
pub const RATE_LIMIT_PER_MINUTE: u32 = 100;

// =============================================================================
// API Paths
// =============================================================================

/// Route prefix for all built-in endpoints.
pub const API_PREFIX: &str = "/api/v1";
