//! Error types for the RPC transport.
//!
//! Every failure the crate can surface maps to an [`ErrorCode`] carried in
//! the response envelope. Transport-class codes (6xxx) are synthesized on the
//! host side only, when no envelope could be obtained from the guest.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::{json, Value};

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Envelope Error Codes
// =============================================================================

/// Numeric error codes carried in the `code` field of response envelopes.
///
/// `Success` is 0; everything else groups by thousands: 1xxx command
/// execution, 2xxx request shape, 3xxx missing resources, 4xxx access,
/// 5xxx server, 6xxx transport (host-side only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Success = 0,

    CmdExecFailed = 1001,
    CmdTimeout = 1002,
    CmdNotFound = 1003,

    InvalidParams = 2001,
    JsonParseError = 2002,
    MissingRequired = 2003,

    EndpointNotFound = 3001,
    FileNotFound = 3002,

    PermissionDenied = 4001,

    InternalError = 5001,
    ServiceUnavailable = 5002,

    ConnectionLost = 6001,
    ReadTimeout = 6002,
    WriteTimeout = 6003,
    ConnectionRefused = 6004,
}

impl ErrorCode {
    /// Returns the numeric wire value.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Looks up a code received off the wire.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1001 => Some(Self::CmdExecFailed),
            1002 => Some(Self::CmdTimeout),
            1003 => Some(Self::CmdNotFound),
            2001 => Some(Self::InvalidParams),
            2002 => Some(Self::JsonParseError),
            2003 => Some(Self::MissingRequired),
            3001 => Some(Self::EndpointNotFound),
            3002 => Some(Self::FileNotFound),
            4001 => Some(Self::PermissionDenied),
            5001 => Some(Self::InternalError),
            5002 => Some(Self::ServiceUnavailable),
            6001 => Some(Self::ConnectionLost),
            6002 => Some(Self::ReadTimeout),
            6003 => Some(Self::WriteTimeout),
            6004 => Some(Self::ConnectionRefused),
            _ => None,
        }
    }

    /// HTTP status used when the guest serializes this code. Business errors
    /// ride 200; only protocol faults use 4xx/5xx. Transport codes are never
    /// serialized by the guest but map to 500 for completeness.
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::Success | Self::CmdExecFailed | Self::CmdTimeout | Self::CmdNotFound => 200,
            Self::InvalidParams | Self::JsonParseError | Self::MissingRequired => 400,
            Self::EndpointNotFound | Self::FileNotFound => 404,
            Self::PermissionDenied => 403,
            Self::InternalError => 500,
            Self::ServiceUnavailable => 503,
            Self::ConnectionLost
            | Self::ReadTimeout
            | Self::WriteTimeout
            | Self::ConnectionRefused => 500,
        }
    }

    /// Stable identifier used in the `data.error_type` field.
    #[must_use]
    pub fn error_type(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::CmdExecFailed => "CMD_EXEC_FAILED",
            Self::CmdTimeout => "CMD_TIMEOUT",
            Self::CmdNotFound => "CMD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::JsonParseError => "JSON_PARSE_ERROR",
            Self::MissingRequired => "MISSING_REQUIRED",
            Self::EndpointNotFound => "ENDPOINT_NOT_FOUND",
            Self::FileNotFound => "FILE_NOT_FOUND",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::InternalError => "INTERNAL_ERROR",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::ReadTimeout => "READ_TIMEOUT",
            Self::WriteTimeout => "WRITE_TIMEOUT",
            Self::ConnectionRefused => "CONNECTION_REFUSED",
        }
    }

    /// Default human-readable message for the code.
    #[must_use]
    pub fn default_message(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::CmdExecFailed => "command execution failed",
            Self::CmdTimeout => "command execution timeout",
            Self::CmdNotFound => "command not found",
            Self::InvalidParams => "invalid parameters",
            Self::JsonParseError => "JSON parse error",
            Self::MissingRequired => "missing required parameter",
            Self::EndpointNotFound => "endpoint not found",
            Self::FileNotFound => "file not found",
            Self::PermissionDenied => "permission denied",
            Self::InternalError => "internal server error",
            Self::ServiceUnavailable => "service unavailable",
            Self::ConnectionLost => "connection lost",
            Self::ReadTimeout => "read timeout",
            Self::WriteTimeout => "write timeout",
            Self::ConnectionRefused => "connection refused",
        }
    }
}

// =============================================================================
// Crate Error
// =============================================================================

/// Errors that can occur in the RPC transport.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Command Execution Errors
    // =========================================================================
    /// Command ran but the execution machinery failed.
    #[error("command execution failed: {reason}")]
    CmdExecFailed {
        reason: String,
        /// Extra context merged into the envelope `data` object.
        detail: Option<Value>,
    },

    /// Command exceeded its deadline and was killed.
    #[error("command timed out after {timeout_secs}s")]
    CmdTimeout { timeout_secs: u64 },

    /// argv[0] does not resolve to an executable.
    #[error("command not found: {command}")]
    CmdNotFound { command: String },

    // =========================================================================
    // Request Shape Errors
    // =========================================================================
    /// Parameters present but unacceptable.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Body was expected to be JSON and is not, or the HTTP message itself
    /// is malformed.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// A required parameter is absent.
    #[error("missing required parameter: {0}")]
    MissingRequired(&'static str),

    /// Header block or body exceeds its size bound.
    #[error("message exceeds size limit: {size} > {limit} bytes")]
    Oversize { size: usize, limit: usize },

    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// No route matches `(method, path)`.
    #[error("endpoint not found: {method} {path}")]
    EndpointNotFound { method: String, path: String },

    /// Target file (or its parent directory) does not exist.
    #[error("file not found: {0}")]
    FileNotFound(String),

    // =========================================================================
    // Access Errors
    // =========================================================================
    /// Path or command policy rejected the operation.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    // =========================================================================
    // Server Errors
    // =========================================================================
    /// Unexpected failure inside a handler or the server loop.
    #[error("internal error: {0}")]
    Internal(String),

    /// Server is shutting down or the rate limit rejected the request.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Two handlers registered for the same `(method, path)`.
    #[error("duplicate route: {method} {path}")]
    DuplicateRoute { method: String, path: String },

    // =========================================================================
    // Transport Errors (host-side)
    // =========================================================================
    /// Peer went away mid-message; the channel handle is invalid.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Read deadline elapsed; the handle may be retried.
    #[error("read timed out after {0:?}")]
    ReadTimeout(Duration),

    /// Write deadline elapsed.
    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    /// Socket path absent or not accepting connections.
    #[error("connection refused: {path}: {source}")]
    ConnectionRefused {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Client API used before `connect()` with auto-reconnect disabled.
    #[error("not connected")]
    NotConnected,

    /// The guest answered with a non-zero envelope code. Never retried.
    #[error("remote error {code}: {message}", code = .code.code())]
    Remote {
        code: ErrorCode,
        message: String,
        data: Value,
    },
}

impl Error {
    /// Maps this error to its envelope code.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CmdExecFailed { .. } => ErrorCode::CmdExecFailed,
            Self::CmdTimeout { .. } => ErrorCode::CmdTimeout,
            Self::CmdNotFound { .. } => ErrorCode::CmdNotFound,
            Self::InvalidParams(_) | Self::Oversize { .. } => ErrorCode::InvalidParams,
            Self::Malformed(_) => ErrorCode::JsonParseError,
            Self::MissingRequired(_) => ErrorCode::MissingRequired,
            Self::EndpointNotFound { .. } => ErrorCode::EndpointNotFound,
            Self::FileNotFound(_) => ErrorCode::FileNotFound,
            Self::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Self::Internal(_) | Self::DuplicateRoute { .. } => ErrorCode::InternalError,
            Self::ServiceUnavailable(_) => ErrorCode::ServiceUnavailable,
            Self::ConnectionLost(_) => ErrorCode::ConnectionLost,
            Self::ReadTimeout(_) => ErrorCode::ReadTimeout,
            Self::WriteTimeout(_) => ErrorCode::WriteTimeout,
            Self::ConnectionRefused { .. } => ErrorCode::ConnectionRefused,
            Self::NotConnected => ErrorCode::ConnectionLost,
            Self::Remote { code, .. } => *code,
        }
    }

    /// True for failures the host client may retry on a fresh channel.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLost(_)
                | Self::ReadTimeout(_)
                | Self::WriteTimeout(_)
                | Self::ConnectionRefused { .. }
        )
    }

    /// Builds the `data` object for an error envelope:
    /// `{error_type, detail, ...}` with per-variant extras merged in.
    /// The detail is a bounded stringified cause, never a backtrace.
    #[must_use]
    pub fn envelope_data(&self) -> Value {
        let code = self.code();
        let mut data = json!({
            "error_type": code.error_type(),
            "detail": bounded(&self.to_string()),
        });
        match self {
            Self::CmdTimeout { timeout_secs } => {
                data["timeout"] = json!(timeout_secs);
            }
            Self::CmdExecFailed {
                detail: Some(extra),
                ..
            } => {
                if let (Some(obj), Some(extra)) = (data.as_object_mut(), extra.as_object()) {
                    for (k, v) in extra {
                        obj.insert(k.clone(), v.clone());
                    }
                }
            }
            _ => {}
        }
        data
    }

    /// Classifies an I/O failure on an open channel: anything that is not a
    /// timeout means the peer went away and the handle is dead.
    #[must_use]
    pub fn from_channel_io(err: std::io::Error) -> Self {
        Self::ConnectionLost(err.to_string())
    }
}

/// Truncates long causes so handler failures stay small on the wire.
fn bounded(s: &str) -> String {
    const MAX_DETAIL: usize = 512;
    if s.len() <= MAX_DETAIL {
        s.to_string()
    } else {
        let mut end = MAX_DETAIL;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}
