//! JSON envelope wrapped inside every HTTP body.
//!
//! Requests carry `{version, action?, params?, timeout?}` plus
//! handler-interpreted keys at the top level; responses carry
//! `{version, code, message, data, timestamp}`. Business failures are
//! expressed as a non-zero `code` over HTTP 200 so tooling never confuses
//! transport success with business success.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::PROTOCOL_VERSION;
use crate::error::{Error, ErrorCode, Result};
use crate::protocol::{HttpRequest, HttpResponse};

/// Correlation header, generated by the client and echoed by the server.
pub const HEADER_REQUEST_ID: &str = "X-Request-ID";

/// Advisory client-side send timestamp (Unix seconds).
pub const HEADER_TIMESTAMP: &str = "X-Timestamp";

/// Advisory server-side handler duration (milliseconds).
pub const HEADER_RESPONSE_TIME: &str = "X-Response-Time";

// =============================================================================
// Response Envelope
// =============================================================================

/// The JSON wrapper in every response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(default = "default_version")]
    pub version: String,
    /// 0 = success; see the error-code taxonomy.
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
}

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl ResponseEnvelope {
    /// Success envelope with a handler payload. A top-level `message`
    /// string in the payload is hoisted into the envelope's `message`
    /// field (so ping answers "pong" at the envelope level).
    #[must_use]
    pub fn success(mut data: Value) -> Self {
        let mut message = ErrorCode::Success.default_message().to_string();
        if let Some(map) = data.as_object_mut() {
            if matches!(map.get("message"), Some(Value::String(_))) {
                if let Some(Value::String(s)) = map.remove("message") {
                    message = s;
                }
            }
        }
        Self {
            version: default_version(),
            code: ErrorCode::Success.code(),
            message,
            data,
            timestamp: unix_timestamp(),
        }
    }

    /// Error envelope for a handler or protocol failure.
    #[must_use]
    pub fn failure(err: &Error) -> Self {
        Self {
            version: default_version(),
            code: err.code().code(),
            message: err.to_string(),
            data: err.envelope_data(),
            timestamp: unix_timestamp(),
        }
    }

    /// True when the envelope reports business success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.code == ErrorCode::Success.code()
    }

    /// Serializes the envelope into an HTTP response. The status derives
    /// from the code's protocol class; business errors stay 200.
    #[must_use]
    pub fn into_http(self, request_id: Option<&str>) -> HttpResponse {
        let status = ErrorCode::from_code(self.code).map_or(200, ErrorCode::http_status);
        let body = serde_json::to_vec(&self).unwrap_or_else(|_| {
            br#"{"version":"1.0","code":5001,"message":"serialization failed"}"#.to_vec()
        });
        let mut resp = HttpResponse::new(status).with_json_body(body);
        if let Some(id) = request_id {
            resp.headers.set(HEADER_REQUEST_ID, id);
        }
        resp
    }

    /// Parses an envelope out of a received HTTP response body.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` when the body is not a valid envelope.
    pub fn from_http(resp: &HttpResponse) -> Result<Self> {
        serde_json::from_slice(&resp.body)
            .map_err(|e| Error::Malformed(format!("invalid response envelope: {e}")))
    }

    /// Converts a non-success envelope into the error the host client
    /// surfaces. Success envelopes pass through.
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(Error::Remote {
            code: ErrorCode::from_code(self.code).unwrap_or(ErrorCode::InternalError),
            message: self.message,
            data: self.data,
        })
    }
}

// =============================================================================
// Request Body
// =============================================================================

/// Decoded request body with the envelope keys split out.
#[derive(Debug, Clone, Default)]
pub struct RequestBody {
    /// Envelope version, when the caller sent one.
    pub version: Option<String>,
    /// Handler-interpreted action tag.
    pub action: Option<String>,
    /// Caller-requested handler timeout in seconds, bounded by server
    /// policy before use.
    pub timeout: Option<u64>,
    /// Handler parameters: the `params` object when present, otherwise the
    /// top-level body minus the reserved envelope keys.
    pub params: Map<String, Value>,
}

impl RequestBody {
    /// Decodes a request body. Empty bodies become empty params.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` when the body is not a JSON object.
    pub fn decode(body: &[u8]) -> Result<Self> {
        if body.is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_slice(body)
            .map_err(|e| Error::Malformed(format!("invalid JSON body: {e}")))?;
        let Value::Object(mut map) = value else {
            return Err(Error::Malformed("request body must be a JSON object".into()));
        };

        let version = take_string(&mut map, "version");
        let action = take_string(&mut map, "action");
        let timeout = match map.remove("timeout") {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_u64(),
            Some(_) => return Err(Error::InvalidParams("timeout must be an integer".into())),
        };

        let params = match map.remove("params") {
            Some(Value::Object(p)) => p,
            None | Some(Value::Null) => map,
            Some(_) => return Err(Error::InvalidParams("params must be an object".into())),
        };

        Ok(Self {
            version,
            action,
            timeout,
            params,
        })
    }

    /// Deserializes the params into a typed handler schema.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParams` naming the offending field.
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.params.clone()))
            .map_err(|e| Error::InvalidParams(e.to_string()))
    }

    /// Fetches a required string parameter.
    ///
    /// # Errors
    ///
    /// Returns `MissingRequired` when absent or not a string.
    pub fn require_str(&self, key: &'static str) -> Result<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or(Error::MissingRequired(key))
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Current Unix time in whole seconds.
#[must_use]
pub fn unix_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Generates a fresh request ID.
#[must_use]
pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Builds an outbound request carrying an envelope body and correlation
/// headers.
#[must_use]
pub fn build_request(
    method: crate::protocol::Method,
    path: &str,
    body: Option<&Value>,
    request_id: &str,
) -> HttpRequest {
    let mut req = match body {
        Some(value) => HttpRequest::new(method, path)
            .with_json_body(serde_json::to_vec(value).unwrap_or_default()),
        None => HttpRequest::new(method, path),
    };
    req.headers.set(HEADER_REQUEST_ID, request_id);
    req.headers.set(HEADER_TIMESTAMP, unix_timestamp().to_string());
    req
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn payload_message_is_hoisted() {
        let env = ResponseEnvelope::success(json!({
            "message": "pong",
            "timestamp": 1,
            "uptime": 2,
        }));
        assert_eq!(env.message, "pong");
        assert!(env.data.get("message").is_none());
        assert_eq!(env.data["uptime"], 2);
    }

    #[test]
    fn envelope_round_trip() {
        let env = ResponseEnvelope::success(json!({"timestamp": 1, "uptime": 2}));
        let bytes = serde_json::to_vec(&env).unwrap();
        let back: ResponseEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn failure_envelope_carries_taxonomy() {
        let err = Error::EndpointNotFound {
            method: "GET".into(),
            path: "/api/v1/nope".into(),
        };
        let env = ResponseEnvelope::failure(&err);
        assert_eq!(env.code, 3001);
        assert_eq!(env.data["error_type"], "ENDPOINT_NOT_FOUND");
        assert_eq!(env.into_http(Some("r1")).status, 404);
    }

    #[test]
    fn business_failure_is_http_200() {
        let err = Error::CmdTimeout { timeout_secs: 1 };
        let env = ResponseEnvelope::failure(&err);
        assert_eq!(env.code, 1002);
        assert_eq!(env.into_http(None).status, 200);
    }

    #[test]
    fn flat_body_params() {
        let body = RequestBody::decode(br#"{"command":"sleep 10","timeout":1}"#).unwrap();
        assert_eq!(body.timeout, Some(1));
        assert_eq!(body.params["command"], "sleep 10");
        assert!(!body.params.contains_key("timeout"));
    }

    #[test]
    fn nested_params_object_wins() {
        let body =
            RequestBody::decode(br#"{"version":"1.0","action":"start","params":{"name":"sshd"}}"#)
                .unwrap();
        assert_eq!(body.action.as_deref(), Some("start"));
        assert_eq!(body.params["name"], "sshd");
    }

    #[test]
    fn non_object_body_is_malformed() {
        assert!(matches!(
            RequestBody::decode(b"[1,2,3]"),
            Err(Error::Malformed(_))
        ));
        assert!(matches!(
            RequestBody::decode(b"{not json"),
            Err(Error::Malformed(_))
        ));
    }

    #[test]
    fn empty_body_is_empty_params() {
        let body = RequestBody::decode(b"").unwrap();
        assert!(body.params.is_empty());
        assert!(body.timeout.is_none());
    }

    #[test]
    fn remote_error_surfaces_code() {
        let env = ResponseEnvelope {
            version: "1.0".into(),
            code: 4001,
            message: "permission denied".into(),
            data: json!({"error_type": "PERMISSION_DENIED"}),
            timestamp: 0,
        };
        let err = env.into_result().unwrap_err();
        assert!(matches!(
            err,
            Error::Remote {
                code: ErrorCode::PermissionDenied,
                ..
            }
        ));
    }
}
