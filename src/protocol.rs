//! HTTP/1.1 wire codec.
//!
//! The transport speaks a deliberately narrow HTTP/1.1 subset:
//!
//! - Methods: `GET` and `POST`.
//! - Bodies framed by an exact `Content-Length`; `Transfer-Encoding` is
//!   rejected outright.
//! - One request/response pair at a time; the channel itself is persistent
//!   so no keep-alive negotiation exists.
//!
//! # Wire Format
//!
//! ```text
//! Host                                  Guest
//!   |                                     |
//!   |  POST /api/v1/ping HTTP/1.1\r\n     |
//!   |  Content-Length: 0\r\n              |
//!   |  X-Request-ID: <uuid>\r\n           |
//!   |  \r\n                               |
//!   |------------------------------------>|
//!   |                                     |
//!   |  HTTP/1.1 200 OK\r\n                |
//!   |  Content-Length: NN\r\n             |
//!   |  X-Request-ID: <uuid>\r\n           |
//!   |  \r\n{"version":"1.0","code":0,...} |
//!   |<------------------------------------|
//! ```
//!
//! Reason phrases are advisory; peers act on the numeric status only.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::channel::{Channel, Deadline};
use crate::constants::MAX_HEADER_BYTES;
use crate::error::{Error, Result};

/// Header block terminator.
const HEADER_END: &[u8] = b"\r\n\r\n";

/// The only HTTP version the codec accepts.
const HTTP_VERSION: &str = "HTTP/1.1";

// =============================================================================
// Method
// =============================================================================

/// Supported request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    /// Wire spelling.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }

    /// Parses a start-line token.
    ///
    /// # Errors
    ///
    /// Returns `Malformed` for any method outside the subset.
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            other => Err(Error::Malformed(format!("unsupported method: {other}"))),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Headers
// =============================================================================

/// Ordered header map with case-insensitive lookup and canonicalized
/// serialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Case-insensitive single-value lookup.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Number of headers with this name. Used to reject duplicates where the
    /// subset demands exactly one.
    #[must_use]
    pub fn count(&self, name: &str) -> usize {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .count()
    }

    /// Replaces any existing value for `name`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
        {
            entry.1 = value;
        } else {
            self.entries.push((name.to_string(), value));
        }
    }

    /// Appends without replacing. Parsing uses this so duplicates remain
    /// observable.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Serializes all entries as `Canonical-Name: value\r\n` lines.
    fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(canonical(name).as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Canonical header capitalization: first letter of each hyphen-separated
/// segment uppercased, the rest lowered. `x-request-id` → `X-Request-Id`.
fn canonical(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, seg) in name.split('-').enumerate() {
        if i > 0 {
            out.push('-');
        }
        let mut chars = seg.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.extend(chars.flat_map(char::to_lowercase));
        }
    }
    out
}

// =============================================================================
// Request
// =============================================================================

/// A parsed or to-be-serialized HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    /// Raw path including any query string.
    pub path: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// Creates a bodyless request.
    #[must_use]
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Attaches a JSON body and the matching content type.
    #[must_use]
    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .set("Content-Type", "application/json; charset=utf-8");
        self.body = body;
        self
    }

    /// Path with the query string stripped.
    #[must_use]
    pub fn route_path(&self) -> &str {
        self.path.split('?').next().unwrap_or(&self.path)
    }

    /// Serializes the full message. `Content-Length` and `Host` are always
    /// emitted; caller-set headers are preserved.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut headers = self.headers.clone();
        if headers.get("Host").is_none() {
            headers.set("Host", "virtio-rpc");
        }
        headers.set("Content-Length", self.body.len().to_string());

        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(
            format!("{} {} {HTTP_VERSION}\r\n", self.method.as_str(), self.path).as_bytes(),
        );
        headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

// =============================================================================
// Response
// =============================================================================

/// A parsed or to-be-serialized HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Advisory reason phrase; peers key off `status`.
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Creates a response with the standard reason for `status`.
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            reason: status_text(status).to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    /// Attaches a JSON body and the matching content type.
    #[must_use]
    pub fn with_json_body(mut self, body: Vec<u8>) -> Self {
        self.headers
            .set("Content-Type", "application/json; charset=utf-8");
        self.body = body;
        self
    }

    /// Serializes the full message with an exact `Content-Length`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut headers = self.headers.clone();
        headers.set("Content-Length", self.body.len().to_string());

        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(format!("{HTTP_VERSION} {} {}\r\n", self.status, self.reason).as_bytes());
        headers.write_to(&mut out);
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// Reason phrases for the statuses the transport emits.
fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

// =============================================================================
// Parsing
// =============================================================================

/// Request head: everything known before the body is read. The server
/// resolves the route from this, applies the route's body cap, then decides
/// whether to read or drain the body.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub headers: Headers,
    pub content_length: usize,
}

/// Reads and parses one request head off the channel.
///
/// # Errors
///
/// `Oversize` when the header block exceeds [`MAX_HEADER_BYTES`],
/// `Malformed` on start-line/header faults, duplicate `Content-Length`, or
/// any `Transfer-Encoding` header.
pub async fn read_request_head<S>(
    channel: &mut Channel<S>,
    deadline: Deadline,
) -> Result<RequestHead>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let block = channel
        .read_until(HEADER_END, MAX_HEADER_BYTES, deadline)
        .await?;
    let (start, headers) = parse_header_block(&block)?;

    let mut parts = start.split(' ');
    let method = Method::parse(parts.next().unwrap_or_default())?;
    let path = parts
        .next()
        .filter(|p| p.starts_with('/'))
        .ok_or_else(|| Error::Malformed("request line missing path".into()))?
        .to_string();
    match parts.next() {
        Some(HTTP_VERSION) => {}
        Some(other) => {
            return Err(Error::Malformed(format!("unsupported version: {other}")));
        }
        None => return Err(Error::Malformed("request line missing version".into())),
    }

    let content_length = framing_length(&headers)?;
    Ok(RequestHead {
        method,
        path,
        headers,
        content_length,
    })
}

/// Reads exactly the declared body after a head, enforcing `max_body`.
///
/// # Errors
///
/// `Oversize` before any allocation when the declared length exceeds
/// `max_body`.
pub async fn read_body<S>(
    channel: &mut Channel<S>,
    content_length: usize,
    max_body: usize,
    deadline: Deadline,
) -> Result<Vec<u8>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    if content_length > max_body {
        return Err(Error::Oversize {
            size: content_length,
            limit: max_body,
        });
    }
    if content_length == 0 {
        return Ok(Vec::new());
    }
    channel.read_exact(content_length, deadline).await
}

/// Reads and parses one full response off the channel.
///
/// # Errors
///
/// `Malformed` on status-line/header faults; `Oversize` when the header
/// block or declared body exceeds its bound.
pub async fn read_response<S>(
    channel: &mut Channel<S>,
    max_body: usize,
    deadline: Deadline,
) -> Result<HttpResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let block = channel
        .read_until(HEADER_END, MAX_HEADER_BYTES, deadline)
        .await?;
    let (start, headers) = parse_header_block(&block)?;

    let mut parts = start.splitn(3, ' ');
    match parts.next() {
        Some(HTTP_VERSION) => {}
        other => {
            return Err(Error::Malformed(format!(
                "bad status line: {}",
                other.unwrap_or_default()
            )));
        }
    }
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| Error::Malformed("status line missing code".into()))?;
    let reason = parts.next().unwrap_or_default().to_string();

    let content_length = framing_length(&headers)?;
    let body = read_body(channel, content_length, max_body, deadline).await?;

    Ok(HttpResponse {
        status,
        reason,
        headers,
        body,
    })
}

/// Splits a header block (including trailing `\r\n\r\n`) into the start line
/// and parsed headers.
fn parse_header_block(block: &[u8]) -> Result<(String, Headers)> {
    let text = std::str::from_utf8(block)
        .map_err(|_| Error::Malformed("header block is not UTF-8".into()))?;
    let text = text
        .strip_suffix("\r\n\r\n")
        .ok_or_else(|| Error::Malformed("header block missing terminator".into()))?;

    let mut lines = text.split("\r\n");
    let start = lines
        .next()
        .filter(|l| !l.is_empty())
        .ok_or_else(|| Error::Malformed("empty start line".into()))?
        .to_string();

    let mut headers = Headers::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::Malformed(format!("bad header line: {line}")))?;
        if name.is_empty() || name.contains(' ') {
            return Err(Error::Malformed(format!("bad header name: {name}")));
        }
        headers.append(name, value.trim());
    }
    Ok((start, headers))
}

/// Extracts the body length from headers, enforcing the framing subset:
/// at most one `Content-Length`, no `Transfer-Encoding` of any kind.
fn framing_length(headers: &Headers) -> Result<usize> {
    if headers.count("Transfer-Encoding") > 0 {
        return Err(Error::Malformed("transfer encoding not supported".into()));
    }
    match headers.count("Content-Length") {
        0 => Ok(0),
        1 => headers
            .get("Content-Length")
            .unwrap_or("0")
            .parse()
            .map_err(|_| Error::Malformed("invalid Content-Length".into())),
        _ => Err(Error::Malformed("duplicate Content-Length".into())),
    }
}
