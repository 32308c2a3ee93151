//! Host-side RPC client.
//!
//! [`RpcClient`] gives local callers a synchronous-feeling request API over
//! the guest channel. Exactly one request is in flight at a time: an
//! internal mutex serializes concurrent callers, and a response whose
//! `X-Request-ID` does not match the pending request tears the channel down
//! so the next request starts clean.
//!
//! Transport faults retry with exponential backoff; envelope errors (the
//! guest answered, but with a non-zero code) never retry and surface as
//! [`Error::Remote`].

use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::constants::{API_PREFIX, DEFAULT_CHUNK_SIZE};
use crate::envelope::{build_request, generate_request_id, ResponseEnvelope, HEADER_REQUEST_ID};
use crate::error::{Error, Result};
use crate::protocol::Method;

mod connection;

use connection::Connection;

// =============================================================================
// Typed Responses
// =============================================================================

/// `shell/exec` result payload.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub truncated: bool,
}

/// `file/upload` / chunked-upload-finish result payload.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct UploadResult {
    pub path: String,
    pub size: u64,
    pub md5: String,
}

/// Local outcome of a verified download.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub path: String,
    pub size: u64,
    pub md5: String,
}

// =============================================================================
// Client
// =============================================================================

/// Host RPC client over the virtio-serial UNIX domain socket.
pub struct RpcClient {
    config: HostConfig,
    conn: Mutex<Option<Connection>>,
}

impl RpcClient {
    /// Creates a disconnected client; the first request connects (or call
    /// [`RpcClient::connect`] eagerly).
    #[must_use]
    pub fn new(config: HostConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
        }
    }

    /// Opens the channel. Idempotent: an already-connected client returns
    /// success.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` when the socket path is absent or dead.
    pub async fn connect(&self) -> Result<()> {
        let mut slot = self.conn.lock().await;
        if slot.is_none() {
            *slot = Some(Connection::connect(&self.config).await?);
        }
        Ok(())
    }

    /// Closes the channel. A later request reconnects when
    /// `auto_reconnect` is set, otherwise fails with `NotConnected`.
    pub async fn disconnect(&self) {
        let mut slot = self.conn.lock().await;
        if slot.take().is_some() {
            info!("disconnected");
        }
    }

    /// Sends one request and returns the decoded envelope. Concurrent
    /// callers are serialized; transport faults retry per the configured
    /// policy; a non-zero envelope code returns [`Error::Remote`] without
    /// retrying.
    ///
    /// # Errors
    ///
    /// Transport errors after retry exhaustion, `Malformed` for an
    /// undecodable response, `Remote` for guest-reported failures.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        let mut slot = self.conn.lock().await;
        let mut interval = self.config.retry_interval;
        let mut attempt = 0u32;

        loop {
            match self
                .attempt(&mut slot, method, path, body.as_ref(), timeout)
                .await
            {
                Ok(envelope) => return envelope.into_result(),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        error = %e,
                        attempt,
                        max = self.config.max_retries,
                        backoff_secs = interval.as_secs_f64(),
                        "request failed, retrying"
                    );
                    *slot = None;
                    tokio::time::sleep(interval).await;
                    interval = interval.mul_f64(self.config.backoff_factor.max(1.0));
                }
                Err(e) => {
                    if e.is_retryable() {
                        *slot = None;
                    }
                    return Err(e);
                }
            }
        }
    }

    /// One wire attempt: ensure a connection, write, read, correlate.
    async fn attempt(
        &self,
        slot: &mut Option<Connection>,
        method: Method,
        path: &str,
        body: Option<&Value>,
        timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope> {
        if slot.is_none() {
            if !self.config.auto_reconnect {
                return Err(Error::NotConnected);
            }
            *slot = Some(Connection::connect(&self.config).await?);
        }
        let conn = slot.as_mut().expect("connection just ensured");

        let request_id = generate_request_id();
        let request = build_request(method, path, body, &request_id);
        debug!(method = %method, path, request_id = %request_id, "sending request");

        let response = conn.round_trip(&request, timeout).await?;

        // Stale bytes from an abandoned exchange cannot be resynchronized
        // on a stream; a correlation mismatch invalidates the channel.
        if let Some(echoed) = response.headers.get(HEADER_REQUEST_ID) {
            if echoed != request_id {
                *slot = None;
                return Err(Error::ConnectionLost(format!(
                    "response correlation mismatch: sent {request_id}, got {echoed}"
                )));
            }
        }

        ResponseEnvelope::from_http(&response)
    }

    /// Extracts and deserializes the `data` payload of a success envelope.
    fn decode_data<T: DeserializeOwned>(envelope: ResponseEnvelope) -> Result<T> {
        serde_json::from_value(envelope.data)
            .map_err(|e| Error::Malformed(format!("unexpected response data: {e}")))
    }

    // =========================================================================
    // Convenience Methods
    // =========================================================================

    /// `GET /api/v1/ping`; returns the guest's reported uptime seconds.
    ///
    /// # Errors
    ///
    /// Transport or remote errors from the underlying request.
    pub async fn ping(&self) -> Result<u64> {
        let envelope = self
            .request(Method::Get, &format!("{API_PREFIX}/ping"), None, None)
            .await?;
        Ok(envelope
            .data
            .get("uptime")
            .and_then(Value::as_u64)
            .unwrap_or(0))
    }

    /// `GET /api/v1/system/info`.
    ///
    /// # Errors
    ///
    /// Transport or remote errors from the underlying request.
    pub async fn system_info(&self) -> Result<Value> {
        let envelope = self
            .request(Method::Get, &format!("{API_PREFIX}/system/info"), None, None)
            .await?;
        Ok(envelope.data)
    }

    /// `GET /api/v1/system/status`.
    ///
    /// # Errors
    ///
    /// Transport or remote errors from the underlying request.
    pub async fn system_status(&self) -> Result<Value> {
        let envelope = self
            .request(
                Method::Get,
                &format!("{API_PREFIX}/system/status"),
                None,
                None,
            )
            .await?;
        Ok(envelope.data)
    }

    /// `POST /api/v1/shell/exec`.
    ///
    /// # Errors
    ///
    /// `Remote` with the guest's code for policy rejections and command
    /// failures; transport errors otherwise.
    pub async fn exec_command(
        &self,
        command: &str,
        timeout_secs: u64,
        working_dir: Option<&str>,
        env: Option<&Map<String, Value>>,
    ) -> Result<ExecResult> {
        let mut body = json!({
            "command": command,
            "timeout": timeout_secs,
        });
        if let Some(dir) = working_dir {
            body["working_dir"] = json!(dir);
        }
        if let Some(env) = env {
            body["env"] = Value::Object(env.clone());
        }
        // Give the wire a margin over the handler's own budget.
        let wire_timeout = Duration::from_secs(timeout_secs + 5).max(self.config.read_timeout);
        let envelope = self
            .request(
                Method::Post,
                &format!("{API_PREFIX}/shell/exec"),
                Some(body),
                Some(wire_timeout),
            )
            .await?;
        Self::decode_data(envelope)
    }

    /// Uploads a local file in one message and verifies the reported MD5.
    ///
    /// # Errors
    ///
    /// `FileNotFound` for a missing local file, `Malformed` on an MD5
    /// mismatch, remote/transport errors otherwise.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<UploadResult> {
        let content = tokio::fs::read(local)
            .await
            .map_err(|_| Error::FileNotFound(format!("local file not found: {}", local.display())))?;
        let local_md5 = md5_hex(&content);

        let body = json!({
            "path": remote,
            "content": BASE64.encode(&content),
        });
        let envelope = self
            .request(
                Method::Post,
                &format!("{API_PREFIX}/file/upload"),
                Some(body),
                None,
            )
            .await?;
        let result: UploadResult = Self::decode_data(envelope)?;

        if !result.md5.eq_ignore_ascii_case(&local_md5) {
            return Err(Error::Malformed(format!(
                "upload verification failed: local {local_md5}, remote {}",
                result.md5
            )));
        }
        Ok(result)
    }

    /// Uploads a large local file through a chunked session, verifying the
    /// whole-file MD5 on finish. A failure aborts the session best-effort.
    ///
    /// # Errors
    ///
    /// `FileNotFound` for a missing local file; remote/transport errors
    /// otherwise.
    pub async fn chunked_upload_file(&self, local: &Path, remote: &str) -> Result<UploadResult> {
        let meta = tokio::fs::metadata(local)
            .await
            .map_err(|_| Error::FileNotFound(format!("local file not found: {}", local.display())))?;

        let init = self
            .request(
                Method::Post,
                &format!("{API_PREFIX}/file/chunked/upload/init"),
                Some(json!({"path": remote, "size": meta.len()})),
                None,
            )
            .await?;
        let session_id = init.data["session_id"]
            .as_str()
            .ok_or_else(|| Error::Malformed("upload init returned no session_id".into()))?
            .to_string();
        let chunk_size = init.data["chunk_size"]
            .as_u64()
            .map_or(DEFAULT_CHUNK_SIZE, |n| n as usize)
            .clamp(1, crate::constants::MAX_CHUNK);

        match self
            .stream_chunks(local, remote, &session_id, chunk_size)
            .await
        {
            Ok(result) => Ok(result),
            Err(e) => {
                let _ = self
                    .request(
                        Method::Post,
                        &format!("{API_PREFIX}/file/chunked/upload/abort"),
                        Some(json!({"session_id": session_id})),
                        None,
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn stream_chunks(
        &self,
        local: &Path,
        remote: &str,
        session_id: &str,
        chunk_size: usize,
    ) -> Result<UploadResult> {
        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|_| Error::FileNotFound(format!("local file not found: {}", local.display())))?;
        let mut hasher = Md5::new();
        let mut buf = vec![0u8; chunk_size];
        let mut chunk_index = 0u32;

        loop {
            let n = read_full(&mut file, &mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            self.request(
                Method::Post,
                &format!("{API_PREFIX}/file/chunked/upload/chunk"),
                Some(json!({
                    "session_id": session_id,
                    "chunk_index": chunk_index,
                    "content": BASE64.encode(&buf[..n]),
                })),
                None,
            )
            .await?;
            debug!(remote, chunk_index, bytes = n, "chunk uploaded");
            chunk_index += 1;
        }

        let local_md5 = format!("{:x}", hasher.finalize());
        let finish = self
            .request(
                Method::Post,
                &format!("{API_PREFIX}/file/chunked/upload/finish"),
                Some(json!({"session_id": session_id, "md5": local_md5})),
                None,
            )
            .await?;
        Self::decode_data(finish)
    }

    /// Downloads a remote file, choosing direct or chunked transfer by
    /// size, verifying each chunk's MD5 and the assembled file.
    ///
    /// # Errors
    ///
    /// `Remote` for guest-side failures (missing file, policy), `Malformed`
    /// on any MD5 mismatch.
    pub async fn download_file(&self, remote: &str, local: &Path) -> Result<DownloadResult> {
        let info = self.file_info(remote).await?;
        if !info.get("exists").and_then(Value::as_bool).unwrap_or(false) {
            return Err(Error::FileNotFound(format!("remote file not found: {remote}")));
        }
        let total_size = info.get("size").and_then(Value::as_u64).unwrap_or(0);
        let expected_md5 = info.get("md5").and_then(Value::as_str).map(str::to_string);

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("failed to create {}: {e}", parent.display())))?;
        }

        // Small files go in one message; larger ones walk the chunk loop.
        if total_size <= DEFAULT_CHUNK_SIZE as u64 {
            let envelope = self
                .request(
                    Method::Post,
                    &format!("{API_PREFIX}/file/download"),
                    Some(json!({"path": remote})),
                    None,
                )
                .await?;
            let content = BASE64
                .decode(envelope.data["content"].as_str().unwrap_or_default())
                .map_err(|e| Error::Malformed(format!("invalid content: {e}")))?;
            let local_md5 = md5_hex(&content);
            if let Some(remote_md5) = envelope.data["md5"].as_str() {
                if !remote_md5.eq_ignore_ascii_case(&local_md5) {
                    return Err(Error::Malformed(format!(
                        "download verification failed: remote {remote_md5}, local {local_md5}"
                    )));
                }
            }
            tokio::fs::write(local, &content)
                .await
                .map_err(|e| Error::Internal(format!("failed to write {}: {e}", local.display())))?;
            info!(remote, local = %local.display(), size = content.len(), "download complete");
            return Ok(DownloadResult {
                path: local.display().to_string(),
                size: content.len() as u64,
                md5: local_md5,
            });
        }

        let mut file = tokio::fs::File::create(local)
            .await
            .map_err(|e| Error::Internal(format!("failed to create {}: {e}", local.display())))?;
        let mut hasher = Md5::new();
        let mut offset = 0u64;

        loop {
            let envelope = self
                .request(
                    Method::Post,
                    &format!("{API_PREFIX}/file/chunked/download"),
                    Some(json!({
                        "path": remote,
                        "offset": offset,
                        "size": DEFAULT_CHUNK_SIZE,
                    })),
                    None,
                )
                .await?;
            let data = envelope.data;

            let chunk = BASE64
                .decode(data["content"].as_str().unwrap_or_default())
                .map_err(|e| Error::Malformed(format!("invalid chunk content: {e}")))?;
            if let Some(chunk_md5) = data["chunk_md5"].as_str() {
                if !chunk_md5.eq_ignore_ascii_case(&md5_hex(&chunk)) {
                    return Err(Error::Malformed(format!(
                        "chunk MD5 mismatch at offset {offset}"
                    )));
                }
            }

            file.write_all(&chunk)
                .await
                .map_err(|e| Error::Internal(format!("failed to write {}: {e}", local.display())))?;
            hasher.update(&chunk);
            offset += chunk.len() as u64;

            if !data["has_more"].as_bool().unwrap_or(false) {
                break;
            }
        }
        file.flush()
            .await
            .map_err(|e| Error::Internal(format!("failed to flush {}: {e}", local.display())))?;

        let local_md5 = format!("{:x}", hasher.finalize());
        if let Some(expected) = expected_md5 {
            if !expected.eq_ignore_ascii_case(&local_md5) {
                return Err(Error::Malformed(format!(
                    "download verification failed: remote {expected}, local {local_md5}"
                )));
            }
        }
        if total_size != offset {
            warn!(
                remote,
                expected = total_size,
                received = offset,
                "download size changed mid-transfer"
            );
        }

        info!(remote, local = %local.display(), size = offset, "download complete");
        Ok(DownloadResult {
            path: local.display().to_string(),
            size: offset,
            md5: local_md5,
        })
    }

    /// `GET /api/v1/file/info?path=…`.
    ///
    /// # Errors
    ///
    /// Transport or remote errors from the underlying request.
    pub async fn file_info(&self, path: &str) -> Result<Value> {
        let endpoint = format!("{API_PREFIX}/file/info?path={}", percent_encode(path));
        let envelope = self.request(Method::Get, &endpoint, None, None).await?;
        Ok(envelope.data)
    }

    /// `POST /api/v1/service/control`.
    ///
    /// # Errors
    ///
    /// Transport or remote errors from the underlying request.
    pub async fn control_service(&self, name: &str, action: &str) -> Result<Value> {
        let body = json!({"name": name, "action": action});
        let envelope = self
            .request(
                Method::Post,
                &format!("{API_PREFIX}/service/control"),
                Some(body),
                None,
            )
            .await?;
        Ok(envelope.data)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Reads until the buffer is full or EOF; returns bytes read.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file
            .read(&mut buf[filled..])
            .await
            .map_err(|e| Error::Internal(format!("local read failed: {e}")))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Minimal query-component escaping for path values.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
