//! File transfer handlers: upload, download, info, and the chunked
//! session endpoints for files too large for one message.
//!
//! Every path argument passes the path policy before any I/O. Content
//! travels base64-encoded; each transfer carries an MD5 so both sides can
//! verify integrity. Chunked uploads accumulate in a temp file and move
//! into place atomically on finish.

use std::collections::HashMap;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::constants::{
    DEFAULT_CHUNK_SIZE, MAX_CHUNK, MD5_CAP, MD5_READ_CHUNK, UPLOAD_SESSION_TTL, UPLOAD_TEMP_PREFIX,
};
use crate::error::{Error, Result};
use crate::policy::{Access, PathPolicy};

use super::{Handler, RequestContext};

// =============================================================================
// Shared State
// =============================================================================

/// State shared by the file handlers: the path policy and the live
/// chunked-upload sessions.
pub struct FileState {
    policy: Arc<PathPolicy>,
    sessions: Mutex<HashMap<String, UploadSession>>,
}

struct UploadSession {
    target: PathBuf,
    temp_path: PathBuf,
    total_size: u64,
    received: u64,
    chunks_received: u32,
    md5: Md5,
    mode: String,
    created_at: Instant,
}

impl FileState {
    #[must_use]
    pub fn new(policy: Arc<PathPolicy>) -> Self {
        Self {
            policy,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Drops sessions idle past their TTL, removing their temp files.
    async fn evict_stale(&self) {
        let stale: Vec<(String, PathBuf)> = {
            let sessions = self.sessions.lock().await;
            sessions
                .iter()
                .filter(|(_, s)| s.created_at.elapsed() > UPLOAD_SESSION_TTL)
                .map(|(id, s)| (id.clone(), s.temp_path.clone()))
                .collect()
        };
        for (id, temp) in stale {
            self.sessions.lock().await.remove(&id);
            let _ = tokio::fs::remove_file(&temp).await;
            tracing::warn!(session_id = %id, "evicted stale upload session");
        }
    }
}

// =============================================================================
// MD5 Helpers
// =============================================================================

/// Hex MD5 of a byte slice.
fn md5_hex(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Streaming hex MD5 of a file.
async fn file_md5(path: &std::path::Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; MD5_READ_CHUNK];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn decode_content(b64: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(b64)
        .map_err(|e| Error::InvalidParams(format!("invalid base64 content: {e}")))
}

fn apply_mode(path: &std::path::Path, mode: &str) {
    match u32::from_str_radix(mode, 8) {
        Ok(bits) => {
            if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(bits)) {
                tracing::warn!(path = %path.display(), error = %e, "failed to set file mode");
            }
        }
        Err(_) => tracing::warn!(mode, "invalid file mode, leaving default"),
    }
}

fn default_mode() -> String {
    "0644".to_string()
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Upload
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UploadParams {
    path: String,
    content: String,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    group: Option<String>,
    #[serde(default = "default_true")]
    overwrite: bool,
}

/// `POST /api/v1/file/upload`: write one base64 blob to an allowed path.
pub struct FileUploadHandler {
    state: Arc<FileState>,
}

impl FileUploadHandler {
    #[must_use]
    pub fn new(state: Arc<FileState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for FileUploadHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("path").is_none() {
            return Err(Error::MissingRequired("path"));
        }
        if ctx.body.params.get("content").is_none() {
            return Err(Error::MissingRequired("content"));
        }
        let params: UploadParams = ctx.body.parse_params()?;

        let target = self.state.policy.check(&params.path, Access::Write)?;
        if target.exists() && !params.overwrite {
            return Err(Error::PermissionDenied(format!(
                "file already exists: {}",
                params.path
            )));
        }

        let content = decode_content(&params.content)?;

        // The parent must already exist; upload does not create directories.
        tokio::fs::write(&target, &content)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    Error::FileNotFound(format!("parent directory missing for {}", params.path))
                }
                _ => Error::PermissionDenied(format!("failed to write file: {e}")),
            })?;

        apply_mode(&target, &params.mode);
        apply_ownership(&target, params.owner.as_deref(), params.group.as_deref());

        Ok(json!({
            "path": target,
            "size": content.len(),
            "md5": md5_hex(&content),
        }))
    }
}

/// Best-effort chown by user/group name; unknown names are logged, not
/// fatal, matching ordinary file-manager semantics for optional metadata.
fn apply_ownership(path: &std::path::Path, owner: Option<&str>, group: Option<&str>) {
    let uid = owner.and_then(|name| match nix::unistd::User::from_name(name) {
        Ok(Some(user)) => Some(user.uid.as_raw()),
        _ => {
            tracing::warn!(owner = name, "user not found");
            None
        }
    });
    let gid = group.and_then(|name| match nix::unistd::Group::from_name(name) {
        Ok(Some(group)) => Some(group.gid.as_raw()),
        _ => {
            tracing::warn!(group = name, "group not found");
            None
        }
    });
    if uid.is_none() && gid.is_none() {
        return;
    }
    if let Err(e) = std::os::unix::fs::chown(path, uid, gid) {
        tracing::warn!(path = %path.display(), error = %e, "failed to set ownership");
    }
}

// =============================================================================
// Download
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DownloadParams {
    path: String,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    length: Option<u64>,
}

/// `POST /api/v1/file/download`: read a window (or the whole) of an allowed
/// file, base64-encoded.
pub struct FileDownloadHandler {
    state: Arc<FileState>,
}

impl FileDownloadHandler {
    #[must_use]
    pub fn new(state: Arc<FileState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for FileDownloadHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("path").is_none() {
            return Err(Error::MissingRequired("path"));
        }
        let params: DownloadParams = ctx.body.parse_params()?;
        let path = self.state.policy.check(&params.path, Access::Read)?;

        let (content, total_size) =
            read_window(&path, params.offset, params.length, &params.path).await?;

        Ok(json!({
            "path": path,
            "content": BASE64.encode(&content),
            "size": content.len(),
            "total_size": total_size,
            "offset": params.offset,
            "md5": md5_hex(&content),
        }))
    }
}

/// Reads `[offset, offset+length)` of a regular file; `None` length means
/// to the end. Explicit lengths are bounded to `[1, MAX_CHUNK]`.
async fn read_window(
    path: &std::path::Path,
    offset: u64,
    length: Option<u64>,
    display: &str,
) -> Result<(Vec<u8>, u64)> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| Error::FileNotFound(format!("file not found: {display}")))?;
    if !meta.is_file() {
        return Err(Error::InvalidParams(format!("not a file: {display}")));
    }
    let total_size = meta.len();
    if offset > total_size {
        return Err(Error::InvalidParams(format!(
            "invalid offset: {offset} (file is {total_size} bytes)"
        )));
    }
    if let Some(len) = length {
        if len == 0 || len > MAX_CHUNK as u64 {
            return Err(Error::InvalidParams(format!(
                "length must be within [1, {MAX_CHUNK}]"
            )));
        }
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Error::PermissionDenied(format!("failed to read file: {e}")))?;
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| Error::PermissionDenied(format!("failed to seek: {e}")))?;
    }

    let want = length
        .unwrap_or(total_size.saturating_sub(offset))
        .min(total_size.saturating_sub(offset));
    let mut content = vec![0u8; want as usize];
    file.read_exact(&mut content)
        .await
        .map_err(|e| Error::PermissionDenied(format!("failed to read file: {e}")))?;
    Ok((content, total_size))
}

// =============================================================================
// Info
// =============================================================================

/// `GET /api/v1/file/info?path=…`: existence, type, size, ownership, and
/// MD5 for regular files under the cap.
pub struct FileInfoHandler {
    state: Arc<FileState>,
}

impl FileInfoHandler {
    #[must_use]
    pub fn new(state: Arc<FileState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for FileInfoHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        let path = ctx.param("path").ok_or(Error::MissingRequired("path"))?;

        // Denied or missing both surface as exists=false so probes cannot
        // map the forbidden tree.
        let canonical = match self.state.policy.check(&path, Access::Read) {
            Ok(canonical) => canonical,
            Err(_) => return Ok(json!({"path": path, "exists": false})),
        };

        // Classify the requested name itself, then stat through it.
        let link_meta = tokio::fs::symlink_metadata(&path).await.ok();
        let Ok(meta) = tokio::fs::metadata(&canonical).await else {
            return Ok(json!({"path": canonical, "exists": false}));
        };

        let file_type = match link_meta.as_ref() {
            Some(m) if m.file_type().is_symlink() => "symlink",
            _ if meta.is_file() => "file",
            _ if meta.is_dir() => "directory",
            _ => "other",
        };

        let owner = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(meta.uid()))
            .ok()
            .flatten()
            .map_or_else(|| meta.uid().to_string(), |u| u.name);
        let group = nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(meta.gid()))
            .ok()
            .flatten()
            .map_or_else(|| meta.gid().to_string(), |g| g.name);

        let mut data = json!({
            "path": canonical,
            "exists": true,
            "type": file_type,
            "size": meta.len(),
            "mode": format!("{:04o}", meta.permissions().mode() & 0o777),
            "owner": owner,
            "group": group,
            "mtime": meta.mtime(),
            "atime": meta.atime(),
            "ctime": meta.ctime(),
        });

        if meta.is_file() && meta.len() <= MD5_CAP {
            if let Ok(md5) = file_md5(&canonical).await {
                data["md5"] = json!(md5);
            }
        }
        Ok(data)
    }
}

// =============================================================================
// Chunked Upload
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChunkedInitParams {
    path: String,
    #[serde(default)]
    size: u64,
    #[serde(default = "default_mode")]
    mode: String,
    #[serde(default = "default_true")]
    overwrite: bool,
}

/// `POST /api/v1/file/chunked/upload/init`: open an upload session.
pub struct ChunkedUploadInitHandler {
    state: Arc<FileState>,
}

impl ChunkedUploadInitHandler {
    #[must_use]
    pub fn new(state: Arc<FileState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for ChunkedUploadInitHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("path").is_none() {
            return Err(Error::MissingRequired("path"));
        }
        let params: ChunkedInitParams = ctx.body.parse_params()?;

        self.state.evict_stale().await;

        let target = self.state.policy.check(&params.path, Access::Write)?;
        if target.exists() && !params.overwrite {
            return Err(Error::PermissionDenied(format!(
                "file already exists: {}",
                params.path
            )));
        }

        let session_id = uuid::Uuid::new_v4().to_string();
        let temp_path = std::env::temp_dir().join(format!("{UPLOAD_TEMP_PREFIX}{session_id}"));
        tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Internal(format!("failed to create temp file: {e}")))?;

        tracing::info!(
            session_id = %session_id,
            target = %target.display(),
            total_size = params.size,
            "chunked upload session created"
        );

        self.state.sessions.lock().await.insert(
            session_id.clone(),
            UploadSession {
                target: target.clone(),
                temp_path,
                total_size: params.size,
                received: 0,
                chunks_received: 0,
                md5: Md5::new(),
                mode: params.mode,
                created_at: Instant::now(),
            },
        );

        Ok(json!({
            "session_id": session_id,
            "chunk_size": DEFAULT_CHUNK_SIZE,
            "path": target,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChunkParams {
    session_id: String,
    #[serde(default)]
    chunk_index: u32,
    content: String,
}

/// `POST /api/v1/file/chunked/upload/chunk`: append one chunk.
pub struct ChunkedUploadChunkHandler {
    state: Arc<FileState>,
}

impl ChunkedUploadChunkHandler {
    #[must_use]
    pub fn new(state: Arc<FileState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for ChunkedUploadChunkHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("session_id").is_none() {
            return Err(Error::MissingRequired("session_id"));
        }
        if ctx.body.params.get("content").is_none() {
            return Err(Error::MissingRequired("content"));
        }
        let params: ChunkParams = ctx.body.parse_params()?;
        let content = decode_content(&params.content)?;
        if content.len() > MAX_CHUNK {
            return Err(Error::InvalidParams(format!(
                "chunk exceeds {MAX_CHUNK} bytes"
            )));
        }

        let mut sessions = self.state.sessions.lock().await;
        let session = sessions
            .get_mut(&params.session_id)
            .ok_or_else(|| Error::InvalidParams(format!("invalid session_id: {}", params.session_id)))?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&session.temp_path)
            .await
            .map_err(|e| Error::Internal(format!("failed to open temp file: {e}")))?;
        file.write_all(&content)
            .await
            .map_err(|e| Error::Internal(format!("failed to write chunk: {e}")))?;

        session.received += content.len() as u64;
        session.chunks_received += 1;
        session.md5.update(&content);

        let progress = if session.total_size > 0 {
            (session.received as f64 / session.total_size as f64 * 100.0).min(100.0)
        } else {
            100.0
        };

        Ok(json!({
            "session_id": params.session_id,
            "chunk_index": params.chunk_index,
            "received_size": session.received,
            "total_size": session.total_size,
            "progress": (progress * 100.0).round() / 100.0,
        }))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FinishParams {
    session_id: String,
    #[serde(default)]
    md5: Option<String>,
}

/// `POST /api/v1/file/chunked/upload/finish`: verify and move into place.
pub struct ChunkedUploadFinishHandler {
    state: Arc<FileState>,
}

impl ChunkedUploadFinishHandler {
    #[must_use]
    pub fn new(state: Arc<FileState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for ChunkedUploadFinishHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("session_id").is_none() {
            return Err(Error::MissingRequired("session_id"));
        }
        let params: FinishParams = ctx.body.parse_params()?;

        // Take the session out first so every exit path below leaves no
        // residue.
        let session = self
            .state
            .sessions
            .lock()
            .await
            .remove(&params.session_id)
            .ok_or_else(|| Error::InvalidParams(format!("invalid session_id: {}", params.session_id)))?;

        let result = finish_session(&session, params.md5.as_deref()).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&session.temp_path).await;
        }
        result
    }
}

async fn finish_session(session: &UploadSession, expected_md5: Option<&str>) -> Result<Value> {
    let actual_md5 = format!("{:x}", session.md5.clone().finalize());
    if let Some(expected) = expected_md5 {
        if !expected.eq_ignore_ascii_case(&actual_md5) {
            return Err(Error::InvalidParams(format!(
                "MD5 mismatch: expected {expected}, got {actual_md5}"
            )));
        }
    }

    move_into_place(&session.temp_path, &session.target).await?;
    apply_mode(&session.target, &session.mode);

    let size = tokio::fs::metadata(&session.target)
        .await
        .map(|m| m.len())
        .unwrap_or(session.received);

    tracing::info!(
        target = %session.target.display(),
        size,
        chunks = session.chunks_received,
        "chunked upload completed"
    );

    Ok(json!({
        "path": session.target,
        "size": size,
        "md5": actual_md5,
        "chunks_received": session.chunks_received,
    }))
}

/// Rename, falling back to copy+unlink when the temp dir sits on a
/// different filesystem than the target.
async fn move_into_place(temp: &std::path::Path, target: &std::path::Path) -> Result<()> {
    match tokio::fs::rename(temp, target).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::FileNotFound(format!(
            "parent directory missing for {}",
            target.display()
        ))),
        Err(_) => {
            tokio::fs::copy(temp, target).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::FileNotFound(format!(
                    "parent directory missing for {}",
                    target.display()
                )),
                _ => Error::PermissionDenied(format!("failed to move upload: {e}")),
            })?;
            let _ = tokio::fs::remove_file(temp).await;
            Ok(())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AbortParams {
    session_id: String,
}

/// `POST /api/v1/file/chunked/upload/abort`: drop a session and its temp
/// file. Unknown sessions are reported, not failed.
pub struct ChunkedUploadAbortHandler {
    state: Arc<FileState>,
}

impl ChunkedUploadAbortHandler {
    #[must_use]
    pub fn new(state: Arc<FileState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for ChunkedUploadAbortHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("session_id").is_none() {
            return Err(Error::MissingRequired("session_id"));
        }
        let params: AbortParams = ctx.body.parse_params()?;

        let Some(session) = self.state.sessions.lock().await.remove(&params.session_id) else {
            return Ok(json!({"message": "session not found or already cleaned up"}));
        };
        let _ = tokio::fs::remove_file(&session.temp_path).await;

        tracing::info!(session_id = %params.session_id, "chunked upload session aborted");
        Ok(json!({
            "message": "upload session aborted",
            "session_id": params.session_id,
        }))
    }
}

// =============================================================================
// Chunked Download
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ChunkedDownloadParams {
    path: String,
    #[serde(default)]
    offset: u64,
    #[serde(default)]
    size: Option<u64>,
}

/// `POST /api/v1/file/chunked/download`: one window of a file with
/// continuation metadata.
pub struct ChunkedDownloadHandler {
    state: Arc<FileState>,
}

impl ChunkedDownloadHandler {
    #[must_use]
    pub fn new(state: Arc<FileState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl Handler for ChunkedDownloadHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("path").is_none() && ctx.query.get("path").is_none() {
            return Err(Error::MissingRequired("path"));
        }
        let params: ChunkedDownloadParams = if !ctx.body.params.contains_key("path") {
            // GET form: parameters arrive in the query string.
            ChunkedDownloadParams {
                path: ctx.query.get("path").cloned().unwrap_or_default(),
                offset: ctx
                    .query
                    .get("offset")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                size: ctx.query.get("size").and_then(|v| v.parse().ok()),
            }
        } else {
            ctx.body.parse_params()?
        };

        let path = self.state.policy.check(&params.path, Access::Read)?;

        let window = params
            .size
            .unwrap_or(DEFAULT_CHUNK_SIZE as u64)
            .clamp(1, MAX_CHUNK as u64);
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| Error::FileNotFound(format!("file not found: {}", params.path)))?;
        if !meta.is_file() {
            return Err(Error::InvalidParams(format!("not a file: {}", params.path)));
        }
        let total_size = meta.len();
        if params.offset > total_size {
            return Err(Error::InvalidParams(format!(
                "invalid offset: {} (file is {total_size} bytes)",
                params.offset
            )));
        }

        let want = window.min(total_size - params.offset);
        let (content, _) = if want == 0 {
            (Vec::new(), total_size)
        } else {
            read_window(&path, params.offset, Some(want), &params.path).await?
        };

        let end = params.offset + content.len() as u64;
        let has_more = end < total_size;

        Ok(json!({
            "path": path,
            "content": BASE64.encode(&content),
            "offset": params.offset,
            "size": content.len(),
            "total_size": total_size,
            "chunk_md5": md5_hex(&content),
            "has_more": has_more,
            "next_offset": if has_more { json!(end) } else { Value::Null },
        }))
    }
}
