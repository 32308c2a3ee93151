//! Policy-gated shell command execution.
//!
//! Commands never pass through a shell: the request's `command` string is
//! split into argv, validated against the allow-list, and spawned with a
//! scrubbed environment. The child is owned by the handler and reaped on
//! every exit path; deadline overrun escalates SIGTERM → SIGKILL.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use crate::constants::{KILL_GRACE_PERIOD, MAX_CAPTURE};
use crate::error::{Error, Result};
use crate::policy::{Access, CommandPolicy, PathPolicy, DEFAULT_PATH_ENV};

use super::{Handler, RequestContext};

// =============================================================================
// Parameters
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExecParams {
    command: String,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

// =============================================================================
// Handler
// =============================================================================

/// `POST /api/v1/shell/exec`.
pub struct ShellExecHandler {
    command_policy: Arc<CommandPolicy>,
    path_policy: Arc<PathPolicy>,
}

impl ShellExecHandler {
    #[must_use]
    pub fn new(command_policy: Arc<CommandPolicy>, path_policy: Arc<PathPolicy>) -> Self {
        Self {
            command_policy,
            path_policy,
        }
    }
}

#[async_trait]
impl Handler for ShellExecHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("command").is_none() {
            return Err(Error::MissingRequired("command"));
        }
        let params: ExecParams = ctx.body.parse_params()?;

        let argv = self.command_policy.validate(&params.command)?;

        let working_dir = match &params.working_dir {
            Some(dir) => {
                let canonical = self.path_policy.check(dir, Access::Read)?;
                if !canonical.is_dir() {
                    return Err(Error::FileNotFound(format!(
                        "working directory not found: {dir}"
                    )));
                }
                Some(canonical)
            }
            None => None,
        };

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Fresh environment: only caller-supplied keys plus a sane PATH.
        cmd.env_clear();
        cmd.envs(&params.env);
        if !params.env.contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH_ENV);
        }
        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::CmdNotFound {
                command: argv[0].clone(),
            },
            _ => Error::CmdExecFailed {
                reason: format!("spawn failed: {e}"),
                detail: None,
            },
        })?;

        // Drain pipes concurrently so a chatty child cannot stall on a full
        // pipe while we wait.
        let stdout_task = capture(child.stdout.take());
        let stderr_task = capture(child.stderr.take());

        let status = match tokio::time::timeout(ctx.deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(Error::CmdExecFailed {
                    reason: format!("wait failed: {e}"),
                    detail: None,
                })
            }
            Err(_) => {
                terminate(&mut child).await;
                return Err(Error::CmdTimeout {
                    timeout_secs: ctx.deadline.as_secs(),
                });
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
        let truncated = stdout_truncated || stderr_truncated;

        let mut data = json!({
            "exit_code": status.code().unwrap_or(-1),
            "stdout": stdout,
            "stderr": stderr,
            "duration_ms": duration_ms,
        });
        if truncated {
            data["truncated"] = json!(true);
        }
        Ok(data)
    }
}

/// Reads a child stream into a bounded buffer on its own task; returns the
/// captured text and whether it was truncated at [`MAX_CAPTURE`].
fn capture<R>(stream: Option<R>) -> tokio::task::JoinHandle<(String, bool)>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let Some(stream) = stream else {
            return (String::new(), false);
        };
        let mut buf = Vec::new();
        let mut limited = stream.take(MAX_CAPTURE as u64 + 1);
        if limited.read_to_end(&mut buf).await.is_err() {
            return (String::from_utf8_lossy(&buf).into_owned(), false);
        }
        let truncated = buf.len() > MAX_CAPTURE;
        buf.truncate(MAX_CAPTURE);
        // Keep draining past the cap so the child never blocks on a full
        // pipe; the extra bytes are discarded.
        let mut inner = limited.into_inner();
        let mut sink = [0u8; 8192];
        while matches!(inner.read(&mut sink).await, Ok(n) if n > 0) {}
        (String::from_utf8_lossy(&buf).into_owned(), truncated)
    })
}

/// SIGTERM, a grace period, then SIGKILL; always reaps the child.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
    if tokio::time::timeout(KILL_GRACE_PERIOD, child.wait())
        .await
        .is_ok()
    {
        return;
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}
