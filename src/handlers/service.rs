//! systemd unit control.
//!
//! Actions are a closed enum; unit names are charset-validated before any
//! argv is assembled, so nothing the caller sends can reach a shell. Every
//! mutation is followed by a status probe so the response reflects the
//! unit's actual state, not just the command's exit code.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::error::{Error, Result};

use super::{Handler, RequestContext};

/// Budget for each systemctl probe invocation.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// Parameters
// =============================================================================

/// Permitted unit operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceAction {
    Start,
    Stop,
    Restart,
    Status,
    Enable,
    Disable,
    Reload,
}

impl ServiceAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Status => "status",
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Reload => "reload",
        }
    }
}

fn default_action() -> ServiceAction {
    ServiceAction::Status
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceParams {
    name: String,
    #[serde(default = "default_action")]
    action: ServiceAction,
}

// =============================================================================
// Handler
// =============================================================================

/// `POST /api/v1/service/control`.
pub struct ServiceControlHandler;

#[async_trait]
impl Handler for ServiceControlHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        if ctx.body.params.get("name").is_none() {
            return Err(Error::MissingRequired("name"));
        }
        let params: ServiceParams = ctx.body.parse_params()?;
        validate_unit_name(&params.name)?;

        if params.action == ServiceAction::Status {
            let status = probe_status(&params.name).await;
            return Ok(status);
        }

        let outcome = run_systemctl(
            &[params.action.as_str(), &params.name],
            ctx.deadline,
        )
        .await?;
        let status = probe_status(&params.name).await;

        if outcome.exit_code != 0 {
            return Err(Error::CmdExecFailed {
                reason: format!(
                    "failed to {} service {}",
                    params.action.as_str(),
                    params.name
                ),
                detail: Some(json!({
                    "exit_code": outcome.exit_code,
                    "stderr": outcome.stderr,
                    "status": status,
                })),
            });
        }

        tracing::info!(
            unit = %params.name,
            action = params.action.as_str(),
            "service action completed"
        );

        Ok(json!({
            "name": params.name,
            "action": params.action.as_str(),
            "success": true,
            "status": status["status"],
            "active": status["active"],
            "enabled": status["enabled"],
            "pid": status["pid"],
        }))
    }
}

/// Unit names may carry alphanumerics plus `-`, `_`, `.`, `@`.
fn validate_unit_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(Error::InvalidParams("invalid service name".into()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
    {
        return Err(Error::InvalidParams(format!(
            "invalid service name: {name}"
        )));
    }
    Ok(())
}

// =============================================================================
// systemctl Plumbing
// =============================================================================

struct CommandOutcome {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Runs one systemctl invocation with a bounded budget.
async fn run_systemctl(args: &[&str], budget: Duration) -> Result<CommandOutcome> {
    let mut cmd = Command::new("systemctl");
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(budget, cmd.output())
        .await
        .map_err(|_| Error::CmdTimeout {
            timeout_secs: budget.as_secs(),
        })?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::CmdNotFound {
                command: "systemctl".into(),
            },
            _ => Error::CmdExecFailed {
                reason: format!("failed to execute systemctl: {e}"),
                detail: None,
            },
        })?;

    Ok(CommandOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Gathers a unit's state. Probe failures degrade to "unknown" rather than
/// failing the request; the unit may simply not exist yet.
async fn probe_status(name: &str) -> Value {
    let mut status = json!({
        "name": name,
        "status": "unknown",
        "active": false,
        "enabled": false,
        "pid": Value::Null,
        "description": "",
    });

    if let Ok(out) = run_systemctl(&["is-active", name], PROBE_TIMEOUT).await {
        let active = out.stdout.trim().to_string();
        status["active"] = json!(active == "active");
        status["status"] = json!(active);
    }
    if let Ok(out) = run_systemctl(&["is-enabled", name], PROBE_TIMEOUT).await {
        status["enabled"] = json!(out.stdout.trim() == "enabled");
    }
    if let Ok(out) = run_systemctl(
        &[
            "show",
            name,
            "--property=MainPID,Description,ActiveState,SubState",
        ],
        PROBE_TIMEOUT,
    )
    .await
    {
        for line in out.stdout.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key {
                "MainPID" => {
                    if let Ok(pid) = value.parse::<u32>() {
                        if pid > 0 {
                            status["pid"] = json!(pid);
                        }
                    }
                }
                "Description" => status["description"] = json!(value),
                "SubState" => status["sub_state"] = json!(value),
                _ => {}
            }
        }
    }
    status
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_name_charset() {
        assert!(validate_unit_name("sshd").is_ok());
        assert!(validate_unit_name("getty@tty1.service").is_ok());
        assert!(validate_unit_name("my-app_2.service").is_ok());

        assert!(validate_unit_name("").is_err());
        assert!(validate_unit_name("bad name").is_err());
        assert!(validate_unit_name("rm;-rf").is_err());
        assert!(validate_unit_name("a/b").is_err());
    }

    #[test]
    fn action_deserializes_lowercase() {
        let action: ServiceAction = serde_json::from_str(r#""restart""#).unwrap();
        assert_eq!(action, ServiceAction::Restart);
        assert!(serde_json::from_str::<ServiceAction>(r#""explode""#).is_err());
    }
}
