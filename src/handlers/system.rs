//! System information handlers: ping, system/info, system/status.
//!
//! Everything is read from the kernel's standard surfaces (`uname(2)`,
//! `statvfs(3)`, `/proc`, `/etc/os-release`); missing sources degrade to
//! zero values rather than failing the request.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::envelope::unix_timestamp;
use crate::error::Result;

use super::{Handler, RequestContext};

// =============================================================================
// Ping
// =============================================================================

/// `GET /api/v1/ping`: liveness probe with server uptime.
pub struct PingHandler;

#[async_trait]
impl Handler for PingHandler {
    async fn handle(&self, ctx: &RequestContext) -> Result<Value> {
        Ok(json!({
            "timestamp": unix_timestamp(),
            "uptime": ctx.uptime_secs,
            "message": "pong",
        }))
    }
}

// =============================================================================
// System Info
// =============================================================================

/// `GET /api/v1/system/info`: static host identity and capacity.
pub struct SystemInfoHandler;

#[async_trait]
impl Handler for SystemInfoHandler {
    async fn handle(&self, _ctx: &RequestContext) -> Result<Value> {
        let uts = uname();
        let (memory_total, memory_available) = read_meminfo().await;

        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();

        let os_version = read_os_release()
            .await
            .unwrap_or_else(|| format!("{} {}", uts.sysname, uts.release));

        Ok(json!({
            "hostname": hostname,
            "os": uts.sysname,
            "os_version": os_version,
            "kernel": uts.release,
            "arch": uts.machine,
            "cpu_count": cpu_count(),
            "memory_total": memory_total,
            "memory_available": memory_available,
        }))
    }
}

// =============================================================================
// System Status
// =============================================================================

/// `GET /api/v1/system/status`: point-in-time utilization.
pub struct SystemStatusHandler;

#[async_trait]
impl Handler for SystemStatusHandler {
    async fn handle(&self, _ctx: &RequestContext) -> Result<Value> {
        let (memory_total, memory_available) = read_meminfo().await;
        let memory_usage = if memory_total > 0 {
            round1((1.0 - memory_available as f64 / memory_total as f64) * 100.0)
        } else {
            0.0
        };

        Ok(json!({
            "cpu_usage": read_cpu_usage().await,
            "memory_usage": memory_usage,
            "disk_usage": disk_usage().await,
            "load_average": read_load_average().await,
            "process_count": count_processes().await,
        }))
    }
}

// =============================================================================
// Kernel Surfaces
// =============================================================================

struct Uname {
    sysname: String,
    release: String,
    machine: String,
}

/// Wraps `uname(2)`.
fn uname() -> Uname {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    // SAFETY: uts is a zeroed utsname the kernel fills in; a failure leaves
    // it zeroed, which decodes to empty strings below.
    let rc = unsafe { libc::uname(&mut uts) };
    if rc != 0 {
        return Uname {
            sysname: String::new(),
            release: String::new(),
            machine: String::new(),
        };
    }
    Uname {
        sysname: c_chars_to_string(&uts.sysname),
        release: c_chars_to_string(&uts.release),
        machine: c_chars_to_string(&uts.machine),
    }
}

fn c_chars_to_string(chars: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn cpu_count() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1)
}

/// `(MemTotal, MemAvailable)` in bytes from `/proc/meminfo`.
async fn read_meminfo() -> (u64, u64) {
    let Ok(text) = tokio::fs::read_to_string("/proc/meminfo").await else {
        return (0, 0);
    };
    let mut total = 0;
    let mut available = 0;
    for line in text.lines() {
        let kib = |line: &str| {
            line.split_whitespace()
                .nth(1)
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                * 1024
        };
        if line.starts_with("MemTotal:") {
            total = kib(line);
        } else if line.starts_with("MemAvailable:") {
            available = kib(line);
        }
    }
    (total, available)
}

/// `PRETTY_NAME` from `/etc/os-release`.
async fn read_os_release() -> Option<String> {
    let text = tokio::fs::read_to_string("/etc/os-release").await.ok()?;
    text.lines().find_map(|line| {
        line.strip_prefix("PRETTY_NAME=")
            .map(|v| v.trim_matches('"').to_string())
    })
}

/// Aggregate CPU busy share since boot, from the first line of
/// `/proc/stat`.
async fn read_cpu_usage() -> f64 {
    let Ok(text) = tokio::fs::read_to_string("/proc/stat").await else {
        return 0.0;
    };
    let Some(line) = text.lines().next().filter(|l| l.starts_with("cpu ")) else {
        return 0.0;
    };
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    let total: u64 = fields.iter().sum();
    let idle = fields.get(3).copied().unwrap_or(0);
    if total == 0 {
        return 0.0;
    }
    round1((1.0 - idle as f64 / total as f64) * 100.0)
}

/// 1/5/15-minute load averages from `/proc/loadavg`.
async fn read_load_average() -> [f64; 3] {
    let Ok(text) = tokio::fs::read_to_string("/proc/loadavg").await else {
        return [0.0; 3];
    };
    let mut parts = text.split_whitespace();
    let mut next = || parts.next().and_then(|v| v.parse().ok()).unwrap_or(0.0);
    [next(), next(), next()]
}

/// Number of live processes, counted as numeric entries under `/proc`.
async fn count_processes() -> u64 {
    let Ok(mut dir) = tokio::fs::read_dir("/proc").await else {
        return 0;
    };
    let mut count = 0;
    while let Ok(Some(entry)) = dir.next_entry().await {
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        {
            count += 1;
        }
    }
    count
}

/// Per-mount used percentage for real (device-backed) filesystems.
async fn disk_usage() -> Map<String, Value> {
    let mut usage = Map::new();
    let Ok(mounts) = tokio::fs::read_to_string("/proc/mounts").await else {
        if let Some(percent) = statvfs_used_percent(Path::new("/")) {
            usage.insert("/".to_string(), json!(percent));
        }
        return usage;
    };
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(source), Some(mount)) = (fields.next(), fields.next()) else {
            continue;
        };
        if source.starts_with("/dev/") || mount == "/" {
            if let Some(percent) = statvfs_used_percent(Path::new(mount)) {
                usage.insert(mount.to_string(), json!(percent));
            }
        }
    }
    usage
}

/// Wraps `statvfs(3)` for one mount point.
fn statvfs_used_percent(mount: &Path) -> Option<f64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(mount.as_os_str().as_bytes()).ok()?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is NUL-terminated and vfs is a zeroed out-struct.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut vfs) };
    if rc != 0 {
        return None;
    }
    let total = vfs.f_blocks as u64 * vfs.f_frsize as u64;
    let free = vfs.f_bfree as u64 * vfs.f_frsize as u64;
    if total == 0 {
        return None;
    }
    Some(round1((1.0 - free as f64 / total as f64) * 100.0))
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::RequestBody;
    use crate::protocol::Method;
    use std::collections::HashMap;
    use std::time::Duration;

    fn ctx() -> RequestContext {
        RequestContext {
            method: Method::Get,
            path: "/api/v1/ping".into(),
            query: HashMap::new(),
            body: RequestBody::default(),
            request_id: "t1".into(),
            deadline: Duration::from_secs(30),
            uptime_secs: 42,
        }
    }

    #[tokio::test]
    async fn ping_reports_uptime() {
        let data = PingHandler.handle(&ctx()).await.unwrap();
        assert_eq!(data["uptime"], 42);
        assert_eq!(data["message"], "pong");
        assert!(data["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn system_info_has_identity_fields() {
        let data = SystemInfoHandler.handle(&ctx()).await.unwrap();
        for key in ["hostname", "os", "kernel", "arch", "cpu_count", "memory_total"] {
            assert!(data.get(key).is_some(), "missing {key}");
        }
        assert!(data["cpu_count"].as_u64().unwrap() >= 1);
    }

    #[tokio::test]
    async fn system_status_has_utilization_fields() {
        let data = SystemStatusHandler.handle(&ctx()).await.unwrap();
        assert!(data["load_average"].as_array().unwrap().len() == 3);
        assert!(data["process_count"].as_u64().unwrap() > 0);
        let cpu = data["cpu_usage"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&cpu));
    }
}
