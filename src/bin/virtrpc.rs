//! # virtrpc - Host CLI
//!
//! Command-line interface to a guest's RPC daemon over the virtio-serial
//! UNIX domain socket.
//!
//! ## Usage
//!
//! ```sh
//! virtrpc --socket <path> ping
//! virtrpc --socket <path> info
//! virtrpc --socket <path> status
//! virtrpc --socket <path> exec "ls -la /tmp"
//! virtrpc --socket <path> upload <local> <remote>
//! virtrpc --socket <path> download <remote> <local>
//! virtrpc --socket <path> file-info <path>
//! virtrpc --socket <path> service <name> <action>
//! ```
//!
//! Exit codes: 0 success, 1 usage/protocol error, 2 connection error,
//! 3 server-reported business error. `exec` exits with the child's code.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use virtrpc::{Error, HostConfig, RpcClient};

const EXIT_SUCCESS: u8 = 0;
const EXIT_USAGE: u8 = 1;
const EXIT_CONNECTION: u8 = 2;
const EXIT_REMOTE: u8 = 3;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Ping,
    Info,
    Status,
    Exec { command: String },
    Upload { local: PathBuf, remote: String },
    Download { remote: String, local: PathBuf },
    FileInfo { path: String },
    Service { name: String, action: String },
    Help,
}

#[derive(Debug)]
struct Args {
    socket: Option<PathBuf>,
    timeout_secs: u64,
    raw: bool,
    debug: bool,
    command: Command,
}

fn usage() -> &'static str {
    "usage: virtrpc --socket <path> [--timeout <secs>] [--raw] [--debug] <command>\n\
     commands:\n\
     \x20 ping                          liveness probe\n\
     \x20 info                          guest system information\n\
     \x20 status                        guest utilization snapshot\n\
     \x20 exec \"<cmd>\"                  run an allow-listed command\n\
     \x20 upload <local> <remote>       copy a file into the guest\n\
     \x20 download <remote> <local>     copy a file out of the guest\n\
     \x20 file-info <path>              stat a guest file\n\
     \x20 service <name> <action>       control a systemd unit"
}

fn parse_args() -> anyhow::Result<Args> {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let mut socket = None;
    let mut timeout_secs = 30u64;
    let mut raw = false;
    let mut debug = false;
    let mut positional: Vec<String> = Vec::new();

    let mut i = 0;
    while i < argv.len() {
        match argv[i].as_str() {
            "--socket" | "-s" => {
                socket = Some(PathBuf::from(
                    argv.get(i + 1)
                        .ok_or_else(|| anyhow::anyhow!("--socket requires a path"))?,
                ));
                i += 2;
            }
            "--timeout" | "-t" => {
                timeout_secs = argv
                    .get(i + 1)
                    .and_then(|v| v.parse().ok())
                    .ok_or_else(|| anyhow::anyhow!("--timeout requires seconds"))?;
                i += 2;
            }
            "--raw" => {
                raw = true;
                i += 1;
            }
            "--debug" => {
                debug = true;
                i += 1;
            }
            "--help" | "-h" => {
                positional.clear();
                positional.push("help".into());
                break;
            }
            other => {
                positional.push(other.to_string());
                i += 1;
            }
        }
    }

    let require = |index: usize, what: &str| -> anyhow::Result<String> {
        positional
            .get(index)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{what}"))
    };

    let command = match positional.first().map(String::as_str) {
        None | Some("help") => Command::Help,
        Some("ping") => Command::Ping,
        Some("info") => Command::Info,
        Some("status") => Command::Status,
        Some("exec") => Command::Exec {
            command: require(1, "exec requires a command string")?,
        },
        Some("upload") => Command::Upload {
            local: PathBuf::from(require(1, "upload requires <local> <remote>")?),
            remote: require(2, "upload requires <local> <remote>")?,
        },
        Some("download") => Command::Download {
            remote: require(1, "download requires <remote> <local>")?,
            local: PathBuf::from(require(2, "download requires <remote> <local>")?),
        },
        Some("file-info") => Command::FileInfo {
            path: require(1, "file-info requires <path>")?,
        },
        Some("service") => Command::Service {
            name: require(1, "service requires <name> <action>")?,
            action: require(2, "service requires <name> <action>")?,
        },
        Some(other) => anyhow::bail!("unknown command: {other}"),
    };

    Ok(Args {
        socket,
        timeout_secs,
        raw,
        debug,
        command,
    })
}

// =============================================================================
// Output
// =============================================================================

fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

fn exit_for(err: &Error) -> u8 {
    match err {
        Error::Remote { .. } => EXIT_REMOTE,
        e if e.is_retryable() => EXIT_CONNECTION,
        Error::NotConnected => EXIT_CONNECTION,
        _ => EXIT_USAGE,
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("virtrpc: {e}\n{}", usage());
            return ExitCode::from(EXIT_USAGE);
        }
    };

    if matches!(args.command, Command::Help) {
        println!("{}", usage());
        return ExitCode::from(EXIT_SUCCESS);
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::WARN })
        .with_target(false)
        .compact()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let Some(socket) = args.socket.clone() else {
        eprintln!("virtrpc: --socket is required\n{}", usage());
        return ExitCode::from(EXIT_USAGE);
    };

    let config =
        HostConfig::new(socket).with_read_timeout(Duration::from_secs(args.timeout_secs));
    let client = RpcClient::new(config);

    let code = match run(&client, &args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("virtrpc: {e}");
            if let Error::Remote { data, .. } = &e {
                if !data.is_null() {
                    eprintln!("{data}");
                }
            }
            exit_for(&e)
        }
    };
    ExitCode::from(code)
}

async fn run(client: &RpcClient, args: &Args) -> virtrpc::Result<u8> {
    match &args.command {
        Command::Help => unreachable!("handled before connecting"),
        Command::Ping => {
            let uptime = client.ping().await?;
            println!("pong (guest up {uptime}s)");
            Ok(EXIT_SUCCESS)
        }
        Command::Info => {
            print_json(&client.system_info().await?);
            Ok(EXIT_SUCCESS)
        }
        Command::Status => {
            print_json(&client.system_status().await?);
            Ok(EXIT_SUCCESS)
        }
        Command::Exec { command } => {
            let result = client
                .exec_command(command, args.timeout_secs, None, None)
                .await?;
            if args.raw {
                print_json(&serde_json::json!({
                    "exit_code": result.exit_code,
                    "stdout": result.stdout,
                    "stderr": result.stderr,
                    "duration_ms": result.duration_ms,
                }));
            } else {
                print!("{}", result.stdout);
                if !result.stderr.is_empty() {
                    eprint!("{}", result.stderr);
                }
            }
            // Mirror the child's exit code, clamped to the u8 range.
            Ok(u8::try_from(result.exit_code.clamp(0, 255)).unwrap_or(255))
        }
        Command::Upload { local, remote } => {
            let size = tokio::fs::metadata(local).await.map(|m| m.len()).unwrap_or(0);
            let result = if size > virtrpc::MAX_CHUNK as u64 {
                client.chunked_upload_file(local, remote).await?
            } else {
                client.upload_file(local, remote).await?
            };
            println!("uploaded {} ({} bytes, md5 {})", result.path, result.size, result.md5);
            Ok(EXIT_SUCCESS)
        }
        Command::Download { remote, local } => {
            let result = client.download_file(remote, local).await?;
            println!(
                "downloaded {} ({} bytes, md5 {})",
                result.path, result.size, result.md5
            );
            Ok(EXIT_SUCCESS)
        }
        Command::FileInfo { path } => {
            print_json(&client.file_info(path).await?);
            Ok(EXIT_SUCCESS)
        }
        Command::Service { name, action } => {
            print_json(&client.control_service(name, action).await?);
            Ok(EXIT_SUCCESS)
        }
    }
}
