//! # guestd - Guest RPC Daemon
//!
//! Runs inside the VM, owns the virtio-serial character device, and serves
//! the built-in RPC handler set. Intended to run under systemd (or as a
//! bare process); SIGTERM/SIGINT trigger a clean stop after the in-flight
//! request finishes.
//!
//! ## Usage
//!
//! ```sh
//! guestd --device /dev/virtio-ports/org.qemu.rpc.0 [--debug]
//! ```

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("guestd is only available on Linux guests");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
fn main() -> std::process::ExitCode {
    linux::main()
}

#[cfg(target_os = "linux")]
mod linux {
    use std::path::PathBuf;
    use std::process::ExitCode;
    use std::sync::Arc;

    use tracing::{error, info, Level};
    use tracing_subscriber::FmtSubscriber;

    use virtrpc::{GuestConfig, Server};

    /// Default character device when none is given.
    const DEFAULT_DEVICE: &str = "/dev/virtio-ports/org.qemu.rpc.0";

    const EXIT_SUCCESS: u8 = 0;
    const EXIT_INIT_FAILED: u8 = 1;
    const EXIT_SERVE_FAILED: u8 = 2;

    struct Args {
        device: PathBuf,
        debug: bool,
    }

    fn parse_args() -> anyhow::Result<Args> {
        let mut args = Args {
            device: PathBuf::from(DEFAULT_DEVICE),
            debug: false,
        };
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--device" | "-d" => {
                    args.device = iter
                        .next()
                        .map(PathBuf::from)
                        .ok_or_else(|| anyhow::anyhow!("--device requires a path"))?;
                }
                "--debug" => args.debug = true,
                "--help" | "-h" => {
                    println!("usage: guestd [--device <path>] [--debug]");
                    std::process::exit(0);
                }
                other => anyhow::bail!("unknown argument: {other}"),
            }
        }
        Ok(args)
    }

    /// Installs the SIGTERM/SIGINT handlers that request a clean stop.
    fn spawn_signal_task(server: Arc<Server>) -> anyhow::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM"),
                _ = sigint.recv() => info!("received SIGINT"),
            }
            server.stop();
        });
        Ok(())
    }

    #[tokio::main(flavor = "current_thread")]
    pub async fn main() -> ExitCode {
        let args = match parse_args() {
            Ok(args) => args,
            Err(e) => {
                eprintln!("guestd: {e}");
                return ExitCode::from(EXIT_INIT_FAILED);
            }
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
            .with_target(false)
            .with_ansi(false)
            .compact()
            .finish();
        if tracing::subscriber::set_global_default(subscriber).is_err() {
            eprintln!("guestd: failed to set tracing subscriber");
            return ExitCode::from(EXIT_INIT_FAILED);
        }

        info!(
            version = env!("CARGO_PKG_VERSION"),
            device = %args.device.display(),
            "guestd starting"
        );

        let config = GuestConfig::new(&args.device);
        let server = match Server::new(config) {
            Ok(server) => Arc::new(server),
            Err(e) => {
                error!(error = %e, "failed to build server");
                return ExitCode::from(EXIT_INIT_FAILED);
            }
        };

        if let Err(e) = spawn_signal_task(Arc::clone(&server)) {
            error!(error = %e, "failed to install signal handlers");
            return ExitCode::from(EXIT_INIT_FAILED);
        }

        match server.serve().await {
            Ok(()) => ExitCode::from(EXIT_SUCCESS),
            Err(e) => {
                error!(error = %e, "serve loop failed");
                ExitCode::from(EXIT_SERVE_FAILED)
            }
        }
    }
}
