//! # virtrpc
//!
//! **Bidirectional RPC over a KVM/QEMU virtio-serial channel**
//!
//! This crate connects a host process to a guest VM process with no TCP/IP
//! dependency: the host opens the UNIX domain socket QEMU exposes for the
//! channel, the guest opens the matching character device under
//! `/dev/virtio-ports/`, and HTTP/1.1 request/response pairs flow between
//! them.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Host                                                                 │
//! │  ┌───────────────┐   ┌────────────┐   ┌──────────────────┐           │
//! │  │   RpcClient   │──▶│ HTTP codec │──▶│ Channel (UDS)    │──┐        │
//! │  └───────────────┘   └────────────┘   └──────────────────┘  │        │
//! │        retry/backoff, single flight                         │        │
//! └─────────────────────────────────────────────────────────────┼────────┘
//!                                  virtio-serial                │
//! ┌─────────────────────────────────────────────────────────────▼────────┐
//! │ Guest                                                                │
//! │  ┌──────────────────┐   ┌────────────┐   ┌────────────────────────┐  │
//! │  │ Channel (chardev)│──▶│ HTTP codec │──▶│ Server: router +       │  │
//! │  └──────────────────┘   └────────────┘   │ policy-gated handlers  │  │
//! │        reconnect state machine           │ (system/shell/file/    │  │
//! │                                          │  service)              │  │
//! │                                          └────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Wire Contract
//!
//! - HTTP/1.1 subset: `GET`/`POST`, exact `Content-Length` framing, no
//!   transfer encodings, one request in flight per channel.
//! - Bodies are UTF-8 JSON envelopes; responses always carry
//!   `{version, code, message, data, timestamp}` with `code = 0` for
//!   success. Business failures ride HTTP 200 with a non-zero code;
//!   4xx/5xx are reserved for protocol faults.
//! - `X-Request-ID` correlates each response to its request.
//!
//! # Security Model
//!
//! Handlers side-effect the guest only through the policy layer:
//!
//! - **Path policy**: absolute paths only, `..`/symlink resolution, prefix
//!   allow-list, hard-forbidden prefixes (`/etc/shadow`, `/root/`,
//!   `/proc/`, `/sys/`), `/etc/` read-only.
//! - **Command policy**: argv allow-list, no shell, metacharacter
//!   rejection, scrubbed environment.
//! - **Bounded everything**: header block 16 KiB, bodies 10 MiB, chunk
//!   windows 1 MiB, capture buffers 1 MiB, handler deadlines capped at
//!   120 s with SIGTERM→SIGKILL escalation for children.
//!
//! # Example
//!
//! ```rust,ignore
//! use virtrpc::{HostConfig, RpcClient};
//!
//! #[tokio::main]
//! async fn main() -> virtrpc::Result<()> {
//!     let config = HostConfig::new(
//!         "/var/lib/libvirt/qemu/channel/target/domain-1-vm/org.qemu.rpc.0",
//!     );
//!     let client = RpcClient::new(config);
//!
//!     let uptime = client.ping().await?;
//!     println!("guest up {uptime}s");
//!
//!     let result = client.exec_command("ls -la /tmp", 30, None, None).await?;
//!     print!("{}", result.stdout);
//!     Ok(())
//! }
//! ```

// =============================================================================
// Internal Modules
// =============================================================================

mod channel;
mod client;
mod config;
mod constants;
mod envelope;
mod error;
mod policy;
mod protocol;
mod server;

/// Built-in guest handlers and the handler seam for user registrations.
pub mod handlers;

// =============================================================================
// Public Surface
// =============================================================================

pub use channel::{Channel, Deadline};
pub use client::{DownloadResult, ExecResult, RpcClient, UploadResult};
pub use config::{GuestConfig, HostConfig, RateLimitConfig};
pub use constants::{MAX_CHUNK, MAX_HEADER_BYTES, PROTOCOL_VERSION};
pub use envelope::{
    build_request, generate_request_id, RequestBody, ResponseEnvelope, HEADER_REQUEST_ID,
    HEADER_RESPONSE_TIME, HEADER_TIMESTAMP,
};
pub use error::{Error, ErrorCode, Result};
pub use policy::{Access, CommandPolicy, PathPolicy, RateLimiter};
pub use protocol::{
    read_body, read_request_head, read_response, Headers, HttpRequest, HttpResponse, Method,
    RequestHead,
};
pub use server::{split_query, AuthPolicy, RouteOptions, Server, ServerState};
