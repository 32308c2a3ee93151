//! Host-side UDS connection management.
//!
//! One [`Connection`] wraps one live channel to the guest. The client
//! replaces the whole connection on any transport fault; a connection is
//! never reused across reconnects.

use tokio::net::UnixStream;

use crate::channel::{Channel, Deadline};
use crate::config::HostConfig;
use crate::error::Result;
use crate::protocol::{self, HttpRequest, HttpResponse};

/// A live request/response channel over the QEMU UNIX domain socket.
pub struct Connection {
    channel: Channel<UnixStream>,
    read_timeout: std::time::Duration,
    write_timeout: std::time::Duration,
    max_response_body: usize,
}

impl Connection {
    /// Connects to the configured socket path.
    ///
    /// # Errors
    ///
    /// `ConnectionRefused` when the path is absent or nothing accepts.
    pub async fn connect(config: &HostConfig) -> Result<Self> {
        let channel = Channel::connect_uds(&config.socket_path, config.connect_timeout).await?;
        tracing::info!(socket = %config.socket_path.display(), "connected");
        Ok(Self {
            channel,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            max_response_body: crate::constants::DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// Writes one request and reads one response. The single-in-flight
    /// invariant is the caller's (the client serializes through a mutex).
    ///
    /// # Errors
    ///
    /// Transport faults (`ConnectionLost`, `ReadTimeout`, `WriteTimeout`)
    /// invalidate the connection; the caller must drop it.
    pub async fn round_trip(
        &mut self,
        request: &HttpRequest,
        read_timeout: Option<std::time::Duration>,
    ) -> Result<HttpResponse> {
        self.channel
            .write_all(&request.to_bytes(), Deadline::after(self.write_timeout))
            .await?;
        protocol::read_response(
            &mut self.channel,
            self.max_response_body,
            Deadline::after(read_timeout.unwrap_or(self.read_timeout)),
        )
        .await
    }
}
