//! Channel endpoints over the virtio-serial byte pipe.
//!
//! One [`Channel`] owns one bidirectional stream: the UNIX domain socket
//! QEMU exposes on the host, or the character device under
//! `/dev/virtio-ports/` on the guest. The channel hides short reads and
//! short writes but nothing else; framing is the codec's job.
//!
//! All I/O failures collapse to two kinds: `ConnectionLost` (the handle is
//! dead; reconnect produces a new channel) and a timeout (the handle is
//! still valid and the operation may be retried).

use std::path::Path;
use std::time::Duration;

use tokio::fs::OpenOptions;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{timeout_at, Instant};

use crate::constants::DEFAULT_BUFFER_SIZE;
use crate::error::{Error, Result};

// =============================================================================
// Deadline
// =============================================================================

/// An absolute instant past which an operation must unwind with a timeout.
/// `Deadline::none()` blocks indefinitely.
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; block until the operation completes.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }

    /// Deadline `timeout` from now.
    #[must_use]
    pub fn after(timeout: Duration) -> Self {
        Self(Some(Instant::now() + timeout))
    }

    /// Deadline at an explicit instant.
    #[must_use]
    pub fn at(instant: Instant) -> Self {
        Self(Some(instant))
    }

    /// Time remaining, or `None` when unbounded. Saturates at zero.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    async fn run<F, T>(&self, fut: F) -> std::result::Result<std::io::Result<T>, ()>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        match self.0 {
            Some(at) => timeout_at(at, fut).await.map_err(|_| ()),
            None => Ok(fut.await),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

// =============================================================================
// Channel
// =============================================================================

/// Owning wrapper over a single bidirectional byte stream.
///
/// Exactly one task may read and one may write at a time; the owning
/// component serializes access. A channel never survives a reconnect:
/// `ConnectionLost` invalidates it and the owner must open a new one.
pub struct Channel<S> {
    stream: S,
    /// Bytes read past the last consumed frame boundary.
    residual: Vec<u8>,
    chunk_size: usize,
}

impl Channel<UnixStream> {
    /// Connects the host-side UNIX domain socket.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionRefused` when the path is absent or nothing is
    /// accepting, `ReadTimeout` when the connect deadline elapses.
    pub async fn connect_uds(path: &Path, connect_timeout: Duration) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, UnixStream::connect(path))
            .await
            .map_err(|_| Error::ReadTimeout(connect_timeout))?
            .map_err(|source| Error::ConnectionRefused {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self::new(stream, DEFAULT_BUFFER_SIZE))
    }
}

impl Channel<tokio::fs::File> {
    /// Opens the guest-side character device read-write.
    ///
    /// Opening succeeds even when no host is connected; reads then block
    /// until the host writes.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` when the device node cannot be opened.
    pub async fn open_device(path: &Path, buffer_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| Error::ConnectionLost(format!("open {}: {e}", path.display())))?;
        Ok(Self::new(file, buffer_size))
    }
}

impl<S> Channel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps an already-open stream.
    #[must_use]
    pub fn new(stream: S, buffer_size: usize) -> Self {
        Self {
            stream,
            residual: Vec::new(),
            chunk_size: buffer_size.max(512),
        }
    }

    /// Reads until `delim` appears, returning everything up to and including
    /// it. Bytes after the delimiter stay buffered for the next read.
    ///
    /// # Errors
    ///
    /// `Oversize` when `max_bytes` is scanned without a match,
    /// `ReadTimeout` on deadline expiry, `ConnectionLost` on EOF or I/O
    /// failure.
    pub async fn read_until(
        &mut self,
        delim: &[u8],
        max_bytes: usize,
        deadline: Deadline,
    ) -> Result<Vec<u8>> {
        loop {
            if let Some(pos) = find(&self.residual, delim) {
                let end = pos + delim.len();
                if end > max_bytes {
                    return Err(Error::Oversize {
                        size: end,
                        limit: max_bytes,
                    });
                }
                let rest = self.residual.split_off(end);
                let frame = std::mem::replace(&mut self.residual, rest);
                return Ok(frame);
            }
            if self.residual.len() >= max_bytes {
                return Err(Error::Oversize {
                    size: self.residual.len(),
                    limit: max_bytes,
                });
            }
            self.fill(deadline).await?;
        }
    }

    /// Reads exactly `n` bytes, retrying partial reads until satisfied.
    ///
    /// # Errors
    ///
    /// `ReadTimeout` on deadline expiry, `ConnectionLost` on EOF mid-read.
    pub async fn read_exact(&mut self, n: usize, deadline: Deadline) -> Result<Vec<u8>> {
        while self.residual.len() < n {
            self.fill(deadline).await?;
        }
        let rest = self.residual.split_off(n);
        Ok(std::mem::replace(&mut self.residual, rest))
    }

    /// Writes the whole buffer, resuming partial writes, or fails.
    ///
    /// # Errors
    ///
    /// `WriteTimeout` on deadline expiry, `ConnectionLost` on I/O failure.
    pub async fn write_all(&mut self, bytes: &[u8], deadline: Deadline) -> Result<()> {
        let io = async {
            self.stream.write_all(bytes).await?;
            self.stream.flush().await
        };
        match deadline.run(io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::from_channel_io(e)),
            Err(()) => Err(Error::WriteTimeout(
                deadline.remaining().unwrap_or(Duration::ZERO),
            )),
        }
    }

    /// Discards any buffered bytes. Used when the owner resynchronizes
    /// after abandoning a response.
    pub fn clear(&mut self) {
        self.residual.clear();
    }

    /// Consumes the channel, closing the underlying stream on drop.
    pub fn close(self) {}

    /// Pulls one chunk from the stream into the residual buffer. EOF while
    /// the caller still needs bytes means the peer went away.
    async fn fill(&mut self, deadline: Deadline) -> Result<()> {
        let mut chunk = vec![0u8; self.chunk_size];
        let n = match deadline.run(self.stream.read(&mut chunk)).await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::from_channel_io(e)),
            Err(()) => {
                return Err(Error::ReadTimeout(
                    deadline.remaining().unwrap_or(Duration::ZERO),
                ))
            }
        };
        if n == 0 {
            return Err(Error::ConnectionLost("peer closed the channel".into()));
        }
        self.residual.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Channel<tokio::io::DuplexStream>, tokio::io::DuplexStream) {
        let (a, b) = tokio::io::duplex(4096);
        (Channel::new(a, 4096), b)
    }

    #[tokio::test]
    async fn read_until_retains_overrun() {
        let (mut ch, mut peer) = pair();
        peer.write_all(b"head\r\n\r\nbody-bytes").await.unwrap();

        let head = ch
            .read_until(b"\r\n\r\n", 1024, Deadline::none())
            .await
            .unwrap();
        assert_eq!(head, b"head\r\n\r\n");

        let body = ch.read_exact(10, Deadline::none()).await.unwrap();
        assert_eq!(body, b"body-bytes");
    }

    #[tokio::test]
    async fn read_until_enforces_max() {
        let (mut ch, mut peer) = pair();
        peer.write_all(&[b'x'; 64]).await.unwrap();

        let err = ch
            .read_until(b"\r\n\r\n", 32, Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Oversize { limit: 32, .. }));
    }

    #[tokio::test]
    async fn read_exact_spans_partial_writes() {
        let (mut ch, mut peer) = pair();
        let writer = tokio::spawn(async move {
            peer.write_all(b"abc").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            peer.write_all(b"defgh").await.unwrap();
            peer
        });

        let got = ch.read_exact(8, Deadline::none()).await.unwrap();
        assert_eq!(got, b"abcdefgh");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn read_times_out_with_handle_still_usable() {
        let (mut ch, mut peer) = pair();

        let err = ch
            .read_exact(1, Deadline::after(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadTimeout(_)));

        // Handle survives a timeout.
        peer.write_all(b"k").await.unwrap();
        let got = ch.read_exact(1, Deadline::none()).await.unwrap();
        assert_eq!(got, b"k");
    }

    #[tokio::test]
    async fn eof_is_connection_lost() {
        let (mut ch, peer) = pair();
        drop(peer);

        let err = ch.read_exact(1, Deadline::none()).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionLost(_)));
    }
}
