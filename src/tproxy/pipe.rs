use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use super::error::ProxyError;

/// A bidirectional async byte stream.
///
/// Trait objects can only carry a single principal trait, so `AsyncRead +
/// AsyncWrite` is folded into one.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Send + Unpin>;
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// The two halves of a mid-proxy splice presented as one read/write object,
/// handed to user rewriters.
///
/// Reads drain the carry-over buffer (bytes received before the upstream was
/// chosen) before touching the source socket; the carry buffer is never
/// refilled. Writes go to the destination socket.
pub struct Pipe {
    src: BoxedRead,
    dst: BoxedWrite,
    carry: BytesMut,
    read_timeout: Option<Duration>,
    closed: bool,
}

impl Pipe {
    pub(crate) fn new(
        src: BoxedRead,
        dst: BoxedWrite,
        carry: BytesMut,
        read_timeout: Option<Duration>,
    ) -> Self {
        Self {
            src,
            dst,
            carry,
            read_timeout,
            closed: false,
        }
    }

    /// Return at most `n` bytes, carry buffer first. Empty on EOF.
    pub async fn read(&mut self, n: usize) -> Result<Vec<u8>, ProxyError> {
        self.check_open()?;
        if !self.carry.is_empty() {
            let take = n.min(self.carry.len());
            return Ok(self.carry.split_to(take).to_vec());
        }

        let mut buf = vec![0u8; n];
        let got = match self.read_timeout {
            Some(t) => time::timeout(t, self.src.read(&mut buf))
                .await
                .map_err(|_| ProxyError::Inactivity)??,
            None => self.src.read(&mut buf).await?,
        };
        buf.truncate(got);
        Ok(buf)
    }

    /// Best-effort single write; returns the number of bytes accepted.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, ProxyError> {
        self.check_open()?;
        Ok(self.dst.write(data).await?)
    }

    /// Write the whole buffer, suspending while the socket is not writable.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), ProxyError> {
        self.check_open()?;
        self.dst.write_all(data).await?;
        Ok(())
    }

    /// Idempotent. Marks the pipe unusable but leaves the underlying sockets
    /// open; the connection objects own them.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_open(&self) -> Result<(), ProxyError> {
        if self.closed {
            Err(ProxyError::Closed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe_over(carry: &[u8], timeout: Option<Duration>) -> (Pipe, tokio::io::DuplexStream, tokio::io::DuplexStream) {
        let (src_remote, src_local) = tokio::io::duplex(1024);
        let (dst_local, dst_remote) = tokio::io::duplex(1024);
        let pipe = Pipe::new(
            Box::new(src_local),
            Box::new(dst_local),
            BytesMut::from(carry),
            timeout,
        );
        (pipe, src_remote, dst_remote)
    }

    #[tokio::test]
    async fn reads_serve_carry_before_socket() {
        let (mut pipe, mut src, _dst) = pipe_over(b"HELLO", None);
        src.write_all(b" world").await.unwrap();

        assert_eq!(pipe.read(3).await.unwrap(), b"HEL");
        assert_eq!(pipe.read(16).await.unwrap(), b"LO");
        // Carry exhausted; the next read comes from the source socket.
        assert_eq!(pipe.read(16).await.unwrap(), b" world");
    }

    #[tokio::test]
    async fn read_returns_empty_on_eof() {
        let (mut pipe, src, _dst) = pipe_over(b"", None);
        drop(src);
        assert!(pipe.read(64).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn writes_reach_the_destination() {
        let (mut pipe, _src, mut dst) = pipe_over(b"", None);
        pipe.write_all(b"rewritten").await.unwrap();

        let mut out = vec![0u8; 9];
        dst.read_exact(&mut out).await.unwrap();
        assert_eq!(out, b"rewritten");
    }

    #[tokio::test]
    async fn close_is_idempotent_and_marks_unusable() {
        let (mut pipe, _src, _dst) = pipe_over(b"data", None);
        pipe.close();
        pipe.close();
        assert!(pipe.is_closed());
        assert!(matches!(pipe.read(4).await, Err(ProxyError::Closed)));
        assert!(matches!(pipe.write(b"x").await, Err(ProxyError::Closed)));
    }

    #[tokio::test]
    async fn silent_source_raises_inactivity() {
        let (mut pipe, _src, _dst) = pipe_over(b"", Some(Duration::from_millis(50)));
        assert!(matches!(pipe.read(64).await, Err(ProxyError::Inactivity)));
    }

    #[tokio::test]
    async fn carry_is_served_even_under_timeout() {
        let (mut pipe, _src, _dst) = pipe_over(b"buffered", Some(Duration::from_millis(50)));
        assert_eq!(pipe.read(64).await.unwrap(), b"buffered");
    }
}
