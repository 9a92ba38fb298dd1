use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time;

use super::error::ProxyError;
use super::pipe::{BoxedRead, BoxedStream, BoxedWrite, Pipe};
use super::route::RouteAdapter;

pub const RELAY_CHUNK: usize = 8192;

/// The upstream half of an established session: two co-dependent relay
/// tasks, one per direction.
pub struct ServerConnection {
    upstream: BoxedStream,
    carry: BytesMut,
    timeout: Option<Duration>,
    extra: Option<serde_json::Value>,
}

impl ServerConnection {
    pub fn new(
        upstream: BoxedStream,
        carry: BytesMut,
        timeout: Option<Duration>,
        extra: Option<serde_json::Value>,
    ) -> Self {
        Self {
            upstream,
            carry,
            timeout,
            extra,
        }
    }

    /// Relay until either side finishes. The first task to terminate (EOF,
    /// error or inactivity timeout) cancels its peer; the upstream socket is
    /// closed exactly once when both are done. The client socket belongs to
    /// the client connection.
    pub async fn handle(
        self,
        client_read: BoxedRead,
        client_write: BoxedWrite,
        adapter: &RouteAdapter,
    ) -> Result<(), ProxyError> {
        let ServerConnection {
            upstream,
            carry,
            timeout,
            extra,
        } = self;

        let caps = adapter.caps();
        let extra = extra.as_ref();
        let (up_read, up_write) = tokio::io::split(upstream);

        let request_side = async move {
            if caps.rewrite_request {
                let mut pipe = Pipe::new(client_read, Box::new(up_write), carry, None);
                adapter.rewrite_request(&mut pipe, extra).await
            } else {
                // The accumulated buffer was already flushed by the dial.
                relay(client_read, up_write, None).await
            }
        };

        let response_side = async move {
            if caps.rewrite_response {
                let mut pipe = Pipe::new(Box::new(up_read), client_write, BytesMut::new(), timeout);
                adapter.rewrite_response(&mut pipe, extra).await
            } else {
                relay(up_read, client_write, timeout).await
            }
        };

        tokio::select! {
            res = request_side => res,
            res = response_side => res,
        }
    }
}

/// Plain one-direction copy loop. The timeout, when set, bounds each
/// individual read.
async fn relay(
    mut src: impl AsyncRead + Unpin,
    mut dst: impl AsyncWrite + Unpin,
    timeout: Option<Duration>,
) -> Result<(), ProxyError> {
    let mut buf = [0u8; RELAY_CHUNK];
    loop {
        let n = match timeout {
            Some(t) => time::timeout(t, src.read(&mut buf))
                .await
                .map_err(|_| ProxyError::Inactivity)??,
            None => src.read(&mut buf).await?,
        };
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&buf[..n]).await?;
    }
}
