use std::mem;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UnixStream};
use tokio::time;

use super::error::ProxyError;
use super::net::Address;
use super::pipe::{BoxedRead, BoxedStream, BoxedWrite};
use super::route::{ClientInfo, Decision, Forward};
use super::server::ServerConnection;
use super::tls;
use super::worker::WorkerShared;

pub const RECV_CHUNK: usize = 8192;

/// Accept-side state machine: buffer initial bytes, ask the route script for
/// a decision, act on it, then hand off to the server connection.
pub struct ClientConnection {
    read: BoxedRead,
    write: BoxedWrite,
    peer: String,
    buf: BytesMut,
    remote: Option<Address>,
    connected: bool,
    shared: Arc<WorkerShared>,
}

impl ClientConnection {
    pub fn new(stream: BoxedStream, peer: String, shared: Arc<WorkerShared>) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read: Box::new(read),
            write: Box::new(write),
            peer,
            buf: BytesMut::with_capacity(RECV_CHUNK),
            remote: None,
            connected: false,
            shared,
        }
    }

    /// Runs to completion whether the connection succeeds or fails. The
    /// accepted socket is released and the worker counter decremented exactly
    /// once.
    pub async fn handle(mut self) {
        {
            let mut count = self.shared.counter.lock().await;
            *count += 1;
            self.shared.refresh_title(*count);
        }

        if let Err(err) = self.run().await {
            match &err {
                ProxyError::Connect(_) => {
                    tracing::error!(peer = %self.peer, "{err}");
                    self.report(&err);
                }
                ProxyError::Inactivity => {
                    tracing::warn!(peer = %self.peer, "inactivity timeout");
                    self.report(&err);
                }
                ProxyError::Socket(_) => {
                    tracing::error!(peer = %self.peer, "{err}");
                    self.report(&err);
                }
                _ => {
                    tracing::error!(peer = %self.peer, "unknown error: {err}");
                }
            }
        }

        if let Some(remote) = &self.remote {
            tracing::debug!(%remote, "close connection");
        }

        {
            let mut count = self.shared.counter.lock().await;
            *count -= 1;
            self.shared.refresh_title(*count);
        }
        // Dropping the halves here closes the accepted socket, once.
    }

    async fn run(&mut self) -> Result<(), ProxyError> {
        while !self.connected {
            self.buf.reserve(RECV_CHUNK);
            let n = self.read.read_buf(&mut self.buf).await?;
            if n == 0 {
                break;
            }

            match self.shared.adapter.decide(&self.buf)? {
                Decision::NeedMore => continue,
                Decision::Close { reply } => {
                    if let Some(reply) = reply {
                        self.write.write_all(&reply).await?;
                    }
                    break;
                }
                Decision::Forward(fwd) => {
                    self.connect_to_resource(fwd).await?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Dial the chosen upstream and run the relay until it finishes.
    async fn connect_to_resource(&mut self, fwd: Forward) -> Result<(), ProxyError> {
        let Forward {
            remote,
            ssl,
            ssl_args,
            data,
            reply,
            connect_timeout,
            inactivity_timeout,
            extra,
        } = fwd;

        if let Some(data) = data {
            self.buf.clear();
            self.buf.extend_from_slice(&data);
        }
        if let Some(reply) = reply {
            self.write.write_all(&reply).await?;
        }

        let mut upstream = dial(&remote, connect_timeout, ssl, &ssl_args).await?;

        self.connected = true;
        tracing::debug!(remote = %remote, "successful connection");
        self.remote = Some(remote);

        let caps = self.shared.adapter.caps();
        let carry = if !caps.rewrite_request {
            // No request hook: flush what was buffered straight through.
            if !self.buf.is_empty() {
                upstream.write_all(&self.buf).await?;
                self.buf.clear();
            }
            BytesMut::new()
        } else {
            self.buf.split()
        };

        let server = ServerConnection::new(upstream, carry, inactivity_timeout, extra);
        let read = mem::replace(&mut self.read, Box::new(tokio::io::empty()));
        let write = mem::replace(&mut self.write, Box::new(tokio::io::sink()));
        server.handle(read, write, &self.shared.adapter).await
    }

    fn report(&self, err: &ProxyError) {
        if self.shared.adapter.caps().proxy_error {
            let info = ClientInfo {
                peer: self.peer.clone(),
                remote: self.remote.clone(),
                connected: self.connected,
            };
            self.shared.adapter.report_error(&info, err);
        }
    }
}

/// Resolve and connect, bounded by `connect_timeout` when set. The address
/// family follows the resolved host.
async fn dial(
    remote: &Address,
    connect_timeout: Option<std::time::Duration>,
    ssl: bool,
    ssl_args: &tls::TlsClientOptions,
) -> Result<BoxedStream, ProxyError> {
    let fut = async {
        match remote {
            Address::Inet { host, port } => {
                let mut addrs = tokio::net::lookup_host((host.as_str(), *port))
                    .await
                    .map_err(|e| ProxyError::Connect(format!("resolve {remote}: {e}")))?;
                let addr = addrs
                    .next()
                    .ok_or_else(|| ProxyError::Connect(format!("no addresses for {remote}")))?;
                let sock = TcpStream::connect(addr)
                    .await
                    .map_err(|e| ProxyError::Connect(format!("dial {remote}: {e}")))?;
                if ssl {
                    tls::wrap_upstream(sock, host, ssl_args)
                        .await
                        .map_err(|e| ProxyError::Connect(format!("tls {remote}: {e}")))
                } else {
                    Ok(Box::new(sock) as BoxedStream)
                }
            }
            Address::Unix(path) => {
                let sock = UnixStream::connect(path)
                    .await
                    .map_err(|e| ProxyError::Connect(format!("dial {remote}: {e}")))?;
                Ok(Box::new(sock) as BoxedStream)
            }
        }
    };

    match connect_timeout {
        Some(t) => time::timeout(t, fut)
            .await
            .map_err(|_| ProxyError::Connect(format!("timed out dialing {remote}")))?,
        None => fut.await,
    }
}
