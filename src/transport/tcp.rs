//! TCP transports: outbound client and inbound server-listen mode.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ByteSink, ByteSource, TransportPair};
use crate::config::ListenPolicy;
use crate::error::TransportError;

/// Connect out to `host:port` within `timeout`.
pub(crate) async fn connect_client(
    host: &str,
    port: u16,
    timeout: Duration,
) -> Result<TransportPair, TransportError> {
    let endpoint = format!("{host}:{port}");
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
        .await
        .map_err(|_| TransportError::timed_out(timeout))?
        .map_err(|e| TransportError::from_io(&endpoint, e))?;

    // Command frames are tiny and latency-sensitive.
    let _ = stream.set_nodelay(true);
    debug!(%endpoint, "tcp client connected");

    let (read, write) = stream.into_split();
    Ok(TransportPair {
        source: Box::new(ClientSource { read, endpoint: endpoint.clone() }),
        sink: Box::new(ClientSink { write, endpoint }),
    })
}

/// Bind the listening socket for server-listen mode.
pub(crate) async fn bind_server(interface: &str, port: u16) -> Result<TcpListener, TransportError> {
    let endpoint = format!("{interface}:{port}");
    TcpListener::bind(&endpoint)
        .await
        .map_err(|e| TransportError::from_io(&endpoint, e))
}

/// Wait for the first inbound peer, then serve reads from it while the
/// listener stays open to apply the listen policy to later arrivals.
pub(crate) async fn accept_first_peer(
    listener: TcpListener,
    policy: ListenPolicy,
) -> Result<TransportPair, TransportError> {
    let endpoint = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "tcp-server".to_string());
    let (stream, peer) = listener
        .accept()
        .await
        .map_err(|e| TransportError::from_io(&endpoint, e))?;
    let _ = stream.set_nodelay(true);
    info!(%peer, "inbound device connected");

    let (read, write) = stream.into_split();
    let writer = Arc::new(Mutex::new(Some(write)));
    Ok(TransportPair {
        source: Box::new(ServerSource {
            listener,
            active: Some(read),
            writer: Arc::clone(&writer),
            policy,
            endpoint: endpoint.clone(),
        }),
        sink: Box::new(ServerSink { writer, endpoint }),
    })
}

struct ClientSource {
    read: OwnedReadHalf,
    endpoint: String,
}

#[async_trait]
impl ByteSource for ClientSource {
    async fn recv_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let n = self
            .read
            .read(buf)
            .await
            .map_err(|e| TransportError::from_io(&self.endpoint, e))?;
        if n == 0 {
            return Err(TransportError::closed("connection closed by peer"));
        }
        Ok(n)
    }
}

struct ClientSink {
    write: OwnedWriteHalf,
    endpoint: String,
}

#[async_trait]
impl ByteSink for ClientSink {
    async fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.write
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::from_io(&self.endpoint, e))?;
        self.write
            .flush()
            .await
            .map_err(|e| TransportError::from_io(&self.endpoint, e))
    }
}

/// Reading half of server-listen mode. Owns the listener so the listen
/// policy keeps applying after the first peer.
struct ServerSource {
    listener: TcpListener,
    active: Option<OwnedReadHalf>,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    policy: ListenPolicy,
    endpoint: String,
}

impl ServerSource {
    async fn install(&mut self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);
        let (read, write) = stream.into_split();
        self.active = Some(read);
        *self.writer.lock().await = Some(write);
    }
}

#[async_trait]
impl ByteSource for ServerSource {
    async fn recv_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            match self.active.as_mut() {
                None => {
                    // No active device; the next arrival is always admitted.
                    let (stream, peer) = self
                        .listener
                        .accept()
                        .await
                        .map_err(|e| TransportError::from_io(&self.endpoint, e))?;
                    info!(%peer, "inbound device connected");
                    self.install(stream).await;
                }
                Some(read) => {
                    tokio::select! {
                        accepted = self.listener.accept() => {
                            let (stream, peer) = accepted
                                .map_err(|e| TransportError::from_io(&self.endpoint, e))?;
                            match self.policy {
                                ListenPolicy::RejectNew => {
                                    warn!(%peer, "second inbound connection rejected");
                                    drop(stream);
                                }
                                ListenPolicy::ReplaceActive => {
                                    warn!(%peer, "replacing active device with newcomer");
                                    self.install(stream).await;
                                }
                            }
                        }
                        result = read.read(buf) => {
                            let n = result
                                .map_err(|e| TransportError::from_io(&self.endpoint, e))?;
                            if n == 0 {
                                debug!("active device disconnected, listening again");
                                self.active = None;
                                *self.writer.lock().await = None;
                                continue;
                            }
                            return Ok(n);
                        }
                    }
                }
            }
        }
    }
}

struct ServerSink {
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    endpoint: String,
}

#[async_trait]
impl ByteSink for ServerSink {
    async fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().await;
        let write = guard
            .as_mut()
            .ok_or_else(|| TransportError::closed("no device currently connected"))?;
        write
            .write_all(bytes)
            .await
            .map_err(|e| TransportError::from_io(&self.endpoint, e))?;
        write.flush().await.map_err(|e| TransportError::from_io(&self.endpoint, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[tokio::test]
    async fn client_reads_what_the_peer_writes() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"hello frames").await.unwrap();
        });

        let mut pair =
            connect_client("127.0.0.1", addr.port(), Duration::from_secs(1)).await.unwrap();
        let mut buf = [0u8; 64];
        let n = pair.source.recv_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello frames");
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        // Bind then drop to get a port nothing is listening on.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = connect_client("127.0.0.1", addr.port(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Refused { .. }));
    }

    #[tokio::test]
    async fn reject_policy_keeps_the_first_peer() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let first = TcpStream::connect(addr).await?;
        let mut pair = accept_first_peer(listener, ListenPolicy::RejectNew).await.unwrap();

        // A second connection arrives and must be dropped.
        let _second = TcpStream::connect(addr).await?;
        let (mut first_read, mut first_write) = first.into_split();

        first_write.write_all(b"still me").await?;
        let mut buf = [0u8; 16];
        let n = pair.source.recv_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"still me");

        // The sink still reaches the first peer.
        pair.sink.send_all(b"ack").await.unwrap();
        let n = first_read.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"ack");
        Ok(())
    }

    #[tokio::test]
    async fn replace_policy_switches_to_the_newcomer() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let _first = TcpStream::connect(addr).await?;
        let mut pair = accept_first_peer(listener, ListenPolicy::ReplaceActive).await.unwrap();

        let mut second = TcpStream::connect(addr).await?;
        second.write_all(b"new device").await?;

        let mut buf = [0u8; 16];
        let n = pair.source.recv_chunk(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"new device");
        Ok(())
    }
}
