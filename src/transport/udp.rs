//! UDP transport: bound datagram socket, optionally multicast-joined.
//!
//! Frames usually arrive one per datagram, but nothing here assumes that;
//! received bytes go through the same reassembler as the stream
//! transports. Commands go to the configured remote when one is set,
//! otherwise back to the most recently observed sender.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use super::{ByteSink, ByteSource, TransportPair};
use crate::error::TransportError;

pub(crate) async fn bind(
    interface: &str,
    port: u16,
    multicast_group: Option<Ipv4Addr>,
    remote: Option<&str>,
) -> Result<TransportPair, TransportError> {
    let endpoint = format!("{interface}:{port}");
    let socket = UdpSocket::bind(&endpoint)
        .await
        .map_err(|e| TransportError::from_io(&endpoint, e))?;

    if let Some(group) = multicast_group {
        let local: Ipv4Addr = interface.parse().unwrap_or(Ipv4Addr::UNSPECIFIED);
        socket
            .join_multicast_v4(group, local)
            .map_err(|e| TransportError::from_io(&endpoint, e))?;
        debug!(%group, "joined multicast group");
    }

    wrap(socket, remote, endpoint).await
}

/// Build the source/sink pair around an already-bound socket.
async fn wrap(
    socket: UdpSocket,
    remote: Option<&str>,
    endpoint: String,
) -> Result<TransportPair, TransportError> {
    let remote = match remote {
        Some(host) => Some(resolve(host).await?),
        None => None,
    };

    let socket = Arc::new(socket);
    let last_sender = Arc::new(Mutex::new(None));
    Ok(TransportPair {
        source: Box::new(UdpSource {
            socket: Arc::clone(&socket),
            last_sender: Arc::clone(&last_sender),
            endpoint: endpoint.clone(),
        }),
        sink: Box::new(UdpSink { socket, remote, last_sender, endpoint }),
    })
}

async fn resolve(host: &str) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host(host)
        .await
        .map_err(|e| TransportError::from_io(host, e))?;
    addrs
        .next()
        .ok_or_else(|| TransportError::closed(format!("cannot resolve remote {host}")))
}

struct UdpSource {
    socket: Arc<UdpSocket>,
    last_sender: Arc<Mutex<Option<SocketAddr>>>,
    endpoint: String,
}

#[async_trait]
impl ByteSource for UdpSource {
    async fn recv_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        loop {
            let (n, sender) = self
                .socket
                .recv_from(buf)
                .await
                .map_err(|e| TransportError::from_io(&self.endpoint, e))?;
            if n == 0 {
                continue; // empty datagram carries nothing to reassemble
            }
            if let Ok(mut guard) = self.last_sender.lock() {
                *guard = Some(sender);
            }
            return Ok(n);
        }
    }
}

struct UdpSink {
    socket: Arc<UdpSocket>,
    remote: Option<SocketAddr>,
    last_sender: Arc<Mutex<Option<SocketAddr>>>,
    endpoint: String,
}

#[async_trait]
impl ByteSink for UdpSink {
    async fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let dest = match self.remote {
            Some(addr) => addr,
            None => self
                .last_sender
                .lock()
                .ok()
                .and_then(|guard| *guard)
                .ok_or_else(|| TransportError::closed("no remote known for commands yet"))?,
        };
        self.socket
            .send_to(bytes, dest)
            .await
            .map_err(|e| TransportError::from_io(&self.endpoint, e))
            .map(|_| ())
    }
}
