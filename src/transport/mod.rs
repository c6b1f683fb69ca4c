//! Byte transports: TCP client, TCP server, UDP, and serial.
//!
//! Every transport reduces to the same pair of capabilities: a
//! [`ByteSource`] the connection driver reads chunks from and a
//! [`ByteSink`] it writes encoded command frames to. Chunk boundaries
//! carry no meaning; frame reassembly happens above this layer.
//!
//! [`establish`] performs the kind-specific setup (connect, bind+accept,
//! bind+join, or open) and classifies I/O failures into
//! [`TransportError`](crate::error::TransportError) values.

use async_trait::async_trait;

use crate::config::{ConnectionConfig, TransportKind};
use crate::error::TransportError;

pub(crate) mod serial;
pub(crate) mod tcp;
pub(crate) mod udp;

/// Receiving half of an established transport.
#[async_trait]
pub trait ByteSource: Send {
    /// Read one chunk into `buf`, returning the byte count (always > 0).
    ///
    /// Orderly or abrupt closure of the peer surfaces as an `Err`; this is
    /// how the connection driver learns the transport is gone.
    async fn recv_chunk(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Sending half of an established transport.
#[async_trait]
pub trait ByteSink: Send {
    /// Write the whole buffer, flushing where the transport buffers.
    async fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;
}

/// Both halves of an established transport.
pub struct TransportPair {
    pub source: Box<dyn ByteSource>,
    pub sink: Box<dyn ByteSink>,
}

impl std::fmt::Debug for TransportPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPair").finish_non_exhaustive()
    }
}

/// Set up the configured transport and hand back its two halves.
///
/// For client kinds this connects (bounded by the connect timeout); for
/// the TCP server kind it binds and waits for the first inbound peer; for
/// UDP it binds and optionally joins the multicast group.
pub async fn establish(config: &ConnectionConfig) -> Result<TransportPair, TransportError> {
    match &config.transport {
        TransportKind::TcpClient { host, port } => {
            tcp::connect_client(host, *port, config.connect_timeout()).await
        }
        TransportKind::TcpServer { interface, port, policy } => {
            let listener = tcp::bind_server(interface, *port).await?;
            tcp::accept_first_peer(listener, *policy).await
        }
        TransportKind::Udp { interface, port, multicast_group, remote } => {
            udp::bind(interface, *port, *multicast_group, remote.as_deref()).await
        }
        TransportKind::Serial(settings) => serial::open(settings),
    }
}
