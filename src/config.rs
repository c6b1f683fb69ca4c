//! Connection configuration.
//!
//! A [`ConnectionConfig`] is an explicit, immutable value handed to
//! [`PmuConnection::start`](crate::connection::PmuConnection::start). There
//! is no process-wide default or mutable settings singleton; outer tooling
//! that wants persistence serializes this value itself (the types derive
//! serde for that purpose).

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Wire protocol variant spoken by the remote device.
///
/// Selected once at connection start; the variant picks the codec, and the
/// codec is never switched mid-connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// IEEE C37.118-2005 (version 1 frames).
    IeeeC37118V1,
    /// IEEE C37.118.2-2011 (version 2 frames, CFG-3 aware).
    IeeeC37118V2,
    /// IEEE 1344-1995 style framing.
    Ieee1344,
    /// BPA PDCstream style framing (little-endian words).
    BpaPdcStream,
}

impl ProtocolVariant {
    /// Short name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolVariant::IeeeC37118V1 => "IEEE C37.118-2005",
            ProtocolVariant::IeeeC37118V2 => "IEEE C37.118-2011",
            ProtocolVariant::Ieee1344 => "IEEE 1344",
            ProtocolVariant::BpaPdcStream => "BPA PDCstream",
        }
    }
}

impl std::fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Serial line settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    /// Port path, e.g. `/dev/ttyUSB0` or `COM3`.
    pub port: String,
    pub baud_rate: u32,
}

/// What to do when a second device connects while server-listen mode
/// already has an active device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ListenPolicy {
    /// Accept and immediately drop the newcomer; keep the active device.
    #[default]
    RejectNew,
    /// Drop the active device and continue with the newcomer.
    ReplaceActive,
}

/// Transport kind plus its kind-specific parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// Direct serial link to the device.
    Serial(SerialSettings),
    /// Outbound TCP connection to `host:port`.
    TcpClient { host: String, port: u16 },
    /// Bind `interface:port` and wait for the device to connect in.
    TcpServer {
        interface: String,
        port: u16,
        #[serde(default)]
        policy: ListenPolicy,
    },
    /// Bound UDP socket, optionally joined to a multicast group.
    Udp {
        interface: String,
        port: u16,
        /// Multicast group to join, if the device streams to one.
        multicast_group: Option<std::net::Ipv4Addr>,
        /// Where to send commands; defaults to the last observed sender.
        remote: Option<String>,
    },
}

impl TransportKind {
    /// Endpoint string for logs and error context.
    pub fn endpoint(&self) -> String {
        match self {
            TransportKind::Serial(s) => s.port.clone(),
            TransportKind::TcpClient { host, port } => format!("{host}:{port}"),
            TransportKind::TcpServer { interface, port, .. } => format!("{interface}:{port}"),
            TransportKind::Udp { interface, port, .. } => format!("{interface}:{port}"),
        }
    }
}

/// Bounded reconnect policy applied after a transport fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts after the initial failure; 0 disables reconnection.
    pub max_retries: u32,
    /// Delay between attempts.
    pub backoff_ms: u64,
}

impl ReconnectPolicy {
    /// No reconnection: a transport fault leaves the connection in `Error`.
    pub const DISABLED: ReconnectPolicy = ReconnectPolicy { max_retries: 0, backoff_ms: 0 };

    pub fn enabled(&self) -> bool {
        self.max_retries > 0
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::DISABLED
    }
}

/// Immutable configuration for one PMU connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub transport: TransportKind,
    pub protocol: ProtocolVariant,
    /// IDCODE of the device this connection talks to.
    pub device_id: u16,
    /// Upper bound for any single frame; declared lengths beyond this are
    /// rejected without allocation.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// Connect timeout for client transports.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Read idle timeout; `None` waits indefinitely for data.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
}

fn default_max_frame_size() -> usize {
    u16::MAX as usize
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl ConnectionConfig {
    /// Minimal config for the common case: TCP client to a device.
    pub fn tcp_client(
        host: impl Into<String>,
        port: u16,
        protocol: ProtocolVariant,
        device_id: u16,
    ) -> Self {
        Self {
            transport: TransportKind::TcpClient { host: host.into(), port },
            protocol,
            device_id,
            max_frame_size: default_max_frame_size(),
            reconnect: ReconnectPolicy::DISABLED,
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_timeout_ms: None,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}
