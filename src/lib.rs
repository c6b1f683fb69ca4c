//! Asynchronous access to synchrophasor (PMU) data streams.
//!
//! Gridscope speaks the historical binary wire protocols phasor
//! measurement units use (IEEE C37.118 in its 2005 and 2011 revisions,
//! IEEE 1344, and BPA PDCstream) over TCP, UDP, and serial transports.
//! It reassembles frames from arbitrarily chunked byte streams, validates
//! checksums, decodes configuration and data frames, and runs the
//! connection lifecycle in a background task so callers never block.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use gridscope::{ConnectionConfig, Gridscope, PmuEvent, ProtocolVariant};
//!
//! #[tokio::main]
//! async fn main() -> gridscope::Result<()> {
//!     let config = ConnectionConfig::tcp_client(
//!         "10.0.0.5",
//!         4712,
//!         ProtocolVariant::IeeeC37118V2,
//!         7,
//!     );
//!     let mut connection = Gridscope::connect(config).await?;
//!
//!     while let Some(event) = connection.next_event().await {
//!         match event {
//!             PmuEvent::DataReceived(frame) => {
//!                 let set = gridscope::measure::derive(&frame);
//!                 println!("{} {:.3} Hz", set.station_name, set.frequency_hz);
//!             }
//!             PmuEvent::Fault(error) => eprintln!("fault: {error}"),
//!             _ => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
mod error;
pub mod framing;
pub mod measure;
pub mod snapshot;
pub mod transport;
pub mod types;

pub use config::{
    ConnectionConfig, ListenPolicy, ProtocolVariant, ReconnectPolicy, SerialSettings,
    TransportKind,
};
pub use connection::{ConnectionStats, EventStream, PmuConnection, PmuEvent};
pub use error::{
    DecodeError, FramingError, PmuError, ProtocolError, Result, TransportError,
};
pub use measure::{MeasurementSet, Quality};
pub use types::*;

/// Entry point for opening PMU connections.
///
/// A thin factory over [`PmuConnection::start`]; the handle it returns
/// owns the background driver task.
pub struct Gridscope;

impl Gridscope {
    /// Start a connection with the given configuration.
    ///
    /// With no reconnect policy, transport failures surface here; with
    /// one, retries happen in the background and the returned handle
    /// reports progress through its events.
    pub async fn connect(config: ConnectionConfig) -> Result<PmuConnection> {
        PmuConnection::start(config).await
    }

    /// Start a connection seeded with a previously saved configuration
    /// snapshot, letting data frames decode before (or without) a live
    /// configuration exchange.
    pub async fn connect_with_snapshot(
        config: ConnectionConfig,
        snapshot: ConfigurationFrame,
    ) -> Result<PmuConnection> {
        PmuConnection::start_with_snapshot(config, snapshot).await
    }
}
