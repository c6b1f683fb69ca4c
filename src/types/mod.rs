//! Core types for synchrophasor frame representation.
//!
//! The data model mirrors the wire protocols' frame families:
//! - [`RawFrameImage`] is a complete, length-exact frame as carved from the
//!   byte stream by the reassembler, not yet decoded.
//! - [`ConfigurationFrame`] describes the channel layout and scaling a
//!   device uses in subsequent data frames. Immutable once decoded and
//!   shared via `Arc`; a newer configuration replaces it, never mutates it.
//! - [`DataFrame`] carries one measurement instant and an `Arc` reference
//!   to the configuration that was active at decode time, so replacing the
//!   configuration never reinterprets already-decoded frames.
//! - [`CommandFrame`] is the outbound (and occasionally inbound) control
//!   message family.

mod command;
mod config_frame;
mod data_frame;
mod frame;
mod state;

pub use command::{CommandCode, CommandFrame};
pub use config_frame::{
    AnalogChannel, AnalogKind, ConfigurationFrame, DigitalChannel, NominalFrequency,
    PhasorChannel, PhasorKind, ValueFormat,
};
pub use data_frame::{DataFrame, PhasorValue, StatusWord};
pub use frame::{FrameHeader, FrameType, RawFrameImage};
pub use state::ConnectionState;
