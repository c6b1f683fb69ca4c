//! Error types for synchrophasor stream processing.
//!
//! The taxonomy separates the four failure domains a connection can hit:
//!
//! - **Transport errors**: socket/serial faults that end or prevent a
//!   connection. These change connection state.
//! - **Framing errors**: the byte stream cannot be carved into frames.
//!   Recoverable; processing resumes at the next sync search.
//! - **Decode errors**: a complete frame image fails to decode (bad
//!   checksum, missing configuration, malformed payload). Recoverable.
//! - **Protocol errors**: caller misuse of the connection surface.
//!
//! All four fold into [`PmuError`], the crate-level error type. Recoverable
//! failures are counted and surfaced as exactly one `Fault` event each;
//! they never tear down the connection.
//!
//! ```rust
//! use gridscope::{PmuError, TransportError};
//!
//! let error: PmuError = TransportError::Timeout { waited_ms: 5000 }.into();
//! assert!(error.is_retryable());
//! ```

use std::time::Duration;
use thiserror::Error;

/// Result type alias for synchrophasor operations.
pub type Result<T, E = PmuError> = std::result::Result<T, E>;

/// Transport-level failures. These terminate (or prevent) a connection and
/// move the state machine to `Error`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TransportError {
    #[error("connection refused by {endpoint}")]
    Refused {
        endpoint: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("transport timed out after {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    #[error("address already in use: {endpoint}")]
    AddressInUse { endpoint: String },

    #[error("transport closed: {reason}")]
    Closed {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },
}

/// Stream framing failures. Recoverable: the reassembler resets or resyncs
/// and continues with subsequent bytes.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FramingError {
    #[error("receive buffer exceeded {limit} bytes without a valid sync pattern")]
    OversizedStream { limit: usize },

    #[error("declared frame length {declared} outside valid range {min}..={max}")]
    InvalidFrameLength { declared: usize, min: usize, max: usize },

    #[error("discarded {discarded} bytes searching for sync pattern")]
    SyncLost { discarded: usize },
}

/// Frame decode failures. Recoverable: the offending frame is dropped (or
/// retained, for `MissingConfiguration`) and decoding continues.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("checksum mismatch: frame carries {received:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { received: u16, computed: u16 },

    #[error("no configuration held for device {device_id}")]
    MissingConfiguration { device_id: u16 },

    #[error("malformed {context}: {details}")]
    MalformedPayload { context: &'static str, details: String },
}

/// Caller misuse of the connection surface. Returned synchronously, never
/// via the event channel alone.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("command {code:#06x} is not supported by protocol variant {variant}")]
    UnsupportedCommand { code: u16, variant: &'static str },

    #[error("connection is {state}, not Connected")]
    NotConnected { state: &'static str },
}

/// Crate-level error type folding all failure domains together.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum PmuError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("configuration snapshot rejected: {reason}")]
    Snapshot { reason: String },
}

impl DecodeError {
    /// Helper constructor for malformed-payload errors.
    pub fn malformed(context: &'static str, details: impl Into<String>) -> Self {
        DecodeError::MalformedPayload { context, details: details.into() }
    }

    /// Helper constructor for truncated reads during field extraction.
    pub fn short_read(context: &'static str, need: usize, have: usize) -> Self {
        DecodeError::MalformedPayload {
            context,
            details: format!("need {need} bytes, have {have}"),
        }
    }
}

impl TransportError {
    /// Classify an I/O error from a connect or read/write path.
    pub fn from_io(endpoint: impl Into<String>, err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => {
                TransportError::Refused { endpoint: endpoint.into(), source: Some(err) }
            }
            ErrorKind::AddrInUse => TransportError::AddressInUse { endpoint: endpoint.into() },
            ErrorKind::TimedOut => TransportError::Timeout { waited_ms: 0 },
            _ => TransportError::Closed { reason: err.kind().to_string(), source: Some(err) },
        }
    }

    /// Helper constructor for timeouts with a known bound.
    pub fn timed_out(waited: Duration) -> Self {
        TransportError::Timeout { waited_ms: waited.as_millis() as u64 }
    }

    /// Helper constructor for orderly or unexplained closure.
    pub fn closed(reason: impl Into<String>) -> Self {
        TransportError::Closed { reason: reason.into(), source: None }
    }
}

impl PmuError {
    /// Returns whether this error is potentially recoverable through retry
    /// or by continuing with subsequent frames.
    pub fn is_retryable(&self) -> bool {
        match self {
            // A refused or timed-out transport may succeed on reconnect.
            PmuError::Transport(TransportError::Refused { .. }) => true,
            PmuError::Transport(TransportError::Timeout { .. }) => true,
            PmuError::Transport(TransportError::Closed { .. }) => true,
            PmuError::Transport(TransportError::AddressInUse { .. }) => false,
            // Framing and decode failures never end the stream.
            PmuError::Framing(_) => true,
            PmuError::Decode(_) => true,
            PmuError::Protocol(_) => false,
            PmuError::Snapshot { .. } => false,
        }
    }

    /// Returns true when this error must move the connection state machine
    /// to `Error` (transport faults), as opposed to being reported and
    /// skipped (framing/decode faults).
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, PmuError::Transport(_))
    }
}
