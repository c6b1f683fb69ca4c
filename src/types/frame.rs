//! Raw frame images and the common header every codec exposes.

use bytes::Bytes;
use std::time::SystemTime;

/// Frame families shared by all supported protocol variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Real-time measurement frame.
    Data,
    /// Human-readable device description (ASCII payload).
    Header,
    /// Channel layout and scaling description.
    Configuration,
    /// Control message.
    Command,
}

impl FrameType {
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Data => "data",
            FrameType::Header => "header",
            FrameType::Configuration => "configuration",
            FrameType::Command => "command",
        }
    }
}

/// Fields every variant's common header yields before full decode.
///
/// The reassembler uses `declared_len` to know how many bytes to wait for;
/// the connection uses `frame_type` to dispatch the complete image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub frame_type: FrameType,
    /// Total frame length in bytes, checksum included.
    pub declared_len: usize,
    /// Device IDCODE carried in the header.
    pub device_id: u16,
    /// Second-of-century timestamp (Unix epoch seconds).
    pub soc: u32,
    /// Fraction-of-second word, time-quality bits included.
    pub fracsec: u32,
}

/// One complete, length-exact frame as sliced out of the byte stream.
///
/// Transient: exists between reassembly and decode. The byte length always
/// equals the protocol's declared frame length; anything else was rejected
/// during reassembly.
#[derive(Debug, Clone)]
pub struct RawFrameImage {
    pub data: Bytes,
    pub frame_type: FrameType,
    pub received_at: SystemTime,
}

impl RawFrameImage {
    pub fn new(data: Bytes, frame_type: FrameType) -> Self {
        Self { data, frame_type, received_at: SystemTime::now() }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
