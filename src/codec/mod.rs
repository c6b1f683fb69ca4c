//! Protocol codecs: one implementation per supported wire protocol.
//!
//! Every codec exposes the same capability set, selected once at connection
//! start via [`for_variant`]. The variants differ in byte order, checksum
//! algorithm, header layout, and fixed-point vs floating-point value
//! representation:
//!
//! | Variant | Byte order | Checksum | Header | Values |
//! |---------|-----------|----------|--------|--------|
//! | IEEE C37.118 v1/v2 | big-endian | CRC-CCITT | 14 bytes | fixed or float per FORMAT |
//! | IEEE 1344 | big-endian | CRC-16/ARC | 8 bytes, length packed in sample word | fixed rectangular |
//! | BPA PDCstream | little-endian | CRC-16/XMODEM | 12 bytes, word-counted length | fixed rectangular |
//!
//! Checksum failure is an ordinary [`DecodeError::ChecksumMismatch`] result
//! value so the caller can count it and keep decoding subsequent frames.

use std::sync::Arc;

use crate::config::ProtocolVariant;
use crate::error::{DecodeError, FramingError};
use crate::types::{
    CommandFrame, ConfigurationFrame, DataFrame, FrameHeader, RawFrameImage,
};

pub(crate) mod c37118;
pub(crate) mod crc16;
pub(crate) mod ieee1344;
pub(crate) mod pdcstream;

/// All supported frames lead with this sync byte; the byte after it
/// distinguishes variant, frame type, and revision.
pub const SYNC_BYTE: u8 = 0xAA;

/// Common capability set of a wire protocol implementation.
///
/// `decode_header` is cheap and is what the reassembler calls while
/// scanning; the full `decode_*` methods verify the checksum before
/// touching the payload.
pub trait FrameCodec: Send + Sync {
    fn variant(&self) -> ProtocolVariant;

    /// Bytes needed before `decode_header` can run.
    fn header_len(&self) -> usize;

    /// Smallest frame this variant can legally declare.
    fn min_frame_len(&self) -> usize;

    /// Whether `byte` is plausible as the byte following the sync byte.
    /// Used to reject sync-like bytes inside payload data.
    fn type_byte_valid(&self, byte: u8) -> bool;

    /// Decode the common header; input must be at least `header_len()`.
    fn decode_header(&self, bytes: &[u8]) -> Result<FrameHeader, DecodeError>;

    fn decode_configuration(&self, image: &RawFrameImage)
    -> Result<ConfigurationFrame, DecodeError>;

    fn decode_data(
        &self,
        image: &RawFrameImage,
        config: &Arc<ConfigurationFrame>,
    ) -> Result<DataFrame, DecodeError>;

    fn decode_command(&self, image: &RawFrameImage) -> Result<CommandFrame, DecodeError>;

    /// Decode an ASCII header-record frame into its text payload.
    fn decode_header_record(&self, image: &RawFrameImage) -> Result<String, DecodeError>;

    /// Encode a command frame, checksum footer included. Encoding fails
    /// when the body would not fit the variant's length field.
    fn encode_command(&self, frame: &CommandFrame) -> Result<Vec<u8>, FramingError>;

    /// Encode a configuration frame in the variant's native layout. Used by
    /// the snapshot collaborator and by test fixtures.
    fn encode_configuration(&self, config: &ConfigurationFrame)
    -> Result<Vec<u8>, FramingError>;

    /// Encode a data frame. Used by test fixtures and stream simulation.
    fn encode_data(&self, frame: &DataFrame) -> Result<Vec<u8>, FramingError>;

    /// Offset of the first plausible sync position in `buf`, if any.
    ///
    /// A trailing lone sync byte counts: the type byte may simply not have
    /// arrived yet, and the reassembler will re-check with more data.
    fn locate_sync(&self, buf: &[u8]) -> Option<usize> {
        let mut from = 0;
        while let Some(rel) = buf[from..].iter().position(|&b| b == SYNC_BYTE) {
            let pos = from + rel;
            match buf.get(pos + 1) {
                Some(&next) if self.type_byte_valid(next) => return Some(pos),
                None => return Some(pos),
                Some(_) => from = pos + 1,
            }
        }
        None
    }
}

/// Select the codec for a configured protocol variant.
pub fn for_variant(variant: ProtocolVariant) -> Arc<dyn FrameCodec> {
    match variant {
        ProtocolVariant::IeeeC37118V1 => Arc::new(c37118::C37118Codec::version1()),
        ProtocolVariant::IeeeC37118V2 => Arc::new(c37118::C37118Codec::version2()),
        ProtocolVariant::Ieee1344 => Arc::new(ieee1344::Ieee1344Codec),
        ProtocolVariant::BpaPdcStream => Arc::new(pdcstream::PdcStreamCodec),
    }
}

/// Bounds-checked forward reader over a frame image.
///
/// Every accessor returns `DecodeError::MalformedPayload` on a short read
/// instead of panicking, so corrupted frames degrade to counted faults.
pub(crate) struct FrameCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    context: &'static str,
}

impl<'a> FrameCursor<'a> {
    pub fn new(buf: &'a [u8], context: &'static str) -> Self {
        Self { buf, pos: 0, context }
    }

    pub fn at(buf: &'a [u8], pos: usize, context: &'static str) -> Self {
        Self { buf, pos, context }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::short_read(self.context, n, self.remaining()));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16_be(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u16_le(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn i16_be(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16_be()? as i16)
    }

    pub fn i16_le(&mut self) -> Result<i16, DecodeError> {
        Ok(self.u16_le()? as i16)
    }

    pub fn u32_be(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u32_le(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn f32_be(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_bits(self.u32_be()?))
    }
}

/// Append-only frame builder; the checksum footer goes on last.
pub(crate) struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { buf: Vec::with_capacity(capacity) }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn u16_be(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32_be(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn i16_be(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn i16_le(&mut self, v: i16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn f32_be(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }

    pub fn bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Patch a big-endian length field written earlier as a placeholder.
    pub fn patch_u16_be(&mut self, offset: usize, v: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&v.to_be_bytes());
    }

    pub fn patch_u16_le(&mut self, offset: usize, v: u16) {
        self.buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Decode a fixed-width, space/NUL-padded channel or station label.
pub(crate) fn fixed_label(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0 && b != b' ').map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Encode a label into a fixed 16-byte, space-padded field.
pub(crate) fn pad_label(label: &str) -> [u8; 16] {
    let mut out = [b' '; 16];
    let bytes = label.as_bytes();
    let n = bytes.len().min(16);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::types::{
        AnalogChannel, AnalogKind, ConfigurationFrame, DataFrame, DigitalChannel,
        NominalFrequency, PhasorChannel, PhasorKind, PhasorValue, StatusWord, ValueFormat,
    };

    /// Two phasors, one analog, one digital word; values chosen to be
    /// exactly representable in the fixed-point encodings.
    pub fn sample_config(device_id: u16, format: ValueFormat) -> ConfigurationFrame {
        ConfigurationFrame {
            device_id,
            station_name: "STATION A".into(),
            time_base: 1_000_000,
            nominal_freq: NominalFrequency::Hz60,
            data_rate: 30,
            revision: 3,
            format,
            phasors: vec![
                PhasorChannel { label: "VA".into(), kind: PhasorKind::Voltage, scale: 915_527 },
                PhasorChannel { label: "IA".into(), kind: PhasorKind::Current, scale: 45_776 },
            ],
            analogs: vec![AnalogChannel {
                label: "ANALOG1".into(),
                kind: AnalogKind::RmsOfAnalogInput,
                scale: -5,
            }],
            digitals: vec![DigitalChannel {
                bit_labels: (0..16).map(|i| format!("BREAKER{i}")).collect(),
                normal_mask: 0x0001,
                valid_mask: 0x00FF,
            }],
            soc: 1_700_000_000,
            fracsec: 500_000,
        }
    }

    pub fn sample_data(config: &Arc<ConfigurationFrame>) -> DataFrame {
        let phasor = |index: usize| {
            if config.format.phasor_polar {
                PhasorValue::Polar { magnitude: 14_000.0 + index as f64, angle_rad: 0.5 }
            } else {
                PhasorValue::Rectangular { real: 1_200.0, imaginary: -345.0 - index as f64 }
            }
        };
        DataFrame {
            device_id: config.device_id,
            soc: 1_700_000_123,
            fracsec: 250_000,
            status: StatusWord(0),
            phasors: (0..config.phasors.len()).map(phasor).collect(),
            frequency: if config.format.freq_float { 60.01 } else { 24.0 },
            rocof: if config.format.freq_float { 0.002 } else { 3.0 },
            analogs: vec![41.0; config.analogs.len()],
            digitals: vec![0x1234; config.digitals.len()],
            config: Arc::clone(config),
        }
    }
}
