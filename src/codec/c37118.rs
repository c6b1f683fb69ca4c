//! IEEE C37.118 codec (2005 version-1 and 2011 version-2 frames).
//!
//! Frame layout (big-endian throughout):
//!
//! ```text
//! offset  0  SYNC        0xAA
//!         1  TYPE/VER    bits 6-4 frame type, bits 3-0 version
//!         2  FRAMESIZE   u16, total bytes including checksum
//!         4  IDCODE      u16, device/stream id
//!         6  SOC         u32, Unix epoch seconds
//!        10  FRACSEC     u32, time quality byte + 24-bit fraction count
//!        14  payload...
//!   len-2    CHK         CRC-CCITT over everything before it
//! ```
//!
//! The configuration frame's FORMAT word selects fixed-point vs floating
//! representation and polar vs rectangular phasors; data frames are decoded
//! accordingly against the configuration active at decode time.

use std::sync::Arc;

use tracing::trace;

use super::crc16::{self, CRC_CCITT, ChecksumOrder};
use super::{FrameCodec, FrameCursor, FrameWriter, SYNC_BYTE, fixed_label, pad_label};
use crate::config::ProtocolVariant;
use crate::error::{DecodeError, FramingError};
use crate::types::{
    AnalogChannel, AnalogKind, CommandCode, CommandFrame, ConfigurationFrame, DataFrame,
    DigitalChannel, FrameHeader, FrameType, NominalFrequency, PhasorChannel, PhasorKind,
    PhasorValue, RawFrameImage, StatusWord, ValueFormat,
};

const HEADER_LEN: usize = 14;
const CHECK_LEN: usize = 2;
/// Largest total length FRAMESIZE can carry.
const MAX_FRAME_LEN: usize = 0xFFFF;

// Frame type nibbles from the TYPE/VER byte.
const TYPE_DATA: u8 = 0;
const TYPE_HEADER: u8 = 1;
const TYPE_CFG1: u8 = 2;
const TYPE_CFG2: u8 = 3;
const TYPE_CMD: u8 = 4;
const TYPE_CFG3: u8 = 5;

/// Codec for IEEE C37.118 frames. Version 2 additionally accepts CFG-3
/// type tags and version-2 sync bytes; both encode with their own version
/// nibble.
pub struct C37118Codec {
    version: u8,
}

impl C37118Codec {
    pub fn version1() -> Self {
        Self { version: 1 }
    }

    pub fn version2() -> Self {
        Self { version: 2 }
    }

    fn frame_type_of(&self, type_byte: u8) -> Option<FrameType> {
        match (type_byte >> 4) & 0x7 {
            TYPE_DATA => Some(FrameType::Data),
            TYPE_HEADER => Some(FrameType::Header),
            TYPE_CFG1 | TYPE_CFG2 => Some(FrameType::Configuration),
            TYPE_CFG3 if self.version >= 2 => Some(FrameType::Configuration),
            TYPE_CMD => Some(FrameType::Command),
            _ => None,
        }
    }

    fn type_byte(&self, nibble: u8) -> u8 {
        (nibble << 4) | self.version
    }

    /// Write the 14-byte common header with a length placeholder at 2.
    fn write_header(&self, w: &mut FrameWriter, nibble: u8, device_id: u16, soc: u32, fracsec: u32) {
        w.u8(SYNC_BYTE);
        w.u8(self.type_byte(nibble));
        w.u16_be(0); // FRAMESIZE, patched once the body is complete
        w.u16_be(device_id);
        w.u32_be(soc);
        w.u32_be(fracsec);
    }

    fn finish(&self, mut w: FrameWriter) -> Result<Vec<u8>, FramingError> {
        let total = w.len() + CHECK_LEN;
        if total > MAX_FRAME_LEN {
            return Err(FramingError::InvalidFrameLength {
                declared: total,
                min: HEADER_LEN + CHECK_LEN,
                max: MAX_FRAME_LEN,
            });
        }
        w.patch_u16_be(2, total as u16);
        let mut frame = w.into_inner();
        crc16::append(&CRC_CCITT, ChecksumOrder::BigEndian, &mut frame);
        Ok(frame)
    }

    fn verify(&self, image: &RawFrameImage) -> Result<(), DecodeError> {
        crc16::verify(&CRC_CCITT, ChecksumOrder::BigEndian, &image.data)
    }
}

impl FrameCodec for C37118Codec {
    fn variant(&self) -> ProtocolVariant {
        if self.version == 1 {
            ProtocolVariant::IeeeC37118V1
        } else {
            ProtocolVariant::IeeeC37118V2
        }
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn min_frame_len(&self) -> usize {
        HEADER_LEN + CHECK_LEN
    }

    fn type_byte_valid(&self, byte: u8) -> bool {
        if byte & 0x80 != 0 {
            return false;
        }
        let version = byte & 0x0F;
        if version == 0 || version > self.version {
            return false;
        }
        self.frame_type_of(byte).is_some()
    }

    fn decode_header(&self, bytes: &[u8]) -> Result<FrameHeader, DecodeError> {
        let mut cursor = FrameCursor::new(bytes, "C37.118 header");
        let sync = cursor.u8()?;
        let type_byte = cursor.u8()?;
        if sync != SYNC_BYTE || !self.type_byte_valid(type_byte) {
            return Err(DecodeError::malformed(
                "C37.118 header",
                format!("bad sync/type bytes {sync:#04x} {type_byte:#04x}"),
            ));
        }
        let frame_type = self.frame_type_of(type_byte).ok_or_else(|| {
            DecodeError::malformed("C37.118 header", format!("unknown frame type {type_byte:#04x}"))
        })?;
        let declared_len = cursor.u16_be()? as usize;
        let device_id = cursor.u16_be()?;
        let soc = cursor.u32_be()?;
        let fracsec = cursor.u32_be()?;
        trace!(frame_type = frame_type.name(), declared_len, device_id, "parsed frame header");
        Ok(FrameHeader { frame_type, declared_len, device_id, soc, fracsec })
    }

    fn decode_configuration(
        &self,
        image: &RawFrameImage,
    ) -> Result<ConfigurationFrame, DecodeError> {
        self.verify(image)?;
        let header = self.decode_header(&image.data)?;

        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "C37.118 configuration frame");
        let time_base = c.u32_be()? & 0x00FF_FFFF;
        let num_pmu = c.u16_be()?;
        if num_pmu != 1 {
            return Err(DecodeError::malformed(
                "C37.118 configuration frame",
                format!("multi-PMU streams not supported (NUM_PMU={num_pmu})"),
            ));
        }

        let station_name = fixed_label(c.take(16)?);
        let device_id = c.u16_be()?;
        let format = ValueFormat::from_word(c.u16_be()?);
        let phnmr = c.u16_be()? as usize;
        let annmr = c.u16_be()? as usize;
        let dgnmr = c.u16_be()? as usize;

        let mut names = Vec::new();
        for _ in 0..phnmr + annmr + dgnmr * 16 {
            names.push(fixed_label(c.take(16)?));
        }
        let mut names = names.into_iter();

        let mut phasors = Vec::new();
        for _ in 0..phnmr {
            let label = names.next().unwrap_or_default();
            let unit = c.u32_be()?;
            let kind = if unit & 0xFF00_0000 == 0 { PhasorKind::Voltage } else { PhasorKind::Current };
            phasors.push(PhasorChannel { label, kind, scale: unit & 0x00FF_FFFF });
        }

        let mut analogs = Vec::new();
        for _ in 0..annmr {
            let label = names.next().unwrap_or_default();
            let unit = c.u32_be()?;
            let kind = match unit >> 24 {
                0 => AnalogKind::SinglePointOnWave,
                1 => AnalogKind::RmsOfAnalogInput,
                _ => AnalogKind::PeakOfAnalogInput,
            };
            // Sign-extend the 24-bit conversion factor.
            let scale = ((unit << 8) as i32) >> 8;
            analogs.push(AnalogChannel { label, kind, scale });
        }

        let mut digitals = Vec::new();
        for _ in 0..dgnmr {
            let bit_labels: Vec<String> = (&mut names).take(16).collect();
            let unit = c.u32_be()?;
            digitals.push(DigitalChannel {
                bit_labels,
                normal_mask: (unit >> 16) as u16,
                valid_mask: unit as u16,
            });
        }

        let fnom = c.u16_be()?;
        let nominal_freq =
            if fnom & 0x0001 != 0 { NominalFrequency::Hz50 } else { NominalFrequency::Hz60 };
        let revision = c.u16_be()?;
        let data_rate = c.i16_be()?;

        Ok(ConfigurationFrame {
            device_id,
            station_name,
            time_base,
            nominal_freq,
            data_rate,
            revision,
            format,
            phasors,
            analogs,
            digitals,
            soc: header.soc,
            fracsec: header.fracsec,
        })
    }

    fn decode_data(
        &self,
        image: &RawFrameImage,
        config: &Arc<ConfigurationFrame>,
    ) -> Result<DataFrame, DecodeError> {
        self.verify(image)?;
        let header = self.decode_header(&image.data)?;
        if !config.matches_device(header.device_id) {
            return Err(DecodeError::MissingConfiguration { device_id: header.device_id });
        }

        let expected = HEADER_LEN + config.data_block_len() + CHECK_LEN;
        if image.len() != expected {
            return Err(DecodeError::malformed(
                "C37.118 data frame",
                format!(
                    "length {} does not match configuration (expected {expected}); \
                     configuration revision may be stale",
                    image.len()
                ),
            ));
        }

        let format = config.format;
        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "C37.118 data frame");
        let status = StatusWord(c.u16_be()?);

        let mut phasors = Vec::with_capacity(config.phasors.len());
        for _ in 0..config.phasors.len() {
            phasors.push(read_phasor(&mut c, format)?);
        }

        let (frequency, rocof) = if format.freq_float {
            (f64::from(c.f32_be()?), f64::from(c.f32_be()?))
        } else {
            (f64::from(c.i16_be()?), f64::from(c.i16_be()?))
        };

        let mut analogs = Vec::with_capacity(config.analogs.len());
        for _ in 0..config.analogs.len() {
            let value = if format.analog_float {
                f64::from(c.f32_be()?)
            } else {
                f64::from(c.i16_be()?)
            };
            analogs.push(value);
        }

        let mut digitals = Vec::with_capacity(config.digitals.len());
        for _ in 0..config.digitals.len() {
            digitals.push(c.u16_be()?);
        }

        Ok(DataFrame {
            device_id: header.device_id,
            soc: header.soc,
            fracsec: header.fracsec,
            status,
            phasors,
            frequency,
            rocof,
            analogs,
            digitals,
            config: Arc::clone(config),
        })
    }

    fn decode_command(&self, image: &RawFrameImage) -> Result<CommandFrame, DecodeError> {
        self.verify(image)?;
        let header = self.decode_header(&image.data)?;
        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "C37.118 command frame");
        let word = c.u16_be()?;
        let code = CommandCode::from_code(word).ok_or_else(|| {
            DecodeError::malformed("C37.118 command frame", format!("unknown command word {word:#06x}"))
        })?;
        let payload = c.take(c.remaining().saturating_sub(CHECK_LEN))?.to_vec();
        Ok(CommandFrame { device_id: header.device_id, code, payload })
    }

    fn decode_header_record(&self, image: &RawFrameImage) -> Result<String, DecodeError> {
        self.verify(image)?;
        if image.len() < self.min_frame_len() {
            return Err(DecodeError::short_read(
                "C37.118 header frame",
                self.min_frame_len(),
                image.len(),
            ));
        }
        let body = &image.data[HEADER_LEN..image.len() - CHECK_LEN];
        Ok(String::from_utf8_lossy(body).into_owned())
    }

    fn encode_command(&self, frame: &CommandFrame) -> Result<Vec<u8>, FramingError> {
        let mut w = FrameWriter::with_capacity(HEADER_LEN + 2 + frame.payload.len() + CHECK_LEN);
        self.write_header(&mut w, TYPE_CMD, frame.device_id, 0, 0);
        w.u16_be(frame.code.code());
        w.bytes(&frame.payload);
        self.finish(w)
    }

    fn encode_configuration(
        &self,
        config: &ConfigurationFrame,
    ) -> Result<Vec<u8>, FramingError> {
        let mut w = FrameWriter::with_capacity(256);
        self.write_header(&mut w, TYPE_CFG2, config.device_id, config.soc, config.fracsec);
        w.u32_be(config.time_base & 0x00FF_FFFF);
        w.u16_be(1); // NUM_PMU
        w.bytes(&pad_label(&config.station_name));
        w.u16_be(config.device_id);
        w.u16_be(config.format.to_word());
        w.u16_be(config.phasors.len() as u16);
        w.u16_be(config.analogs.len() as u16);
        w.u16_be(config.digitals.len() as u16);

        for channel in &config.phasors {
            w.bytes(&pad_label(&channel.label));
        }
        for channel in &config.analogs {
            w.bytes(&pad_label(&channel.label));
        }
        for channel in &config.digitals {
            for bit in 0..16 {
                let label = channel.bit_labels.get(bit).map(String::as_str).unwrap_or("");
                w.bytes(&pad_label(label));
            }
        }

        for channel in &config.phasors {
            let kind = match channel.kind {
                PhasorKind::Voltage => 0u32,
                PhasorKind::Current => 1,
            };
            w.u32_be(kind << 24 | (channel.scale & 0x00FF_FFFF));
        }
        for channel in &config.analogs {
            let kind = match channel.kind {
                AnalogKind::SinglePointOnWave => 0u32,
                AnalogKind::RmsOfAnalogInput => 1,
                AnalogKind::PeakOfAnalogInput => 2,
            };
            w.u32_be(kind << 24 | (channel.scale as u32 & 0x00FF_FFFF));
        }
        for channel in &config.digitals {
            w.u32_be(u32::from(channel.normal_mask) << 16 | u32::from(channel.valid_mask));
        }

        let fnom = match config.nominal_freq {
            NominalFrequency::Hz50 => 1u16,
            NominalFrequency::Hz60 => 0,
        };
        w.u16_be(fnom);
        w.u16_be(config.revision);
        w.i16_be(config.data_rate);
        self.finish(w)
    }

    fn encode_data(&self, frame: &DataFrame) -> Result<Vec<u8>, FramingError> {
        let config = &frame.config;
        let format = config.format;
        let mut w =
            FrameWriter::with_capacity(HEADER_LEN + config.data_block_len() + CHECK_LEN);
        self.write_header(&mut w, TYPE_DATA, frame.device_id, frame.soc, frame.fracsec);
        w.u16_be(frame.status.0);

        for phasor in &frame.phasors {
            write_phasor(&mut w, format, phasor);
        }

        if format.freq_float {
            w.f32_be(frame.frequency as f32);
            w.f32_be(frame.rocof as f32);
        } else {
            w.i16_be(frame.frequency as i16);
            w.i16_be(frame.rocof as i16);
        }

        for &value in &frame.analogs {
            if format.analog_float {
                w.f32_be(value as f32);
            } else {
                w.i16_be(value as i16);
            }
        }

        for &word in &frame.digitals {
            w.u16_be(word);
        }
        self.finish(w)
    }
}

fn read_phasor(c: &mut FrameCursor<'_>, format: ValueFormat) -> Result<PhasorValue, DecodeError> {
    let value = match (format.phasor_float, format.phasor_polar) {
        (true, true) => PhasorValue::Polar {
            magnitude: f64::from(c.f32_be()?),
            angle_rad: f64::from(c.f32_be()?),
        },
        (true, false) => PhasorValue::Rectangular {
            real: f64::from(c.f32_be()?),
            imaginary: f64::from(c.f32_be()?),
        },
        (false, true) => PhasorValue::Polar {
            magnitude: f64::from(c.u16_be()?),
            // Fixed-point angle travels as radians scaled by 1e4.
            angle_rad: f64::from(c.i16_be()?) / 1e4,
        },
        (false, false) => PhasorValue::Rectangular {
            real: f64::from(c.i16_be()?),
            imaginary: f64::from(c.i16_be()?),
        },
    };
    Ok(value)
}

fn write_phasor(w: &mut FrameWriter, format: ValueFormat, value: &PhasorValue) {
    match (format.phasor_float, format.phasor_polar) {
        (true, true) => {
            w.f32_be(value.magnitude() as f32);
            w.f32_be(value.angle_rad() as f32);
        }
        (true, false) => match *value {
            PhasorValue::Rectangular { real, imaginary } => {
                w.f32_be(real as f32);
                w.f32_be(imaginary as f32);
            }
            PhasorValue::Polar { magnitude, angle_rad } => {
                w.f32_be((magnitude * angle_rad.cos()) as f32);
                w.f32_be((magnitude * angle_rad.sin()) as f32);
            }
        },
        (false, true) => {
            w.u16_be(value.magnitude().round() as u16);
            w.i16_be((value.angle_rad() * 1e4).round() as i16);
        }
        (false, false) => match *value {
            PhasorValue::Rectangular { real, imaginary } => {
                w.i16_be(real.round() as i16);
                w.i16_be(imaginary.round() as i16);
            }
            PhasorValue::Polar { magnitude, angle_rad } => {
                w.i16_be((magnitude * angle_rad.cos()).round() as i16);
                w.i16_be((magnitude * angle_rad.sin()).round() as i16);
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::{sample_config, sample_data};
    use bytes::Bytes;

    fn image_of(bytes: Vec<u8>, frame_type: FrameType) -> RawFrameImage {
        RawFrameImage::new(Bytes::from(bytes), frame_type)
    }

    #[test]
    fn configuration_round_trip() {
        let codec = C37118Codec::version2();
        let config = sample_config(7, ValueFormat::default());
        let encoded = codec.encode_configuration(&config).unwrap();

        let header = codec.decode_header(&encoded).unwrap();
        assert_eq!(header.frame_type, FrameType::Configuration);
        assert_eq!(header.declared_len, encoded.len());
        assert_eq!(header.device_id, 7);

        let decoded = codec
            .decode_configuration(&image_of(encoded, FrameType::Configuration))
            .unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn data_round_trip_fixed_and_float() {
        for format in [
            ValueFormat::default(),
            ValueFormat { phasor_polar: true, phasor_float: false, analog_float: false, freq_float: false },
            ValueFormat { phasor_polar: false, phasor_float: true, analog_float: true, freq_float: true },
            ValueFormat { phasor_polar: true, phasor_float: true, analog_float: true, freq_float: true },
        ] {
            let codec = C37118Codec::version1();
            let config = Arc::new(sample_config(7, format));
            let frame = sample_data(&config);
            let encoded = codec.encode_data(&frame).unwrap();

            let decoded = codec
                .decode_data(&image_of(encoded, FrameType::Data), &config)
                .unwrap();
            assert_eq!(decoded.status, frame.status);
            assert_eq!(decoded.digitals, frame.digitals);
            assert_eq!(decoded.phasors.len(), frame.phasors.len());
            for (a, b) in decoded.phasors.iter().zip(&frame.phasors) {
                assert!((a.magnitude() - b.magnitude()).abs() < 1.0);
                assert!((a.angle_rad() - b.angle_rad()).abs() < 1e-3);
            }
        }
    }

    #[test]
    fn command_round_trip_with_payload() {
        let codec = C37118Codec::version2();
        let frame =
            CommandFrame::with_payload(42, CommandCode::Extended, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let encoded = codec.encode_command(&frame).unwrap();
        assert_eq!(encoded.len(), 14 + 2 + 4 + 2);

        let decoded = codec.decode_command(&image_of(encoded, FrameType::Command)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn corrupted_checksum_is_a_value_not_a_crash() {
        let codec = C37118Codec::version1();
        let config = Arc::new(sample_config(7, ValueFormat::default()));
        let mut encoded = codec.encode_data(&sample_data(&config)).unwrap();
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        let err = codec
            .decode_data(&image_of(encoded, FrameType::Data), &config)
            .unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn mismatched_device_yields_missing_configuration() {
        let codec = C37118Codec::version1();
        let config_a = Arc::new(sample_config(1, ValueFormat::default()));
        let config_b = Arc::new(sample_config(2, ValueFormat::default()));
        let encoded = codec.encode_data(&sample_data(&config_b)).unwrap();

        let err = codec
            .decode_data(&image_of(encoded, FrameType::Data), &config_a)
            .unwrap_err();
        assert!(matches!(err, DecodeError::MissingConfiguration { device_id: 2 }));
    }

    #[test]
    fn multi_pmu_configuration_is_rejected() {
        let codec = C37118Codec::version2();
        let mut encoded =
            codec.encode_configuration(&sample_config(7, ValueFormat::default())).unwrap();
        // NUM_PMU lives right after TIME_BASE at offset 18.
        encoded[18..20].copy_from_slice(&4u16.to_be_bytes());
        let body_len = encoded.len() - 2;
        let check = crc16::compute(&CRC_CCITT, &encoded[..body_len]);
        encoded[body_len..].copy_from_slice(&check.to_be_bytes());

        let err = codec
            .decode_configuration(&image_of(encoded, FrameType::Configuration))
            .unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }

    #[test]
    fn version1_rejects_cfg3_type_byte() {
        let v1 = C37118Codec::version1();
        let v2 = C37118Codec::version2();
        let cfg3_v2 = (TYPE_CFG3 << 4) | 2;
        assert!(!v1.type_byte_valid(cfg3_v2));
        assert!(v2.type_byte_valid(cfg3_v2));
    }

    #[test]
    fn header_record_decodes_ascii() {
        let codec = C37118Codec::version1();
        let mut w = FrameWriter::with_capacity(64);
        codec.write_header(&mut w, TYPE_HEADER, 7, 0, 0);
        w.bytes(b"PMU STATION A, FIRMWARE 3.1");
        let encoded = codec.finish(w).unwrap();

        let text = codec.decode_header_record(&image_of(encoded, FrameType::Header)).unwrap();
        assert_eq!(text, "PMU STATION A, FIRMWARE 3.1");
    }

    #[test]
    fn short_header_record_is_an_error_not_a_panic() {
        let codec = C37118Codec::version1();
        // Two bytes plus a matching checksum: the CRC verifies but the
        // image is far too short to hold a header.
        let mut bytes = vec![SYNC_BYTE, 0x11];
        let check = crc16::compute(&CRC_CCITT, &bytes);
        bytes.extend_from_slice(&check.to_be_bytes());

        let err = codec.decode_header_record(&image_of(bytes, FrameType::Header)).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedPayload { .. }));
    }
}
