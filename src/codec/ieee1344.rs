//! IEEE 1344 codec.
//!
//! The oldest supported variant: big-endian, CRC-16/ARC, a compact 8-byte
//! header with the declared frame length packed into the low 11 bits of
//! the sample-count word, fixed-point rectangular phasors only, and no
//! analog channels.
//!
//! ```text
//! offset  0  SYNC     0xAA
//!         1  TYPE     bits 7-6 frame type, bits 5-0 zero
//!         2  SOC      u32
//!         6  SMPCNT   u16, bits 15-11 sample sequence, bits 10-0 length
//!   len-2    CHK      CRC-16/ARC
//! ```
//!
//! Data frames carry no device id; links are point-to-point, so data
//! decodes against whatever configuration the connection holds.

use std::sync::Arc;

use super::crc16::{self, CRC_ARC, ChecksumOrder};
use super::{FrameCodec, FrameCursor, FrameWriter, SYNC_BYTE, fixed_label, pad_label};
use crate::config::ProtocolVariant;
use crate::error::{DecodeError, FramingError};
use crate::types::{
    CommandCode, CommandFrame, ConfigurationFrame, DataFrame, DigitalChannel, FrameHeader,
    FrameType, NominalFrequency, PhasorChannel, PhasorKind, PhasorValue, RawFrameImage,
    StatusWord, ValueFormat,
};

const HEADER_LEN: usize = 8;
const CHECK_LEN: usize = 2;
/// Largest length the 11-bit field can declare.
pub const MAX_DECLARED_LEN: usize = 0x07FF;

const TYPE_DATA: u8 = 0b00;
const TYPE_HEADER: u8 = 0b01;
const TYPE_CFG: u8 = 0b10;
const TYPE_CMD: u8 = 0b11;

pub struct Ieee1344Codec;

impl Ieee1344Codec {
    fn frame_type_of(type_byte: u8) -> FrameType {
        match type_byte >> 6 {
            TYPE_DATA => FrameType::Data,
            TYPE_HEADER => FrameType::Header,
            TYPE_CFG => FrameType::Configuration,
            _ => FrameType::Command,
        }
    }

    fn write_header(&self, w: &mut FrameWriter, type_bits: u8, soc: u32) {
        w.u8(SYNC_BYTE);
        w.u8(type_bits << 6);
        w.u32_be(soc);
        w.u16_be(0); // SMPCNT, length patched in once the body is complete
    }

    fn finish(&self, mut w: FrameWriter, sequence: u16) -> Result<Vec<u8>, FramingError> {
        let total = w.len() + CHECK_LEN;
        if total > MAX_DECLARED_LEN {
            return Err(FramingError::InvalidFrameLength {
                declared: total,
                min: HEADER_LEN + CHECK_LEN,
                max: MAX_DECLARED_LEN,
            });
        }
        w.patch_u16_be(6, (sequence << 11) | total as u16);
        let mut frame = w.into_inner();
        crc16::append(&CRC_ARC, ChecksumOrder::BigEndian, &mut frame);
        Ok(frame)
    }

    fn verify(&self, image: &RawFrameImage) -> Result<(), DecodeError> {
        crc16::verify(&CRC_ARC, ChecksumOrder::BigEndian, &image.data)
    }
}

impl FrameCodec for Ieee1344Codec {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::Ieee1344
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn min_frame_len(&self) -> usize {
        HEADER_LEN + CHECK_LEN
    }

    fn type_byte_valid(&self, byte: u8) -> bool {
        byte & 0x3F == 0
    }

    fn decode_header(&self, bytes: &[u8]) -> Result<FrameHeader, DecodeError> {
        let mut cursor = FrameCursor::new(bytes, "IEEE 1344 header");
        let sync = cursor.u8()?;
        let type_byte = cursor.u8()?;
        if sync != SYNC_BYTE || !self.type_byte_valid(type_byte) {
            return Err(DecodeError::malformed(
                "IEEE 1344 header",
                format!("bad sync/type bytes {sync:#04x} {type_byte:#04x}"),
            ));
        }
        let soc = cursor.u32_be()?;
        let smpcnt = cursor.u16_be()?;
        Ok(FrameHeader {
            frame_type: Self::frame_type_of(type_byte),
            declared_len: usize::from(smpcnt & 0x07FF),
            // Data frames carry no device id on this variant.
            device_id: 0,
            soc,
            fracsec: u32::from(smpcnt >> 11),
        })
    }

    fn decode_configuration(
        &self,
        image: &RawFrameImage,
    ) -> Result<ConfigurationFrame, DecodeError> {
        self.verify(image)?;
        let header = self.decode_header(&image.data)?;

        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "IEEE 1344 configuration frame");
        let station_name = fixed_label(c.take(16)?);
        let device_id = c.u16_be()?;
        let phnmr = c.u16_be()? as usize;
        let dgnmr = c.u16_be()? as usize;

        let mut names = Vec::new();
        for _ in 0..phnmr + dgnmr * 16 {
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
        let revision = c.u16_be()?;
        let data_rate = c.i16_be()?;

        Ok(ConfigurationFrame {
            device_id,
            station_name,
            // Data-frame fractions count in samples, so the effective time
            // base is the frame rate.
            time_base: data_rate.max(1) as u32,
            nominal_freq: if fnom & 0x0001 != 0 {
                NominalFrequency::Hz50
            } else {
                NominalFrequency::Hz60
            },
            data_rate,
            revision,
            format: ValueFormat::default(),
            phasors,
            analogs: Vec::new(),
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

        let expected = HEADER_LEN + config.data_block_len() + CHECK_LEN;
        if image.len() != expected {
            return Err(DecodeError::malformed(
                "IEEE 1344 data frame",
                format!("length {} does not match configuration (expected {expected})", image.len()),
            ));
        }

        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "IEEE 1344 data frame");
        let status = StatusWord(c.u16_be()?);

        let mut phasors = Vec::with_capacity(config.phasors.len());
        for _ in 0..config.phasors.len() {
            phasors.push(PhasorValue::Rectangular {
                real: f64::from(c.i16_be()?),
                imaginary: f64::from(c.i16_be()?),
            });
        }

        let frequency = f64::from(c.i16_be()?);
        let rocof = f64::from(c.i16_be()?);

        let mut digitals = Vec::with_capacity(config.digitals.len());
        for _ in 0..config.digitals.len() {
            digitals.push(c.u16_be()?);
        }

        Ok(DataFrame {
            device_id: config.device_id,
            soc: header.soc,
            fracsec: header.fracsec,
            status,
            phasors,
            frequency,
            rocof,
            analogs: Vec::new(),
            digitals,
            config: Arc::clone(config),
        })
    }

    fn decode_command(&self, image: &RawFrameImage) -> Result<CommandFrame, DecodeError> {
        self.verify(image)?;
        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "IEEE 1344 command frame");
        let device_id = c.u16_be()?;
        let word = c.u16_be()?;
        let code = CommandCode::from_code(word).ok_or_else(|| {
            DecodeError::malformed("IEEE 1344 command frame", format!("unknown command word {word:#06x}"))
        })?;
        let payload = c.take(c.remaining().saturating_sub(CHECK_LEN))?.to_vec();
        Ok(CommandFrame { device_id, code, payload })
    }

    fn decode_header_record(&self, image: &RawFrameImage) -> Result<String, DecodeError> {
        self.verify(image)?;
        if image.len() < self.min_frame_len() {
            return Err(DecodeError::short_read(
                "IEEE 1344 header frame",
                self.min_frame_len(),
                image.len(),
            ));
        }
        let body = &image.data[HEADER_LEN..image.len() - CHECK_LEN];
        Ok(String::from_utf8_lossy(body).into_owned())
    }

    fn encode_command(&self, frame: &CommandFrame) -> Result<Vec<u8>, FramingError> {
        let mut w = FrameWriter::with_capacity(HEADER_LEN + 4 + frame.payload.len() + CHECK_LEN);
        self.write_header(&mut w, TYPE_CMD, 0);
        w.u16_be(frame.device_id);
        w.u16_be(frame.code.code());
        w.bytes(&frame.payload);
        self.finish(w, 0)
    }

    fn encode_configuration(
        &self,
        config: &ConfigurationFrame,
    ) -> Result<Vec<u8>, FramingError> {
        let mut w = FrameWriter::with_capacity(256);
        self.write_header(&mut w, TYPE_CFG, config.soc);
        w.bytes(&pad_label(&config.station_name));
        w.u16_be(config.device_id);
        w.u16_be(config.phasors.len() as u16);
        w.u16_be(config.digitals.len() as u16);

        for channel in &config.phasors {
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
        self.finish(w, config.fracsec as u16)
    }

    fn encode_data(&self, frame: &DataFrame) -> Result<Vec<u8>, FramingError> {
        let config = &frame.config;
        let mut w = FrameWriter::with_capacity(HEADER_LEN + config.data_block_len() + CHECK_LEN);
        self.write_header(&mut w, TYPE_DATA, frame.soc);
        w.u16_be(frame.status.0);
        for phasor in &frame.phasors {
            match *phasor {
                PhasorValue::Rectangular { real, imaginary } => {
                    w.i16_be(real.round() as i16);
                    w.i16_be(imaginary.round() as i16);
                }
                PhasorValue::Polar { magnitude, angle_rad } => {
                    w.i16_be((magnitude * angle_rad.cos()).round() as i16);
                    w.i16_be((magnitude * angle_rad.sin()).round() as i16);
                }
            }
        }
        w.i16_be(frame.frequency as i16);
        w.i16_be(frame.rocof as i16);
        for &word in &frame.digitals {
            w.u16_be(word);
        }
        self.finish(w, frame.fracsec as u16)
    }
}
