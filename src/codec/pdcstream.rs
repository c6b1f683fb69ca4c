//! BPA PDCstream codec.
//!
//! The little-endian member of the family: every multi-byte field after
//! the sync pair travels least-significant-byte first, the declared length
//! counts 16-bit words rather than bytes, and the footer is CRC-16/XMODEM.
//! Values are fixed-point rectangular only.
//!
//! ```text
//! offset  0  SYNC       0xAA
//!         1  TYPE       0xC0 | frame type (0 data, 1 header, 2 cfg, 3 cmd)
//!         2  WORDCOUNT  u16 LE, total length in 16-bit words
//!         4  IDCODE     u16 LE
//!         6  SOC        u32 LE
//!        10  SMPNUM     u16 LE, sample number within the second
//!   len-2    CHK        CRC-16/XMODEM, little-endian
//! ```

use std::sync::Arc;

use super::crc16::{self, CRC_XMODEM, ChecksumOrder};
use super::{FrameCodec, FrameCursor, FrameWriter, SYNC_BYTE, fixed_label, pad_label};
use crate::config::ProtocolVariant;
use crate::error::{DecodeError, FramingError};
use crate::types::{
    AnalogChannel, AnalogKind, CommandCode, CommandFrame, ConfigurationFrame, DataFrame,
    DigitalChannel, FrameHeader, FrameType, NominalFrequency, PhasorChannel, PhasorKind,
    PhasorValue, RawFrameImage, StatusWord, ValueFormat,
};

const HEADER_LEN: usize = 12;
const CHECK_LEN: usize = 2;
/// Largest byte length the 16-bit word count can declare.
const MAX_FRAME_LEN: usize = 0xFFFF * 2;

const TYPE_DATA: u8 = 0;
const TYPE_HEADER: u8 = 1;
const TYPE_CFG: u8 = 2;
const TYPE_CMD: u8 = 3;

pub struct PdcStreamCodec;

impl PdcStreamCodec {
    fn frame_type_of(type_byte: u8) -> FrameType {
        match type_byte & 0x0F {
            TYPE_DATA => FrameType::Data,
            TYPE_HEADER => FrameType::Header,
            TYPE_CFG => FrameType::Configuration,
            _ => FrameType::Command,
        }
    }

    fn write_header(&self, w: &mut FrameWriter, kind: u8, device_id: u16, soc: u32, smpnum: u16) {
        w.u8(SYNC_BYTE);
        w.u8(0xC0 | kind);
        w.u16_le(0); // WORDCOUNT, patched once the body is complete
        w.u16_le(device_id);
        w.u32_le(soc);
        w.u16_le(smpnum);
    }

    fn finish(&self, mut w: FrameWriter) -> Result<Vec<u8>, FramingError> {
        // Word-counted length: pad odd bodies before the checksum word.
        if (w.len() + CHECK_LEN) % 2 != 0 {
            w.u8(0);
        }
        let total = w.len() + CHECK_LEN;
        if total > MAX_FRAME_LEN {
            return Err(FramingError::InvalidFrameLength {
                declared: total,
                min: HEADER_LEN + CHECK_LEN,
                max: MAX_FRAME_LEN,
            });
        }
        w.patch_u16_le(2, (total / 2) as u16);
        let mut frame = w.into_inner();
        crc16::append(&CRC_XMODEM, ChecksumOrder::LittleEndian, &mut frame);
        Ok(frame)
    }

    fn verify(&self, image: &RawFrameImage) -> Result<(), DecodeError> {
        crc16::verify(&CRC_XMODEM, ChecksumOrder::LittleEndian, &image.data)
    }
}

impl FrameCodec for PdcStreamCodec {
    fn variant(&self) -> ProtocolVariant {
        ProtocolVariant::BpaPdcStream
    }

    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn min_frame_len(&self) -> usize {
        HEADER_LEN + CHECK_LEN
    }

    fn type_byte_valid(&self, byte: u8) -> bool {
        byte & 0xF0 == 0xC0 && byte & 0x0F <= TYPE_CMD
    }

    fn decode_header(&self, bytes: &[u8]) -> Result<FrameHeader, DecodeError> {
        let mut cursor = FrameCursor::new(bytes, "PDCstream header");
        let sync = cursor.u8()?;
        let type_byte = cursor.u8()?;
        if sync != SYNC_BYTE || !self.type_byte_valid(type_byte) {
            return Err(DecodeError::malformed(
                "PDCstream header",
                format!("bad sync/type bytes {sync:#04x} {type_byte:#04x}"),
            ));
        }
        let word_count = cursor.u16_le()?;
        let device_id = cursor.u16_le()?;
        let soc = cursor.u32_le()?;
        let smpnum = cursor.u16_le()?;
        Ok(FrameHeader {
            frame_type: Self::frame_type_of(type_byte),
            declared_len: usize::from(word_count) * 2,
            device_id,
            soc,
            fracsec: u32::from(smpnum),
        })
    }

    fn decode_configuration(
        &self,
        image: &RawFrameImage,
    ) -> Result<ConfigurationFrame, DecodeError> {
        self.verify(image)?;
        let header = self.decode_header(&image.data)?;

        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "PDCstream configuration frame");
        let station_name = fixed_label(c.take(16)?);
        let time_base = c.u32_le()? & 0x00FF_FFFF;
        let phnmr = c.u16_le()? as usize;
        let annmr = c.u16_le()? as usize;
        let dgnmr = c.u16_le()? as usize;

        let mut names = Vec::new();
        for _ in 0..phnmr + annmr + dgnmr * 16 {
            names.push(fixed_label(c.take(16)?));
        }
        let mut names = names.into_iter();

        let mut phasors = Vec::new();
        for _ in 0..phnmr {
            let label = names.next().unwrap_or_default();
            let unit = c.u32_le()?;
            let kind = if unit & 0xFF00_0000 == 0 { PhasorKind::Voltage } else { PhasorKind::Current };
            phasors.push(PhasorChannel { label, kind, scale: unit & 0x00FF_FFFF });
        }

        let mut analogs = Vec::new();
        for _ in 0..annmr {
            let label = names.next().unwrap_or_default();
            let unit = c.u32_le()?;
            let kind = match unit >> 24 {
                0 => AnalogKind::SinglePointOnWave,
                1 => AnalogKind::RmsOfAnalogInput,
                _ => AnalogKind::PeakOfAnalogInput,
            };
            let scale = ((unit << 8) as i32) >> 8;
            analogs.push(AnalogChannel { label, kind, scale });
        }

        let mut digitals = Vec::new();
        for _ in 0..dgnmr {
            let bit_labels: Vec<String> = (&mut names).take(16).collect();
            let unit = c.u32_le()?;
            digitals.push(DigitalChannel {
                bit_labels,
                normal_mask: (unit >> 16) as u16,
                valid_mask: unit as u16,
            });
        }

        let fnom = c.u16_le()?;
        let revision = c.u16_le()?;
        let data_rate = c.i16_le()?;

        Ok(ConfigurationFrame {
            device_id: header.device_id,
            station_name,
            time_base,
            nominal_freq: if fnom & 0x0001 != 0 {
                NominalFrequency::Hz50
            } else {
                NominalFrequency::Hz60
            },
            data_rate,
            revision,
            format: ValueFormat::default(),
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
                "PDCstream data frame",
                format!("length {} does not match configuration (expected {expected})", image.len()),
            ));
        }

        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "PDCstream data frame");
        let status = StatusWord(c.u16_le()?);

        let mut phasors = Vec::with_capacity(config.phasors.len());
        for _ in 0..config.phasors.len() {
            phasors.push(PhasorValue::Rectangular {
                real: f64::from(c.i16_le()?),
                imaginary: f64::from(c.i16_le()?),
            });
        }

        let frequency = f64::from(c.i16_le()?);
        let rocof = f64::from(c.i16_le()?);

        let mut analogs = Vec::with_capacity(config.analogs.len());
        for _ in 0..config.analogs.len() {
            analogs.push(f64::from(c.i16_le()?));
        }

        let mut digitals = Vec::with_capacity(config.digitals.len());
        for _ in 0..config.digitals.len() {
            digitals.push(c.u16_le()?);
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
        let mut c = FrameCursor::at(&image.data, HEADER_LEN, "PDCstream command frame");
        let word = c.u16_le()?;
        let code = CommandCode::from_code(word).ok_or_else(|| {
            DecodeError::malformed("PDCstream command frame", format!("unknown command word {word:#06x}"))
        })?;
        let payload = c.take(c.remaining().saturating_sub(CHECK_LEN))?.to_vec();
        Ok(CommandFrame { device_id: header.device_id, code, payload })
    }

    fn decode_header_record(&self, image: &RawFrameImage) -> Result<String, DecodeError> {
        self.verify(image)?;
        if image.len() < self.min_frame_len() {
            return Err(DecodeError::short_read(
                "PDCstream header frame",
                self.min_frame_len(),
                image.len(),
            ));
        }
        let body = &image.data[HEADER_LEN..image.len() - CHECK_LEN];
        // Strip the word-alignment pad if present.
        let body = body.strip_suffix(&[0]).unwrap_or(body);
        Ok(String::from_utf8_lossy(body).into_owned())
    }

    fn encode_command(&self, frame: &CommandFrame) -> Result<Vec<u8>, FramingError> {
        let mut w = FrameWriter::with_capacity(HEADER_LEN + 2 + frame.payload.len() + CHECK_LEN);
        self.write_header(&mut w, TYPE_CMD, frame.device_id, 0, 0);
        w.u16_le(frame.code.code());
        w.bytes(&frame.payload);
        self.finish(w)
    }

    fn encode_configuration(
        &self,
        config: &ConfigurationFrame,
    ) -> Result<Vec<u8>, FramingError> {
        let mut w = FrameWriter::with_capacity(256);
        self.write_header(&mut w, TYPE_CFG, config.device_id, config.soc, config.fracsec as u16);
        w.bytes(&pad_label(&config.station_name));
        w.u32_le(config.time_base & 0x00FF_FFFF);
        w.u16_le(config.phasors.len() as u16);
        w.u16_le(config.analogs.len() as u16);
        w.u16_le(config.digitals.len() as u16);

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
            w.u32_le(kind << 24 | (channel.scale & 0x00FF_FFFF));
        }
        for channel in &config.analogs {
            let kind = match channel.kind {
                AnalogKind::SinglePointOnWave => 0u32,
                AnalogKind::RmsOfAnalogInput => 1,
                AnalogKind::PeakOfAnalogInput => 2,
            };
            w.u32_le(kind << 24 | (channel.scale as u32 & 0x00FF_FFFF));
        }
        for channel in &config.digitals {
            w.u32_le(u32::from(channel.normal_mask) << 16 | u32::from(channel.valid_mask));
        }

        let fnom = match config.nominal_freq {
            NominalFrequency::Hz50 => 1u16,
            NominalFrequency::Hz60 => 0,
        };
        w.u16_le(fnom);
        w.u16_le(config.revision);
        w.i16_le(config.data_rate);
        self.finish(w)
    }

    fn encode_data(&self, frame: &DataFrame) -> Result<Vec<u8>, FramingError> {
        let config = &frame.config;
        let mut w = FrameWriter::with_capacity(HEADER_LEN + config.data_block_len() + CHECK_LEN);
        self.write_header(&mut w, TYPE_DATA, frame.device_id, frame.soc, frame.fracsec as u16);
        w.u16_le(frame.status.0);
        for phasor in &frame.phasors {
            match *phasor {
                PhasorValue::Rectangular { real, imaginary } => {
                    w.i16_le(real.round() as i16);
                    w.i16_le(imaginary.round() as i16);
                }
                PhasorValue::Polar { magnitude, angle_rad } => {
                    w.i16_le((magnitude * angle_rad.cos()).round() as i16);
                    w.i16_le((magnitude * angle_rad.sin()).round() as i16);
                }
            }
        }
        w.i16_le(frame.frequency as i16);
        w.i16_le(frame.rocof as i16);
        for &value in &frame.analogs {
            w.i16_le(value as i16);
        }
        for &word in &frame.digitals {
            w.u16_le(word);
        }
        self.finish(w)
    }
}
