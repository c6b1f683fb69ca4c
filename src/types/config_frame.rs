//! Configuration frames: channel layout, scaling, and phase conventions.

/// Nominal line frequency advertised by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NominalFrequency {
    Hz50,
    Hz60,
}

impl NominalFrequency {
    pub fn hertz(&self) -> f64 {
        match self {
            NominalFrequency::Hz50 => 50.0,
            NominalFrequency::Hz60 => 60.0,
        }
    }
}

/// Per-stream value representation, from the configuration FORMAT word.
///
/// Fixed-point streams carry scaled integers and rely on per-channel
/// conversion factors; floating streams carry engineering units directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ValueFormat {
    /// Phasors as magnitude/angle rather than real/imaginary.
    pub phasor_polar: bool,
    /// Phasors as 32-bit floats rather than 16-bit integers.
    pub phasor_float: bool,
    /// Analog channels as floats rather than integers.
    pub analog_float: bool,
    /// Frequency/ROCOF as floats rather than integer deviation.
    pub freq_float: bool,
}

impl ValueFormat {
    /// Pack into the wire FORMAT word (low four bits).
    pub fn to_word(&self) -> u16 {
        (self.phasor_polar as u16)
            | (self.phasor_float as u16) << 1
            | (self.analog_float as u16) << 2
            | (self.freq_float as u16) << 3
    }

    /// Unpack from the wire FORMAT word.
    pub fn from_word(word: u16) -> Self {
        Self {
            phasor_polar: word & 0x0001 != 0,
            phasor_float: word & 0x0002 != 0,
            analog_float: word & 0x0004 != 0,
            freq_float: word & 0x0008 != 0,
        }
    }
}

/// Whether a phasor channel measures voltage or current.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhasorKind {
    Voltage,
    Current,
}

/// One phasor channel definition.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasorChannel {
    pub label: String,
    pub kind: PhasorKind,
    /// Conversion factor for fixed-point data, in 1e-5 V or A per count.
    pub scale: u32,
}

impl PhasorChannel {
    /// Engineering units per integer count.
    pub fn unit_scale(&self) -> f64 {
        f64::from(self.scale) * 1e-5
    }
}

/// Interpretation of an analog channel's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalogKind {
    SinglePointOnWave,
    RmsOfAnalogInput,
    PeakOfAnalogInput,
}

/// One analog channel definition.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogChannel {
    pub label: String,
    pub kind: AnalogKind,
    /// User-defined conversion factor for fixed-point data (signed 24-bit).
    pub scale: i32,
}

/// One 16-bit digital status word definition.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalChannel {
    /// One label per bit, index 0 = least significant bit.
    pub bit_labels: Vec<String>,
    /// Normal state of each bit; a deviation flags the bit as abnormal.
    pub normal_mask: u16,
    /// Which bits carry meaningful inputs.
    pub valid_mask: u16,
}

/// A device's decoded configuration frame.
///
/// Immutable once decoded; consumers hold it through an `Arc` and read it
/// lock-free. A newer configuration for the same device replaces the
/// shared pointer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationFrame {
    pub device_id: u16,
    /// Station name, trimmed of trailing padding.
    pub station_name: String,
    /// Subdivisions of a second the FRACSEC word counts in.
    pub time_base: u32,
    pub nominal_freq: NominalFrequency,
    /// Frames per second when positive, seconds per frame when negative.
    pub data_rate: i16,
    /// Configuration change count; incremented by the device on change.
    pub revision: u16,
    pub format: ValueFormat,
    pub phasors: Vec<PhasorChannel>,
    pub analogs: Vec<AnalogChannel>,
    pub digitals: Vec<DigitalChannel>,
    /// Timestamp carried by the configuration frame itself.
    pub soc: u32,
    pub fracsec: u32,
}

impl ConfigurationFrame {
    /// Whether a data frame tagged with `device_id` may decode against
    /// this configuration.
    pub fn matches_device(&self, device_id: u16) -> bool {
        self.device_id == device_id
    }

    /// Expected byte length of one data-frame channel block under this
    /// configuration and format (status word through digitals, exclusive
    /// of header and checksum).
    pub fn data_block_len(&self) -> usize {
        let phasor = if self.format.phasor_float { 8 } else { 4 };
        let freq = if self.format.freq_float { 8 } else { 4 };
        let analog = if self.format.analog_float { 4 } else { 2 };
        2 + self.phasors.len() * phasor + freq + self.analogs.len() * analog
            + self.digitals.len() * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_word_round_trip() {
        for word in 0u16..16 {
            assert_eq!(ValueFormat::from_word(word).to_word(), word);
        }
    }

    #[test]
    fn data_block_len_tracks_format() {
        let mut config = ConfigurationFrame {
            device_id: 1,
            station_name: "STATION A".into(),
            time_base: 1_000_000,
            nominal_freq: NominalFrequency::Hz60,
            data_rate: 30,
            revision: 0,
            format: ValueFormat::default(),
            phasors: vec![
                PhasorChannel { label: "VA".into(), kind: PhasorKind::Voltage, scale: 915_527 },
                PhasorChannel { label: "IA".into(), kind: PhasorKind::Current, scale: 45_776 },
            ],
            analogs: vec![AnalogChannel {
                label: "ANALOG1".into(),
                kind: AnalogKind::SinglePointOnWave,
                scale: 1,
            }],
            digitals: vec![DigitalChannel {
                bit_labels: (0..16).map(|i| format!("BIT{i}")).collect(),
                normal_mask: 0x0000,
                valid_mask: 0xFFFF,
            }],
            soc: 0,
            fracsec: 0,
        };

        // Fixed-point: 2 + 2*4 + 4 + 1*2 + 1*2 = 18
        assert_eq!(config.data_block_len(), 18);

        config.format =
            ValueFormat { phasor_polar: false, phasor_float: true, analog_float: true, freq_float: true };
        // Float: 2 + 2*8 + 8 + 1*4 + 1*2 = 32
        assert_eq!(config.data_block_len(), 32);
    }
}
