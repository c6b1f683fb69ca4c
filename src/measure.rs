//! Measurement model: raw data frames resolved into engineering units.
//!
//! [`derive`] is a pure function over a decoded [`DataFrame`] and the
//! configuration it references. Fixed-point streams get per-channel
//! conversion factors applied; floating streams pass through. Nothing here
//! holds state, so callers can derive on any thread, any time, or not at
//! all.

use crate::types::{DataFrame, PhasorKind, StatusWord};

/// Overall fitness of one measurement instant, from the status word's
/// data-error bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Good,
    DeviceError,
    TestMode,
    Invalid,
}

impl Quality {
    fn from_status(status: StatusWord) -> Self {
        match status.data_error_bits() {
            0b00 => Quality::Good,
            0b01 => Quality::DeviceError,
            0b10 => Quality::TestMode,
            _ => Quality::Invalid,
        }
    }
}

/// One phasor in engineering units.
#[derive(Debug, Clone, PartialEq)]
pub struct PhasorMeasurement {
    pub label: String,
    pub kind: PhasorKind,
    /// Volts or amperes.
    pub magnitude: f64,
    pub angle_rad: f64,
}

/// One analog channel in engineering units.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogMeasurement {
    pub label: String,
    pub value: f64,
}

/// One digital input bit, resolved against its normal/validity masks.
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalMeasurement {
    pub label: String,
    pub state: bool,
    /// Whether the bit deviates from its configured normal state.
    pub abnormal: bool,
}

/// A complete measurement instant in engineering units.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSet {
    pub device_id: u16,
    pub station_name: String,
    /// Fractional Unix-epoch seconds.
    pub timestamp_secs: f64,
    pub quality: Quality,
    /// Device reported loss of time synchronization.
    pub time_sync_lost: bool,
    pub phasors: Vec<PhasorMeasurement>,
    pub frequency_hz: f64,
    pub rocof_hz_per_sec: f64,
    pub analogs: Vec<AnalogMeasurement>,
    pub digitals: Vec<DigitalMeasurement>,
}

/// Resolve a raw data frame into engineering units.
pub fn derive(frame: &DataFrame) -> MeasurementSet {
    let config = &frame.config;
    let format = config.format;

    let phasors = config
        .phasors
        .iter()
        .zip(&frame.phasors)
        .map(|(channel, value)| {
            let magnitude = if format.phasor_float {
                value.magnitude()
            } else {
                value.magnitude() * channel.unit_scale()
            };
            PhasorMeasurement {
                label: channel.label.clone(),
                kind: channel.kind,
                magnitude,
                angle_rad: value.angle_rad(),
            }
        })
        .collect();

    // Fixed-point frequency is deviation from nominal in millihertz;
    // floating is the actual frequency. ROCOF fixed counts are 0.01 Hz/s.
    let frequency_hz = if format.freq_float {
        frame.frequency
    } else {
        config.nominal_freq.hertz() + frame.frequency / 1_000.0
    };
    let rocof_hz_per_sec =
        if format.freq_float { frame.rocof } else { frame.rocof / 100.0 };

    let analogs = config
        .analogs
        .iter()
        .zip(&frame.analogs)
        .map(|(channel, &value)| AnalogMeasurement {
            label: channel.label.clone(),
            value: if format.analog_float { value } else { value * f64::from(channel.scale) },
        })
        .collect();

    let mut digitals = Vec::new();
    for (channel, &word) in config.digitals.iter().zip(&frame.digitals) {
        let abnormal_bits = (word ^ channel.normal_mask) & channel.valid_mask;
        for bit in 0..16u16 {
            let mask = 1 << bit;
            if channel.valid_mask & mask == 0 {
                continue;
            }
            let label = channel
                .bit_labels
                .get(usize::from(bit))
                .cloned()
                .unwrap_or_else(|| format!("BIT{bit}"));
            digitals.push(DigitalMeasurement {
                label,
                state: word & mask != 0,
                abnormal: abnormal_bits & mask != 0,
            });
        }
    }

    MeasurementSet {
        device_id: frame.device_id,
        station_name: config.station_name.clone(),
        timestamp_secs: frame.timestamp_secs(),
        quality: Quality::from_status(frame.status),
        time_sync_lost: frame.status.sync_lost(),
        phasors,
        frequency_hz,
        rocof_hz_per_sec,
        analogs,
        digitals,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::codec::test_support::{sample_config, sample_data};
    use crate::types::{PhasorValue, StatusWord, ValueFormat};

    #[test]
    fn fixed_point_phasors_scale_to_engineering_units() {
        let config = Arc::new(sample_config(7, ValueFormat::default()));
        let mut frame = sample_data(&config);
        frame.phasors[0] = PhasorValue::Rectangular { real: 3_000.0, imaginary: 4_000.0 };

        let set = derive(&frame);
        // 5000 counts at 915527e-5 V/count.
        let expected = 5_000.0 * 9.15527;
        assert!((set.phasors[0].magnitude - expected).abs() < 1e-6);
        assert_eq!(set.station_name, "STATION A");
    }

    #[test]
    fn floating_phasors_pass_through() {
        let format = ValueFormat {
            phasor_polar: true,
            phasor_float: true,
            analog_float: true,
            freq_float: true,
        };
        let config = Arc::new(sample_config(7, format));
        let mut frame = sample_data(&config);
        frame.phasors[0] = PhasorValue::Polar { magnitude: 132_750.5, angle_rad: -0.25 };
        frame.frequency = 59.98;

        let set = derive(&frame);
        assert_eq!(set.phasors[0].magnitude, 132_750.5);
        assert_eq!(set.phasors[0].angle_rad, -0.25);
        assert_eq!(set.frequency_hz, 59.98);
    }

    #[test]
    fn fixed_frequency_is_deviation_from_nominal() {
        let config = Arc::new(sample_config(7, ValueFormat::default()));
        let mut frame = sample_data(&config);
        frame.frequency = -40.0; // -40 mHz
        frame.rocof = 12.0;

        let set = derive(&frame);
        assert!((set.frequency_hz - 59.96).abs() < 1e-9);
        assert!((set.rocof_hz_per_sec - 0.12).abs() < 1e-9);
    }

    #[test]
    fn digital_bits_resolve_against_masks() {
        // sample_config: normal 0x0001, valid 0x00FF.
        let config = Arc::new(sample_config(7, ValueFormat::default()));
        let mut frame = sample_data(&config);
        frame.digitals = vec![0x0102];

        let set = derive(&frame);
        // Only the 8 valid bits appear.
        assert_eq!(set.digitals.len(), 8);
        // Bit 0: normally 1, now 0 -> abnormal.
        assert_eq!(set.digitals[0].label, "BREAKER0");
        assert!(!set.digitals[0].state);
        assert!(set.digitals[0].abnormal);
        // Bit 1: normally 0, now 1 -> abnormal.
        assert!(set.digitals[1].state);
        assert!(set.digitals[1].abnormal);
        // Bit 2: normally 0, still 0 -> fine.
        assert!(!set.digitals[2].abnormal);
        // Bit 8 set but invalid, so it is absent from the output.
        assert!(set.digitals.iter().all(|d| d.label != "BREAKER8"));
    }

    #[test]
    fn quality_tracks_status_word() {
        let config = Arc::new(sample_config(7, ValueFormat::default()));
        let mut frame = sample_data(&config);

        frame.status = StatusWord(0x0000);
        assert_eq!(derive(&frame).quality, Quality::Good);

        frame.status = StatusWord(0x8000);
        assert_eq!(derive(&frame).quality, Quality::TestMode);

        frame.status = StatusWord(0xE000);
        let set = derive(&frame);
        assert_eq!(set.quality, Quality::Invalid);
        assert!(set.time_sync_lost);
    }
}
