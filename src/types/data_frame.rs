//! Data frames: one measurement instant, raw channel values, status word.

use std::sync::Arc;

use super::ConfigurationFrame;

/// The per-frame status word (STAT).
///
/// Accessor methods decode the standard bit layout; the raw word stays
/// available for variants that overload the reserved bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusWord(pub u16);

impl StatusWord {
    /// Bits 15-14: 00 good, 01 device error, 10 test mode, 11 invalid.
    pub fn data_error_bits(&self) -> u8 {
        ((self.0 >> 14) & 0x3) as u8
    }

    pub fn is_good(&self) -> bool {
        self.data_error_bits() == 0
    }

    pub fn in_test_mode(&self) -> bool {
        self.data_error_bits() == 0b10
    }

    pub fn is_invalid(&self) -> bool {
        self.data_error_bits() == 0b11
    }

    /// Bit 13: device lost time synchronization.
    pub fn sync_lost(&self) -> bool {
        self.0 & 0x2000 != 0
    }

    /// Bit 12: data sorted by arrival rather than timestamp.
    pub fn sorted_by_arrival(&self) -> bool {
        self.0 & 0x1000 != 0
    }

    /// Bit 11: device trigger detected.
    pub fn trigger_detected(&self) -> bool {
        self.0 & 0x0800 != 0
    }

    /// Bit 10: configuration change pending; the held configuration may no
    /// longer describe upcoming frames.
    pub fn config_change_pending(&self) -> bool {
        self.0 & 0x0400 != 0
    }
}

/// A phasor value exactly as transmitted, widened to `f64` but unscaled.
///
/// Fixed-point streams yield integer counts here; floating streams yield
/// engineering units. The measurement model applies per-channel scaling.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhasorValue {
    Rectangular { real: f64, imaginary: f64 },
    Polar { magnitude: f64, angle_rad: f64 },
}

impl PhasorValue {
    /// Raw magnitude regardless of coordinate form.
    pub fn magnitude(&self) -> f64 {
        match *self {
            PhasorValue::Rectangular { real, imaginary } => real.hypot(imaginary),
            PhasorValue::Polar { magnitude, .. } => magnitude,
        }
    }

    /// Raw angle in radians regardless of coordinate form.
    pub fn angle_rad(&self) -> f64 {
        match *self {
            PhasorValue::Rectangular { real, imaginary } => imaginary.atan2(real),
            PhasorValue::Polar { angle_rad, .. } => angle_rad,
        }
    }
}

/// One decoded data frame.
///
/// Holds a non-owning `Arc` reference to the configuration active at
/// decode time: replacing the connection's configuration never
/// reinterprets frames decoded earlier.
#[derive(Debug, Clone)]
pub struct DataFrame {
    pub device_id: u16,
    pub soc: u32,
    pub fracsec: u32,
    pub status: StatusWord,
    pub phasors: Vec<PhasorValue>,
    /// Raw frequency field: deviation counts (fixed) or hertz (float).
    pub frequency: f64,
    /// Raw rate-of-change-of-frequency field.
    pub rocof: f64,
    pub analogs: Vec<f64>,
    pub digitals: Vec<u16>,
    pub config: Arc<ConfigurationFrame>,
}

impl DataFrame {
    /// Timestamp as fractional Unix seconds, resolved against the
    /// configuration's time base.
    pub fn timestamp_secs(&self) -> f64 {
        let time_base = self.config.time_base.max(1);
        // Low 24 bits are the fraction count; high byte is time quality.
        let fraction = f64::from(self.fracsec & 0x00FF_FFFF) / f64::from(time_base);
        f64::from(self.soc) + fraction
    }

    /// Time-quality nibble from the FRACSEC high byte.
    pub fn time_quality(&self) -> u8 {
        (self.fracsec >> 24) as u8
    }
}
