use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::convert::DEFAULT_CONVERSION_FACTOR;

/// Default ring-buffer capacity per channel, in samples.
pub const DEFAULT_RING_CAPACITY: usize = 100;

/// Default chip-select GPIO lines for the four front-end channels.
pub const DEFAULT_CS_LINES: [u8; 4] = [8, 7, 5, 6];

/// Default data-ready GPIO lines for the four front-end channels.
pub const DEFAULT_DRDY_LINES: [u8; 4] = [25, 24, 23, 22];

/// Per-channel calibration offsets in pA, indexed like [`DEFAULT_CS_LINES`].
/// These were measured against the reference front-end board; channel 2's
/// output is clipped near zero, hence the much smaller constant.
pub const CURRENT_OFFSET_PA: [f32; 4] = [312_852.793, 1_760.0, 85_541.8666, 220_410.5263];

/// Look up the calibration offset dedicated to a chip-select line.
/// Lines outside the reference wiring get no offset correction.
pub fn offset_for_line(cs_line: u8) -> f32 {
    DEFAULT_CS_LINES
        .iter()
        .position(|&line| line == cs_line)
        .map(|idx| CURRENT_OFFSET_PA[idx])
        .unwrap_or(0.0)
}

/// Amplifier gain setting of the AD7715 input stage.
///
/// Requested values outside the supported set fall back to unity gain; this
/// lenience is intentional and mirrors the rest of the configuration
/// surface, which corrects rather than rejects bad input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gain {
    X1,
    X2,
    X32,
    X128,
}

impl Gain {
    /// Normalize a requested gain, silently correcting unsupported values.
    pub fn from_value(value: u8) -> Self {
        match value {
            1 => Gain::X1,
            2 => Gain::X2,
            32 => Gain::X32,
            128 => Gain::X128,
            _ => Gain::X1,
        }
    }

    /// The numeric amplification factor.
    pub fn value(self) -> u8 {
        match self {
            Gain::X1 => 1,
            Gain::X2 => 2,
            Gain::X32 => 32,
            Gain::X128 => 128,
        }
    }

    /// 2-bit code for the communications register.
    pub fn code(self) -> u8 {
        match self {
            Gain::X1 => 0b00,
            Gain::X2 => 0b01,
            Gain::X32 => 0b10,
            Gain::X128 => 0b11,
        }
    }
}

/// Output update rate of the AD7715.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleRate {
    Hz50,
    Hz60,
    Hz250,
    Hz500,
}

impl SampleRate {
    /// Normalize a requested rate, silently correcting unsupported values.
    pub fn from_hz(hz: u16) -> Self {
        match hz {
            50 => SampleRate::Hz50,
            60 => SampleRate::Hz60,
            250 => SampleRate::Hz250,
            500 => SampleRate::Hz500,
            _ => SampleRate::Hz50,
        }
    }

    /// The rate in Hz.
    pub fn hz(self) -> u16 {
        match self {
            SampleRate::Hz50 => 50,
            SampleRate::Hz60 => 60,
            SampleRate::Hz250 => 250,
            SampleRate::Hz500 => 500,
        }
    }

    /// 2-bit code for the setup register.
    pub fn code(self) -> u8 {
        match self {
            SampleRate::Hz50 => 0b00,
            SampleRate::Hz60 => 0b01,
            SampleRate::Hz250 => 0b10,
            SampleRate::Hz500 => 0b11,
        }
    }
}

/// Calibration state of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// The channel exists but its last configuration attempt did not
    /// verify; samples from it are not trustworthy.
    Unconfigured,
    /// Configuration wrote and verified; the device is calibrated.
    Calibrated,
}

/// Which HAL backend the front-end should build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backend {
    /// Real AD7715 hardware over rppal (requires the `pi-hardware` feature).
    Ad7715,
    /// Simulated devices, for development and tests.
    Mock,
}

/// Configuration for a single acquisition channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Chip-select GPIO line dedicated to this channel.
    pub cs_line: u8,
    /// Data-ready GPIO line dedicated to this channel.
    pub drdy_line: u8,
    /// Requested gain; unsupported values fall back to 1.
    pub gain: u8,
    /// Requested output rate in Hz; unsupported values fall back to 50.
    pub sample_rate_hz: u16,
    /// Ring-buffer capacity in samples.
    pub capacity: usize,
    /// Calibration offset override in pA. `None` selects the offset wired
    /// to the chip-select line.
    pub offset_pa: Option<f32>,
}

impl ChannelConfig {
    pub fn new(cs_line: u8, drdy_line: u8) -> Self {
        ChannelConfig {
            cs_line,
            drdy_line,
            gain: 1,
            sample_rate_hz: 50,
            capacity: DEFAULT_RING_CAPACITY,
            offset_pa: None,
        }
    }
}

/// Configuration for the whole four-channel front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub backend: Backend,
    pub channels: Vec<ChannelConfig>,
    /// Raw-code-to-pA scale factor supplied by the board calibration.
    pub conversion_factor: u32,
    /// Averaging window applied to published readings, in ms.
    pub window_ms: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let channels = DEFAULT_CS_LINES
            .iter()
            .zip(DEFAULT_DRDY_LINES.iter())
            .map(|(&cs, &drdy)| ChannelConfig::new(cs, drdy))
            .collect();

        MonitorConfig {
            backend: Backend::Mock,
            channels,
            conversion_factor: DEFAULT_CONVERSION_FACTOR,
            window_ms: 1000,
        }
    }
}

/// A single averaged reading published by the front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelReading {
    /// Channel index within the front-end (0..channels.len()).
    pub channel: usize,
    /// Windowed average of the raw 16-bit codes.
    pub raw_average: f32,
    /// The average converted to calibrated current, in pA.
    pub current_pa: f32,
    /// Microseconds since the Unix epoch when the reading was formed.
    pub timestamp_us: u64,
}

/// Events published by the front-end acquisition task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MonitorEvent {
    /// One averaged reading per calibrated channel.
    Reading(Vec<ChannelReading>),
    /// Outcome of a channel's configuration/calibration run.
    Calibration { channel: usize, calibrated: bool },
    /// A non-fatal acquisition error.
    Error(String),
}

/// Driver error taxonomy. Invalid gain/rate/unit selections are *not*
/// errors; they are silently corrected at the configuration boundary.
#[derive(Debug, thiserror::Error)]
pub enum AdcError {
    #[error("calibration did not verify after {attempts} attempts")]
    CalibrationFailed { attempts: u32 },

    #[error("no samples available to average")]
    NoSamples,

    #[error("timed out after {0:?} waiting for data ready")]
    DataReadyTimeout(Duration),

    #[error("hardware already in use: {0}")]
    HardwareInUse(String),

    #[error("configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
