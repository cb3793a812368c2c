//! Raw-code-to-current conversion and unit-prefix handling.

use serde::{Deserialize, Serialize};

use super::types::Gain;

/// Full-scale current of the front-end transimpedance stage, in pA.
pub const MAX_CURRENT_PA: u32 = 28_868_360;

/// Full-scale output code of the AD7715 in 16-bit unipolar mode.
pub const MAX_ADC_CODE: u32 = 65_535;

/// Scale factor mapping one code step to pA at unity gain.
pub const DEFAULT_CONVERSION_FACTOR: u32 = MAX_CURRENT_PA / MAX_ADC_CODE;

/// Convert a raw or averaged code to calibrated current in pA.
pub fn code_to_current_pa(value: f32, conversion_factor: u32, gain: Gain, offset_pa: f32) -> f32 {
    (value * conversion_factor as f32) / gain.value() as f32 - offset_pa
}

/// Unit prefix applied to a converted current value.
///
/// `Auto` is a presentation concern: numerically it behaves like `Pico`,
/// and [`format_auto`] picks a display prefix from the magnitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CurrentUnit {
    Pico,
    Nano,
    Micro,
    Auto,
}

impl CurrentUnit {
    /// Map a unit selector character to a prefix. Unrecognized selectors
    /// silently fall back to pA, consistent with the lenient configuration
    /// policy elsewhere in the driver.
    pub fn from_selector(selector: char) -> Self {
        match selector {
            'p' => CurrentUnit::Pico,
            'n' => CurrentUnit::Nano,
            'u' => CurrentUnit::Micro,
            'a' => CurrentUnit::Auto,
            _ => CurrentUnit::Pico,
        }
    }

    /// Scale a pA value into this unit.
    pub fn scale(self, current_pa: f32) -> f32 {
        match self {
            CurrentUnit::Pico | CurrentUnit::Auto => current_pa,
            CurrentUnit::Nano => current_pa / 1_000.0,
            CurrentUnit::Micro => current_pa / 1_000_000.0,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            CurrentUnit::Pico | CurrentUnit::Auto => "pA",
            CurrentUnit::Nano => "nA",
            CurrentUnit::Micro => "uA",
        }
    }
}

/// Render a pA value with an automatically chosen prefix, stepping up at
/// each factor of 1000.
pub fn format_auto(current_pa: f32) -> String {
    if current_pa < 1_000.0 {
        format!("{:.2} [pA]", current_pa)
    } else if current_pa < 1_000_000.0 {
        format!("{:.2} [nA]", current_pa / 1_000.0)
    } else {
        format!("{:.2} [uA]", current_pa / 1_000_000.0)
    }
}
