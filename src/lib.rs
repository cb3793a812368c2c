pub mod adc;
pub mod front_end;

// Re-export the main types that users need
pub use adc::{
    code_to_current_pa, format_auto, AdcError, Backend, ChannelConfig, ChannelReading,
    ChannelStatus, CurrentUnit, Gain, MonitorConfig, MonitorEvent, SampleRate,
};
pub use front_end::FrontEnd;

// Optionally expose lower-level access through a raw module
pub mod raw {
    pub use crate::adc::channel::Channel;
    pub use crate::adc::hal::*;
    pub use crate::adc::mock_hal::*;
    pub use crate::adc::registers;
    pub use crate::adc::ring::SampleRing;
}
