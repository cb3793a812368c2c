//! Driver core for the AD7715 current-acquisition front-end.

pub mod channel;
pub mod convert;
pub mod hal;
pub mod mock_hal;
pub mod registers;
pub mod ring;
pub mod rppal_hal;
pub mod types;

pub use channel::Channel;
pub use convert::{code_to_current_pa, format_auto, CurrentUnit};
pub use types::{
    AdcError, Backend, ChannelConfig, ChannelReading, ChannelStatus, Gain, MonitorConfig,
    MonitorEvent, SampleRate,
};
