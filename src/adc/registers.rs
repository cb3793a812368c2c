//! Control-byte encoding and protocol constants for the AD7715.
//!
//! Every transaction starts with a write to the communications register,
//! which selects the target register, the transfer direction, and the gain.
//! The setup register carries the operating mode and output rate.

use super::types::{Gain, SampleRate};

/// Communications register base: select the setup register for a write.
pub const COMMS_WRITE_SETUP: u8 = 0x10;

/// Read/write direction bit in the communications register.
pub const COMMS_READ_BIT: u8 = 0x08;

/// Communications byte selecting a setup-register read.
pub const COMMS_READ_SETUP: u8 = COMMS_WRITE_SETUP | COMMS_READ_BIT;

/// Communications byte selecting a data-register read (16-bit result).
pub const COMMS_READ_DATA: u8 = 0x38;

/// Setup register base: self-calibration mode, buffered bipolar input.
pub const SETUP_BASE: u8 = 0x66;

/// Only the low 6 bits of the setup register read back after a
/// calibration cycle; the mode bits return to zero on completion.
pub const SETUP_VERIFY_MASK: u8 = 0x3F;

/// Byte clocked in repeatedly to force the serial interface back into its
/// default state when byte framing may be ambiguous.
pub const RESYNC_BYTE: u8 = 0xFF;

/// Number of resynchronization bytes per attempt.
pub const RESYNC_LEN: usize = 4;

/// Upper bound on the configuration/calibration handshake, in ms.
pub const SETUP_TIMEOUT_MS: u64 = 350;

/// Dividing this by the output rate gives the worst-case spacing between
/// two samples, in ms.
pub const READ_TIMEOUT_FACTOR: u32 = 1050;

/// Bounded retry count for the configuration/calibration protocol.
pub const CALIBRATION_ATTEMPTS: u32 = 3;

/// Encode the communications byte that starts a setup-register write.
/// The 2-bit gain code occupies the low bits.
pub fn comms_byte(gain: Gain) -> u8 {
    COMMS_WRITE_SETUP | gain.code()
}

/// Encode the setup register value for the given output rate.
/// The 2-bit rate code sits at bit offset 3.
pub fn setup_byte(rate: SampleRate) -> u8 {
    SETUP_BASE | (rate.code() << 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comms_byte_encodes_gain_in_low_bits() {
        assert_eq!(comms_byte(Gain::X1), 0x10);
        assert_eq!(comms_byte(Gain::X2), 0x11);
        assert_eq!(comms_byte(Gain::X32), 0x12);
        assert_eq!(comms_byte(Gain::X128), 0x13);
    }

    #[test]
    fn setup_byte_encodes_rate_at_bit_three() {
        assert_eq!(setup_byte(SampleRate::Hz50), 0x66);
        assert_eq!(setup_byte(SampleRate::Hz60), 0x6E);
        assert_eq!(setup_byte(SampleRate::Hz250), 0x76);
        assert_eq!(setup_byte(SampleRate::Hz500), 0x7E);
    }

    #[test]
    fn read_data_byte_has_read_bit_set() {
        assert_eq!(COMMS_READ_DATA & COMMS_READ_BIT, COMMS_READ_BIT);
    }
}
