//! Per-channel acquisition state machine: configuration/calibration
//! handshake, sample ingestion, and windowed averaging.

use std::time::Duration;

use log::{debug, info, warn};

use super::hal::{Clock, InputPin, OutputPin, SpiBus};
use super::registers::{
    comms_byte, setup_byte, CALIBRATION_ATTEMPTS, COMMS_READ_BIT, COMMS_READ_DATA,
    COMMS_READ_SETUP, READ_TIMEOUT_FACTOR, RESYNC_BYTE, RESYNC_LEN, SETUP_TIMEOUT_MS,
    SETUP_VERIFY_MASK,
};
use super::ring::SampleRing;
use super::types::{offset_for_line, AdcError, ChannelConfig, ChannelStatus, Gain, SampleRate};

/// One physical AD7715 and its acquisition state.
///
/// The channel does not own the bus; every operation that talks to the
/// device borrows it, and the caller is responsible for not interleaving
/// another channel's transfer inside a chip-select bracket.
pub struct Channel {
    cs_line: u8,
    drdy_line: u8,
    gain: Gain,
    sample_rate: SampleRate,
    max_sample_period_ms: u32,
    offset_pa: f32,
    status: ChannelStatus,
    ring: SampleRing,
    cs: Box<dyn OutputPin>,
    drdy: Box<dyn InputPin>,
}

impl Channel {
    /// Build a channel from its two control lines and requested settings.
    ///
    /// Unsupported gain and rate values are silently corrected to 1 and
    /// 50 Hz; this lenience is deliberate. The chip select is driven high
    /// (idle) immediately. The channel starts unconfigured — run
    /// [`Channel::configure`] before trusting any samples.
    pub fn new(mut cs: Box<dyn OutputPin>, drdy: Box<dyn InputPin>, config: &ChannelConfig) -> Self {
        cs.set_high();

        let gain = Gain::from_value(config.gain);
        let sample_rate = SampleRate::from_hz(config.sample_rate_hz);
        let rate = u32::from(sample_rate.hz());
        let mut max_sample_period_ms = READ_TIMEOUT_FACTOR / rate;
        if READ_TIMEOUT_FACTOR % rate > 0 {
            max_sample_period_ms += 1;
        }

        let offset_pa = config
            .offset_pa
            .unwrap_or_else(|| offset_for_line(config.cs_line));

        Channel {
            cs_line: config.cs_line,
            drdy_line: config.drdy_line,
            gain,
            sample_rate,
            max_sample_period_ms,
            offset_pa,
            status: ChannelStatus::Unconfigured,
            ring: SampleRing::new(config.capacity),
            cs,
            drdy,
        }
    }

    /// Bring the device into a known, calibrated state and verify it by
    /// register readback, retrying up to three times.
    ///
    /// On verified success the ring buffer and counters are reset and the
    /// channel becomes [`ChannelStatus::Calibrated`]. On failure the
    /// channel keeps whatever state it had before the call. The handshake
    /// timeout is observed and logged but never aborts an attempt;
    /// verification decides the outcome either way.
    pub fn configure(&mut self, bus: &mut dyn SpiBus, clock: &dyn Clock) -> Result<(), AdcError> {
        let comms = comms_byte(self.gain);
        let setup = setup_byte(self.sample_rate);

        let mut remaining = CALIBRATION_ATTEMPTS;
        while remaining > 0 {
            self.resync(bus)?;

            // Diagnostic only; the protocol does not branch on this value.
            let before = self.read_register(bus, COMMS_READ_SETUP)?;
            debug!(
                "channel cs={}: setup register currently 0x{:02X}",
                self.cs_line, before
            );

            self.write_setup_and_wait(bus, clock, comms, setup)?;

            let readback = self.read_register(bus, comms | COMMS_READ_BIT)?;
            if readback == setup & SETUP_VERIFY_MASK {
                self.ring.clear();
                self.status = ChannelStatus::Calibrated;
                info!(
                    "channel cs={}: configured and calibrated (gain {}, {} Hz)",
                    self.cs_line,
                    self.gain.value(),
                    self.sample_rate.hz()
                );
                return Ok(());
            }

            remaining -= 1;
            warn!(
                "channel cs={}: setup readback 0x{:02X} != 0x{:02X}, {} attempt(s) remaining",
                self.cs_line,
                readback,
                setup & SETUP_VERIFY_MASK,
                remaining
            );
        }

        Err(AdcError::CalibrationFailed {
            attempts: CALIBRATION_ATTEMPTS,
        })
    }

    /// Block until the device signals a result, then read one 16-bit code
    /// into the ring buffer.
    ///
    /// With `timeout: None` the wait is unbounded; callers needing
    /// liveness pass a deadline and get
    /// [`AdcError::DataReadyTimeout`]. The wait busy-polls with a 1 µs
    /// delay per iteration and cannot be cancelled.
    pub fn acquire(
        &mut self,
        bus: &mut dyn SpiBus,
        clock: &dyn Clock,
        timeout: Option<Duration>,
    ) -> Result<u16, AdcError> {
        if let Some(limit) = timeout {
            let deadline = clock.now_ms() + limit.as_millis() as u64;
            while self.drdy.is_high() {
                if clock.now_ms() >= deadline {
                    return Err(AdcError::DataReadyTimeout(limit));
                }
                clock.delay_us(1);
            }
        } else {
            while self.drdy.is_high() {
                clock.delay_us(1);
            }
        }

        bus.begin()?;
        self.cs.set_low();
        bus.transfer(COMMS_READ_DATA)?;
        let hi = bus.transfer(0)?;
        let lo = bus.transfer(0)?;
        self.cs.set_high();
        bus.end();

        let code = u16::from_be_bytes([hi, lo]);
        self.ring.push(code);
        debug!("channel cs={}: sample 0x{:04X}", self.cs_line, code);
        Ok(code)
    }

    /// Average the raw codes recorded over the most recent `timeframe_ms`.
    ///
    /// The window is clamped to what the ring can hold at the configured
    /// rate, and then to the samples actually recorded since the last
    /// successful configuration.
    pub fn average_over_ms(&self, timeframe_ms: u32) -> Result<f32, AdcError> {
        let rate = u32::from(self.sample_rate.hz());
        let max_ms = self.ring.capacity() as u32 * 1000 / rate;
        let window = timeframe_ms.min(max_ms);
        self.average_last(window * rate / 1000)
    }

    /// Average the most recent `samples` raw codes, clamped to available
    /// history. Zero eligible samples is an error, not a NaN.
    pub fn average_last(&self, samples: u32) -> Result<f32, AdcError> {
        let count = samples.min(self.ring.available());
        if count == 0 {
            return Err(AdcError::NoSamples);
        }
        Ok(self.ring.sum_recent(count) as f32 / count as f32)
    }

    /// The most recently recorded code, if any.
    pub fn latest_code(&self) -> Option<u16> {
        self.ring.latest()
    }

    pub fn gain(&self) -> Gain {
        self.gain
    }

    pub fn sample_rate(&self) -> SampleRate {
        self.sample_rate
    }

    /// Worst-case spacing between two samples at the configured rate, ms.
    pub fn max_sample_period_ms(&self) -> u32 {
        self.max_sample_period_ms
    }

    pub fn offset_pa(&self) -> f32 {
        self.offset_pa
    }

    pub fn status(&self) -> ChannelStatus {
        self.status
    }

    pub fn total_samples(&self) -> u32 {
        self.ring.total_samples()
    }

    pub fn cs_line(&self) -> u8 {
        self.cs_line
    }

    pub fn drdy_line(&self) -> u8 {
        self.drdy_line
    }

    /// Clock four all-ones bytes into the selected device so its serial
    /// interface returns to the default state regardless of prior framing.
    fn resync(&mut self, bus: &mut dyn SpiBus) -> Result<(), AdcError> {
        bus.begin()?;
        self.cs.set_low();
        for _ in 0..RESYNC_LEN {
            bus.transfer(RESYNC_BYTE)?;
        }
        self.cs.set_high();
        bus.end();
        Ok(())
    }

    /// Write the configuration pair and wait for the calibration cycle to
    /// finish, bounded by the setup timeout. A timeout is logged but does
    /// not fail the attempt; the subsequent readback decides.
    fn write_setup_and_wait(
        &mut self,
        bus: &mut dyn SpiBus,
        clock: &dyn Clock,
        comms: u8,
        setup: u8,
    ) -> Result<(), AdcError> {
        bus.begin()?;
        self.cs.set_low();
        bus.transfer(comms)?;
        bus.transfer(setup)?;

        let start = clock.now_ms();
        let mut elapsed = 0;
        while self.drdy.is_high() && elapsed <= SETUP_TIMEOUT_MS {
            elapsed = clock.now_ms().saturating_sub(start);
        }
        if elapsed >= SETUP_TIMEOUT_MS {
            warn!(
                "channel cs={}: no completion within {} ms, verifying anyway",
                self.cs_line, SETUP_TIMEOUT_MS
            );
        }

        self.cs.set_high();
        bus.end();
        Ok(())
    }

    /// One-byte register read under a single chip-select bracket.
    fn read_register(&mut self, bus: &mut dyn SpiBus, comms: u8) -> Result<u8, AdcError> {
        bus.begin()?;
        self.cs.set_low();
        bus.transfer(comms)?;
        let value = bus.transfer(0)?;
        self.cs.set_high();
        bus.end();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::mock_hal::{MockBus, MockClock, MockDevice};
    use crate::adc::types::{CURRENT_OFFSET_PA, DEFAULT_CS_LINES};

    fn mock_channel(config: &ChannelConfig) -> (Channel, MockBus, MockClock, MockDevice) {
        let device = MockDevice::new();
        let bus = MockBus::new(vec![device.clone()]);
        let channel = Channel::new(
            Box::new(device.cs_pin()),
            Box::new(device.drdy_pin()),
            config,
        );
        (channel, bus, MockClock::new(), device)
    }

    fn calibrated_channel(config: &ChannelConfig) -> (Channel, MockBus, MockClock, MockDevice) {
        let (mut channel, mut bus, clock, device) = mock_channel(config);
        channel
            .configure(&mut bus, &clock)
            .expect("mock calibration should verify");
        (channel, bus, clock, device)
    }

    #[test]
    fn setup_stores_supported_values_and_corrects_the_rest() {
        let mut config = ChannelConfig::new(8, 25);
        for (gain, rate) in [(1u8, 50u16), (2, 60), (32, 250), (128, 500)] {
            config.gain = gain;
            config.sample_rate_hz = rate;
            let (channel, _, _, _) = mock_channel(&config);
            assert_eq!(channel.gain().value(), gain);
            assert_eq!(channel.sample_rate().hz(), rate);
        }

        config.gain = 7;
        config.sample_rate_hz = 44;
        let (channel, _, _, _) = mock_channel(&config);
        assert_eq!(channel.gain(), Gain::X1);
        assert_eq!(channel.sample_rate(), SampleRate::Hz50);
    }

    #[test]
    fn max_sample_period_rounds_up_on_remainder() {
        let mut config = ChannelConfig::new(8, 25);
        for (rate, expected) in [(50u16, 21u32), (60, 18), (250, 5), (500, 3)] {
            config.sample_rate_hz = rate;
            let (channel, _, _, _) = mock_channel(&config);
            assert_eq!(channel.max_sample_period_ms(), expected, "rate {}", rate);
        }
    }

    #[test]
    fn offset_follows_chip_select_identity_unless_overridden() {
        let config = ChannelConfig::new(DEFAULT_CS_LINES[2], 23);
        let (channel, _, _, _) = mock_channel(&config);
        assert_eq!(channel.offset_pa(), CURRENT_OFFSET_PA[2]);

        let mut config = ChannelConfig::new(DEFAULT_CS_LINES[2], 23);
        config.offset_pa = Some(5.0);
        let (channel, _, _, _) = mock_channel(&config);
        assert_eq!(channel.offset_pa(), 5.0);
    }

    #[test]
    fn configure_verifies_and_resets_state() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = mock_channel(&config);

        assert!(channel.configure(&mut bus, &clock).is_ok());
        assert_eq!(channel.status(), ChannelStatus::Calibrated);
        assert_eq!(channel.total_samples(), 0);
        assert_eq!(channel.latest_code(), None);
        // One attempt means one four-byte resynchronization burst.
        assert_eq!(device.resync_bytes_seen(), 4);
        // Device holds the low six bits of the setup value for 50 Hz.
        assert_eq!(device.setup_register(), 0x66 & 0x3F);
    }

    #[test]
    fn configure_retries_then_succeeds() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = mock_channel(&config);
        device.fail_setup_writes(2);

        assert!(channel.configure(&mut bus, &clock).is_ok());
        // Two failed attempts plus the verified one.
        assert_eq!(device.resync_bytes_seen(), 12);
    }

    #[test]
    fn configure_gives_up_after_three_attempts() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = mock_channel(&config);
        device.fail_setup_writes(3);

        match channel.configure(&mut bus, &clock) {
            Err(AdcError::CalibrationFailed { attempts: 3 }) => {}
            other => panic!("expected CalibrationFailed, got {:?}", other.err()),
        }
        assert_eq!(channel.status(), ChannelStatus::Unconfigured);
        assert_eq!(channel.total_samples(), 0);
        assert_eq!(device.resync_bytes_seen(), 12);
    }

    #[test]
    fn handshake_timeout_does_not_fail_a_good_write() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = mock_channel(&config);
        device.suppress_calibration_drdy();

        // The wait runs into the 350 ms bound, but the readback matches.
        assert!(channel.configure(&mut bus, &clock).is_ok());
        assert_eq!(channel.status(), ChannelStatus::Calibrated);
    }

    #[test]
    fn acquire_reads_big_endian_codes_into_the_ring() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = calibrated_channel(&config);

        device.push_sample(0x1234);
        let code = channel.acquire(&mut bus, &clock, None).unwrap();
        assert_eq!(code, 0x1234);
        assert_eq!(channel.latest_code(), Some(0x1234));
        assert_eq!(channel.total_samples(), 1);
    }

    #[test]
    fn acquire_times_out_when_nothing_is_ready() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = calibrated_channel(&config);
        device.clear_data_ready();

        match channel.acquire(&mut bus, &clock, Some(Duration::from_millis(5))) {
            Err(AdcError::DataReadyTimeout(_)) => {}
            other => panic!("expected DataReadyTimeout, got {:?}", other),
        }
        assert_eq!(channel.total_samples(), 0);
    }

    #[test]
    fn count_average_matches_known_codes() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = calibrated_channel(&config);

        device.push_samples(&[10, 20, 30]);
        for _ in 0..3 {
            channel.acquire(&mut bus, &clock, None).unwrap();
        }

        assert_eq!(channel.average_last(3).unwrap(), 20.0);
        // Requests beyond recorded history clamp.
        assert_eq!(channel.average_last(10).unwrap(), 20.0);
    }

    #[test]
    fn count_average_respects_insertion_order_across_wraparound() {
        let mut config = ChannelConfig::new(8, 25);
        config.capacity = 4;
        let (mut channel, mut bus, clock, device) = calibrated_channel(&config);

        device.push_samples(&[1, 2, 3, 4, 100]);
        for _ in 0..5 {
            channel.acquire(&mut bus, &clock, None).unwrap();
        }

        // The oldest code (1) was evicted; the last four are 2,3,4,100.
        assert_eq!(channel.average_last(4).unwrap(), (2 + 3 + 4 + 100) as f32 / 4.0);
        assert_eq!(channel.average_last(1).unwrap(), 100.0);
    }

    #[test]
    fn time_average_clamps_to_buffer_capacity() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = calibrated_channel(&config);

        device.push_samples(&[40, 60]);
        for _ in 0..2 {
            channel.acquire(&mut bus, &clock, None).unwrap();
        }

        // 100 slots at 50 Hz hold two seconds of history.
        let capacity_time = channel.average_over_ms(2000).unwrap();
        let oversized = channel.average_over_ms(u32::MAX).unwrap();
        assert_eq!(capacity_time, oversized);
        assert_eq!(capacity_time, 50.0);
    }

    #[test]
    fn zero_eligible_samples_is_an_error() {
        let config = ChannelConfig::new(8, 25);
        let (channel, _, _, _) = calibrated_channel(&config);

        assert!(matches!(channel.average_last(5), Err(AdcError::NoSamples)));
        assert!(matches!(
            channel.average_over_ms(1000),
            Err(AdcError::NoSamples)
        ));
        // A non-zero request that converts to zero samples is also an error.
        assert!(matches!(channel.average_over_ms(0), Err(AdcError::NoSamples)));
    }

    #[test]
    fn reconfigure_clears_previous_history() {
        let config = ChannelConfig::new(8, 25);
        let (mut channel, mut bus, clock, device) = calibrated_channel(&config);

        device.push_samples(&[500, 600]);
        for _ in 0..2 {
            channel.acquire(&mut bus, &clock, None).unwrap();
        }
        assert_eq!(channel.total_samples(), 2);

        channel.configure(&mut bus, &clock).unwrap();
        assert_eq!(channel.total_samples(), 0);
        assert!(matches!(channel.average_last(2), Err(AdcError::NoSamples)));
    }
}
