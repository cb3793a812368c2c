//! Simulated AD7715 devices for development and tests.
//!
//! One [`MockDevice`] stands in for one physical converter: it latches
//! communications bytes, answers setup/data register reads, and models the
//! data-ready line. A [`MockBus`] routes transfers to whichever device is
//! currently chip-selected, so the same wiring shape as the real board
//! (shared bus, per-channel select and ready lines) holds in tests.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use rand::Rng;

use super::hal::{Clock, InputPin, OutputPin, SpiBus};
use super::registers::{COMMS_READ_BIT, RESYNC_BYTE, SETUP_VERIFY_MASK};

struct DeviceState {
    selected: bool,
    setup_reg: u8,
    /// true when the data-ready line is asserted (reads low).
    drdy_ready: bool,
    pending: VecDeque<u16>,
    /// Bytes queued to clock out for an in-flight register read.
    reply: VecDeque<u8>,
    awaiting_setup_write: bool,
    failing_setup_writes: u32,
    resync_bytes: u32,
    /// Generate noise codes on demand instead of draining `pending`.
    synthetic: bool,
    /// When false, a setup write stores the register but never asserts
    /// data ready, so the calibration handshake runs into its timeout.
    calibration_asserts_drdy: bool,
}

impl DeviceState {
    fn process(&mut self, byte: u8) -> u8 {
        if let Some(out) = self.reply.pop_front() {
            return out;
        }

        if self.awaiting_setup_write {
            self.awaiting_setup_write = false;
            let stored = byte & SETUP_VERIFY_MASK;
            if self.failing_setup_writes > 0 {
                self.failing_setup_writes -= 1;
                // Flip a couple of bits so verification cannot match.
                self.setup_reg = stored ^ 0x2A;
                debug!("mock: corrupting setup write 0x{:02X}", byte);
            } else {
                self.setup_reg = stored;
            }
            // A setup write starts a calibration cycle; it completes
            // instantly in the mock unless configured otherwise.
            if self.calibration_asserts_drdy {
                self.drdy_ready = true;
            }
            return 0;
        }

        if byte == RESYNC_BYTE {
            self.resync_bytes += 1;
            return 0;
        }

        let register = (byte >> 4) & 0x07;
        let read = byte & COMMS_READ_BIT != 0;
        match (register, read) {
            (1, false) => self.awaiting_setup_write = true,
            (1, true) => self.reply.push_back(self.setup_reg),
            (3, true) => {
                let code = self.next_code();
                self.reply.push_back((code >> 8) as u8);
                self.reply.push_back(code as u8);
            }
            _ => {}
        }
        0
    }

    fn next_code(&mut self) -> u16 {
        if let Some(code) = self.pending.pop_front() {
            if self.pending.is_empty() && !self.synthetic {
                self.drdy_ready = false;
            }
            code
        } else if self.synthetic {
            0x0200 + rand::thread_rng().gen_range(0..32)
        } else {
            self.drdy_ready = false;
            0
        }
    }
}

/// Handle to one simulated converter. Clones share state.
#[derive(Clone)]
pub struct MockDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A device that always has a fresh noise code ready, for running the
    /// front-end without hardware.
    pub fn synthetic() -> Self {
        let dev = Self::build(true);
        dev.state().drdy_ready = true;
        dev
    }

    fn build(synthetic: bool) -> Self {
        MockDevice {
            state: Arc::new(Mutex::new(DeviceState {
                selected: false,
                setup_reg: 0,
                drdy_ready: false,
                pending: VecDeque::new(),
                reply: VecDeque::new(),
                awaiting_setup_write: false,
                failing_setup_writes: 0,
                resync_bytes: 0,
                synthetic,
                calibration_asserts_drdy: true,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().expect("mock AD7715 state poisoned")
    }

    /// Queue one conversion result and assert data ready.
    pub fn push_sample(&self, code: u16) {
        let mut state = self.state();
        state.pending.push_back(code);
        state.drdy_ready = true;
    }

    pub fn push_samples(&self, codes: &[u16]) {
        for &code in codes {
            self.push_sample(code);
        }
    }

    /// Force the data-ready line high, as after a consumed conversion.
    pub fn clear_data_ready(&self) {
        self.state().drdy_ready = false;
    }

    /// Corrupt the next `count` setup-register writes so that calibration
    /// verification fails.
    pub fn fail_setup_writes(&self, count: u32) {
        self.state().failing_setup_writes = count;
    }

    /// Keep the data-ready line deasserted during calibration, forcing the
    /// handshake to run into its timeout.
    pub fn suppress_calibration_drdy(&self) {
        self.state().calibration_asserts_drdy = false;
    }

    /// Total resynchronization bytes this device has seen.
    pub fn resync_bytes_seen(&self) -> u32 {
        self.state().resync_bytes
    }

    pub fn setup_register(&self) -> u8 {
        self.state().setup_reg
    }

    pub fn cs_pin(&self) -> MockCsPin {
        MockCsPin {
            state: self.state.clone(),
        }
    }

    pub fn drdy_pin(&self) -> MockDrdyPin {
        MockDrdyPin {
            state: self.state.clone(),
        }
    }
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared bus routing transfers to the currently selected device.
pub struct MockBus {
    devices: Vec<MockDevice>,
}

impl MockBus {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        MockBus { devices }
    }
}

impl SpiBus for MockBus {
    fn begin(&mut self) -> Result<(), io::Error> {
        Ok(())
    }

    fn end(&mut self) {}

    fn transfer(&mut self, byte: u8) -> Result<u8, io::Error> {
        for dev in &self.devices {
            let mut state = dev.state();
            if state.selected {
                return Ok(state.process(byte));
            }
        }
        // Nothing selected: the bus floats.
        Ok(0)
    }
}

/// Chip-select line of a [`MockDevice`]; selecting resets byte framing.
pub struct MockCsPin {
    state: Arc<Mutex<DeviceState>>,
}

impl OutputPin for MockCsPin {
    fn set_high(&mut self) {
        let mut state = self.state.lock().expect("mock AD7715 state poisoned");
        state.selected = false;
    }

    fn set_low(&mut self) {
        let mut state = self.state.lock().expect("mock AD7715 state poisoned");
        state.selected = true;
        state.reply.clear();
        state.awaiting_setup_write = false;
    }
}

/// Data-ready line of a [`MockDevice`] (active low).
pub struct MockDrdyPin {
    state: Arc<Mutex<DeviceState>>,
}

impl InputPin for MockDrdyPin {
    fn is_high(&self) -> bool {
        !self
            .state
            .lock()
            .expect("mock AD7715 state poisoned")
            .drdy_ready
    }
}

/// Deterministic clock for tests: time advances a little on every read and
/// by the requested amount on every delay, so busy-waits always terminate.
pub struct MockClock {
    now_us: AtomicU64,
}

impl MockClock {
    pub fn new() -> Self {
        MockClock {
            now_us: AtomicU64::new(0),
        }
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.now_us.fetch_add(10, Ordering::SeqCst) / 1000
    }

    fn delay_us(&self, us: u64) {
        self.now_us.fetch_add(us, Ordering::SeqCst);
    }
}
