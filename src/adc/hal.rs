use std::io;
use std::time::Instant;

/// Serial bus abstraction for the AD7715 front-end.
///
/// The device speaks a byte-oriented SPI dialect: every logical transaction
/// is bracketed by `begin`/`end` session calls and exchanges one byte at a
/// time. Chip select is driven separately per channel, so the bus itself
/// carries no addressing.
pub trait SpiBus: Send {
    /// Open a bus session for one logical transaction.
    fn begin(&mut self) -> Result<(), io::Error>;

    /// Close the current bus session.
    fn end(&mut self);

    /// Exchange a single byte (write one, receive one).
    fn transfer(&mut self, byte: u8) -> Result<u8, io::Error>;
}

/// Digital output line used as a per-channel chip select.
///
/// The AD7715 is selected while the line is low and idle while high.
pub trait OutputPin: Send {
    fn set_high(&mut self);
    fn set_low(&mut self);
}

/// Digital input line used as a per-channel data-ready signal.
///
/// Active-low convention: the device has a result (or has finished a
/// calibration cycle) when the line reads low.
pub trait InputPin: Send {
    fn is_high(&self) -> bool;

    fn is_low(&self) -> bool {
        !self.is_high()
    }
}

/// Monotonic time source used for handshake timeouts and poll delays.
pub trait Clock: Send + Sync {
    /// Milliseconds elapsed since some fixed origin.
    fn now_ms(&self) -> u64;

    /// Block the caller for roughly `us` microseconds.
    fn delay_us(&self, us: u64);
}

/// Wall-clock implementation of [`Clock`] backed by `std::time::Instant`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn delay_us(&self, us: u64) {
        std::thread::sleep(std::time::Duration::from_micros(us));
    }
}
