#[cfg(feature = "pi-hardware")]
pub mod rppal_impl {
    use std::io;

    use log::{debug, error, info};
    use rppal::gpio::Gpio;
    use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

    use crate::adc::hal::{InputPin, OutputPin, SpiBus};

    /// SPI bus implementation using rppal.
    ///
    /// Chip select is driven manually per channel through GPIO, so the
    /// controller's own slave select stays unused. Mode 1 (CPOL=0, CPHA=1)
    /// matches the AD7715 serial interface.
    pub struct RppalBus {
        spi: Spi,
    }

    impl RppalBus {
        pub fn new() -> Result<Self, io::Error> {
            let spi_speed = 500_000;
            info!(
                "Initializing SPI with speed: {} Hz, Mode: Mode1 (CPOL=0, CPHA=1)",
                spi_speed
            );

            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, spi_speed, Mode::Mode1)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            Ok(RppalBus { spi })
        }
    }

    impl SpiBus for RppalBus {
        fn begin(&mut self) -> Result<(), io::Error> {
            // The kernel SPI device stays open for the process lifetime;
            // session brackets only delimit logical transactions.
            Ok(())
        }

        fn end(&mut self) {}

        fn transfer(&mut self, byte: u8) -> Result<u8, io::Error> {
            let mut read = [0u8; 1];
            self.spi
                .transfer(&mut read, &[byte])
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            Ok(read[0])
        }
    }

    /// Chip-select line implementation using rppal.
    pub struct RppalCsPin(rppal::gpio::OutputPin);

    impl OutputPin for RppalCsPin {
        fn set_high(&mut self) {
            self.0.set_high();
        }

        fn set_low(&mut self) {
            self.0.set_low();
        }
    }

    /// Data-ready line implementation using rppal.
    pub struct RppalDrdyPin(rppal::gpio::InputPin);

    impl InputPin for RppalDrdyPin {
        fn is_high(&self) -> bool {
            self.0.is_high()
        }
    }

    /// Helper function to create the shared bus.
    pub fn create_bus() -> Result<RppalBus, io::Error> {
        debug!("Creating hardware SPI bus");
        RppalBus::new()
    }

    /// Helper function to create a chip-select output, driven high (idle).
    pub fn create_cs(line: u8) -> Result<RppalCsPin, io::Error> {
        debug!("Creating chip-select output on GPIO {}", line);
        let gpio = map_gpio_err(Gpio::new())?;
        let pin = map_gpio_err(gpio.get(line))?;
        Ok(RppalCsPin(pin.into_output_high()))
    }

    /// Helper function to create a data-ready input with pull-up.
    pub fn create_drdy(line: u8) -> Result<RppalDrdyPin, io::Error> {
        debug!("Creating data-ready input on GPIO {}", line);
        let gpio = map_gpio_err(Gpio::new())?;
        let pin = map_gpio_err(gpio.get(line))?;
        Ok(RppalDrdyPin(pin.into_input_pullup()))
    }

    fn map_gpio_err<T, E: std::fmt::Display>(result: Result<T, E>) -> Result<T, io::Error> {
        result.map_err(|e| {
            error!("GPIO error: {}", e);
            error!("Make sure the GPIO interface is enabled and the user has permission to access it.");
            io::Error::new(io::ErrorKind::Other, e.to_string())
        })
    }
}
