//! Four-channel acquisition front-end.
//!
//! Owns the shared bus, the clock and the per-channel state behind one
//! mutex, so acquisition writes, averaging reads and reconfiguration
//! resets never interleave. A background task sequentially samples each
//! channel (which also guarantees that no two chip-select brackets
//! overlap on the bus) and publishes windowed readings over an event
//! channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::adc::channel::Channel;
use crate::adc::convert::code_to_current_pa;
use crate::adc::hal::{Clock, SpiBus, SystemClock};
use crate::adc::mock_hal::{MockBus, MockDevice};
use crate::adc::types::{
    AdcError, Backend, ChannelReading, ChannelStatus, MonitorConfig, MonitorEvent,
};

// The bus and its control lines exist once per board; a process-wide lock
// keeps a second front-end instance from claiming them.
lazy_static! {
    static ref HARDWARE_LOCK: std::sync::Mutex<bool> = std::sync::Mutex::new(false);
}

const EVENT_CHANNEL_CAPACITY: usize = 32;
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

struct FrontEndInner {
    bus: Box<dyn SpiBus>,
    clock: Box<dyn Clock>,
    channels: Vec<Channel>,
}

/// The acquisition front-end. Create with [`FrontEnd::new`] (which builds
/// the HAL from the configured backend) or [`FrontEnd::with_hal`] (caller
/// supplies bus, clock and control lines, and retains responsibility for
/// their exclusivity).
pub struct FrontEnd {
    inner: Arc<Mutex<FrontEndInner>>,
    config: MonitorConfig,
    task_handle: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<MonitorEvent>,
    owns_hardware_lock: bool,
}

impl FrontEnd {
    /// Build a front-end and its event receiver from the configuration.
    ///
    /// With `Backend::Ad7715` but no `pi-hardware` support compiled in, a
    /// mock front-end is created instead (with a warning), so development
    /// machines can run the full stack.
    pub fn new(config: MonitorConfig) -> Result<(Self, mpsc::Receiver<MonitorEvent>), AdcError> {
        {
            let mut in_use = HARDWARE_LOCK
                .lock()
                .map_err(|_| AdcError::Other("failed to acquire hardware lock".to_string()))?;
            if *in_use {
                return Err(AdcError::HardwareInUse(
                    "bus already claimed by another front-end instance".to_string(),
                ));
            }
            *in_use = true;
        }

        match Self::build(config) {
            Ok((mut front_end, rx)) => {
                front_end.owns_hardware_lock = true;
                Ok((front_end, rx))
            }
            Err(e) => {
                release_hardware_lock();
                Err(e)
            }
        }
    }

    fn build(config: MonitorConfig) -> Result<(Self, mpsc::Receiver<MonitorEvent>), AdcError> {
        validate(&config)?;

        match config.backend {
            Backend::Ad7715 => Self::build_hardware(config),
            Backend::Mock => Self::build_mock(config),
        }
    }

    #[cfg(feature = "pi-hardware")]
    fn build_hardware(
        config: MonitorConfig,
    ) -> Result<(Self, mpsc::Receiver<MonitorEvent>), AdcError> {
        use crate::adc::rppal_hal::rppal_impl;

        info!("Creating AD7715 front-end with hardware HAL");
        let bus = Box::new(rppal_impl::create_bus()?);
        let mut pins: Vec<(
            Box<dyn crate::adc::hal::OutputPin>,
            Box<dyn crate::adc::hal::InputPin>,
        )> = Vec::with_capacity(config.channels.len());
        for ch in &config.channels {
            let cs = Box::new(rppal_impl::create_cs(ch.cs_line)?);
            let drdy = Box::new(rppal_impl::create_drdy(ch.drdy_line)?);
            pins.push((cs, drdy));
        }
        Self::assemble(config, bus, Box::new(SystemClock::new()), pins)
    }

    #[cfg(not(feature = "pi-hardware"))]
    fn build_hardware(
        config: MonitorConfig,
    ) -> Result<(Self, mpsc::Receiver<MonitorEvent>), AdcError> {
        warn!("pi-hardware feature not enabled, using mock devices");
        Self::build_mock(config)
    }

    fn build_mock(config: MonitorConfig) -> Result<(Self, mpsc::Receiver<MonitorEvent>), AdcError> {
        info!("Creating mock front-end with synthetic devices");
        let devices: Vec<MockDevice> = config
            .channels
            .iter()
            .map(|_| MockDevice::synthetic())
            .collect();
        let pins = devices
            .iter()
            .map(|dev| {
                (
                    Box::new(dev.cs_pin()) as Box<dyn crate::adc::hal::OutputPin>,
                    Box::new(dev.drdy_pin()) as Box<dyn crate::adc::hal::InputPin>,
                )
            })
            .collect();
        let bus = Box::new(MockBus::new(devices));
        Self::assemble(config, bus, Box::new(SystemClock::new()), pins)
    }

    /// Build a front-end over caller-supplied HAL parts. One (chip-select,
    /// data-ready) pair per configured channel is required. The caller
    /// keeps responsibility for bus exclusivity; the process-wide hardware
    /// lock is not taken.
    pub fn with_hal(
        config: MonitorConfig,
        bus: Box<dyn SpiBus>,
        clock: Box<dyn Clock>,
        pins: Vec<(
            Box<dyn crate::adc::hal::OutputPin>,
            Box<dyn crate::adc::hal::InputPin>,
        )>,
    ) -> Result<(Self, mpsc::Receiver<MonitorEvent>), AdcError> {
        validate(&config)?;
        Self::assemble(config, bus, clock, pins)
    }

    fn assemble(
        config: MonitorConfig,
        bus: Box<dyn SpiBus>,
        clock: Box<dyn Clock>,
        pins: Vec<(
            Box<dyn crate::adc::hal::OutputPin>,
            Box<dyn crate::adc::hal::InputPin>,
        )>,
    ) -> Result<(Self, mpsc::Receiver<MonitorEvent>), AdcError> {
        if pins.len() != config.channels.len() {
            return Err(AdcError::ConfigurationError(format!(
                "{} control line pairs supplied for {} channels",
                pins.len(),
                config.channels.len()
            )));
        }

        let channels = pins
            .into_iter()
            .zip(config.channels.iter())
            .map(|((cs, drdy), ch_config)| Channel::new(cs, drdy, ch_config))
            .collect();

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let front_end = FrontEnd {
            inner: Arc::new(Mutex::new(FrontEndInner {
                bus,
                clock,
                channels,
            })),
            config,
            task_handle: None,
            running: Arc::new(AtomicBool::new(false)),
            tx,
            owns_hardware_lock: false,
        };

        info!(
            "Front-end created with {} channel(s)",
            front_end.config.channels.len()
        );
        Ok((front_end, rx))
    }

    /// Configure and calibrate every channel, then start the acquisition
    /// task. A channel whose calibration fails stays unconfigured and is
    /// skipped by the task; the outcome of each channel is published as a
    /// [`MonitorEvent::Calibration`] event.
    pub async fn start(&mut self) -> Result<(), AdcError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AdcError::ConfigurationError(
                "acquisition already running".to_string(),
            ));
        }

        {
            let mut inner = self.inner.lock().await;
            let FrontEndInner {
                bus,
                clock,
                channels,
            } = &mut *inner;

            for (idx, channel) in channels.iter_mut().enumerate() {
                let outcome = channel.configure(bus.as_mut(), clock.as_ref());
                let calibrated = outcome.is_ok();
                if let Err(e) = outcome {
                    warn!("channel {}: calibration failed: {}", idx, e);
                }
                let _ = self
                    .tx
                    .send(MonitorEvent::Calibration {
                        channel: idx,
                        calibrated,
                    })
                    .await;
            }
        }

        self.running.store(true, Ordering::SeqCst);
        self.task_handle = Some(self.spawn_acquisition_task().await);
        info!("Front-end acquisition started");
        Ok(())
    }

    async fn spawn_acquisition_task(&self) -> JoinHandle<()> {
        let inner_arc = self.inner.clone();
        let tx = self.tx.clone();
        let running = self.running.clone();
        let config = self.config.clone();

        // One cycle acquires one sample per channel, so the loop paces
        // itself on the fastest configured rate.
        let pace_ms = {
            let inner = self.inner.lock().await;
            inner
                .channels
                .iter()
                .map(|ch| 1000 / u64::from(ch.sample_rate().hz()))
                .min()
                .unwrap_or(20)
                .max(1)
        };

        tokio::spawn(async move {
            let mut consecutive_errors = 0u32;

            loop {
                if !running.load(Ordering::SeqCst) {
                    break;
                }

                let readings = {
                    let mut inner = inner_arc.lock().await;
                    let FrontEndInner {
                        bus,
                        clock,
                        channels,
                    } = &mut *inner;

                    let mut readings = Vec::with_capacity(channels.len());
                    for (idx, channel) in channels.iter_mut().enumerate() {
                        if channel.status() != ChannelStatus::Calibrated {
                            continue;
                        }

                        let timeout =
                            Duration::from_millis(u64::from(channel.max_sample_period_ms()));
                        match channel.acquire(bus.as_mut(), clock.as_ref(), Some(timeout)) {
                            Ok(_) => consecutive_errors = 0,
                            Err(e) => {
                                warn!("channel {}: acquisition error: {}", idx, e);
                                consecutive_errors += 1;
                                let _ = tx.try_send(MonitorEvent::Error(format!(
                                    "channel {}: {}",
                                    idx, e
                                )));
                                continue;
                            }
                        }

                        if let Ok(raw_average) = channel.average_over_ms(config.window_ms) {
                            let current_pa = code_to_current_pa(
                                raw_average,
                                config.conversion_factor,
                                channel.gain(),
                                channel.offset_pa(),
                            );
                            readings.push(ChannelReading {
                                channel: idx,
                                raw_average,
                                current_pa,
                                timestamp_us: current_timestamp_micros(),
                            });
                        }
                    }
                    readings
                };

                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    error!(
                        "stopping acquisition after {} consecutive errors",
                        consecutive_errors
                    );
                    let _ = tx
                        .send(MonitorEvent::Error(format!(
                            "{} consecutive acquisition errors",
                            consecutive_errors
                        )))
                        .await;
                    running.store(false, Ordering::SeqCst);
                    break;
                }

                if !readings.is_empty() {
                    if tx.send(MonitorEvent::Reading(readings)).await.is_err() {
                        debug!("event channel closed, stopping acquisition task");
                        running.store(false, Ordering::SeqCst);
                        break;
                    }
                }

                sleep(Duration::from_millis(pace_ms)).await;
            }

            debug!("Acquisition task terminated");
        })
    }

    /// Signal the acquisition task to stop and wait for it to finish.
    pub async fn stop(&mut self) -> Result<(), AdcError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Stop called, but acquisition was not running");
        }

        if let Some(handle) = self.task_handle.take() {
            match handle.await {
                Ok(_) => debug!("Acquisition task completed successfully"),
                Err(e) => warn!("Acquisition task terminated with error: {}", e),
            }
        }

        info!("Front-end acquisition stopped");
        Ok(())
    }

    /// Stop acquisition and release the front-end's resources.
    pub async fn shutdown(&mut self) -> Result<(), AdcError> {
        debug!("Shutting down front-end");
        self.stop().await?;
        info!("Front-end shutdown complete");
        Ok(())
    }

    /// Average of a channel's raw codes over the most recent window.
    pub async fn average_over_ms(&self, channel: usize, timeframe_ms: u32) -> Result<f32, AdcError> {
        let inner = self.inner.lock().await;
        channel_ref(&inner, channel)?.average_over_ms(timeframe_ms)
    }

    /// Average of a channel's most recent raw codes.
    pub async fn average_last(&self, channel: usize, samples: u32) -> Result<f32, AdcError> {
        let inner = self.inner.lock().await;
        channel_ref(&inner, channel)?.average_last(samples)
    }

    /// Most recent sample of a channel converted to calibrated current, pA.
    pub async fn latest_current_pa(&self, channel: usize) -> Result<f32, AdcError> {
        let inner = self.inner.lock().await;
        let channel = channel_ref(&inner, channel)?;
        let code = channel.latest_code().ok_or(AdcError::NoSamples)?;
        Ok(code_to_current_pa(
            f32::from(code),
            self.config.conversion_factor,
            channel.gain(),
            channel.offset_pa(),
        ))
    }

    /// Calibration state of every channel, in index order.
    pub async fn channel_statuses(&self) -> Vec<ChannelStatus> {
        let inner = self.inner.lock().await;
        inner.channels.iter().map(|ch| ch.status()).collect()
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }
}

impl Drop for FrontEnd {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            warn!("FrontEnd dropped while acquisition is running; call shutdown() first");
            self.running.store(false, Ordering::SeqCst);
        }
        if self.owns_hardware_lock {
            release_hardware_lock();
        }
    }
}

fn release_hardware_lock() {
    if let Ok(mut in_use) = HARDWARE_LOCK.lock() {
        *in_use = false;
        debug!("Hardware lock released");
    } else {
        error!("Failed to release hardware lock");
    }
}

fn validate(config: &MonitorConfig) -> Result<(), AdcError> {
    if config.channels.is_empty() {
        return Err(AdcError::ConfigurationError(
            "cannot initialize with zero channels".to_string(),
        ));
    }
    if config.window_ms == 0 {
        return Err(AdcError::ConfigurationError(
            "averaging window must be greater than 0".to_string(),
        ));
    }
    Ok(())
}

fn channel_ref(inner: &FrontEndInner, index: usize) -> Result<&Channel, AdcError> {
    inner
        .channels
        .get(index)
        .ok_or_else(|| AdcError::ConfigurationError(format!("no channel {}", index)))
}

/// Microseconds since the Unix epoch; zero if the system clock is skewed
/// before the epoch.
fn current_timestamp_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adc::hal::SystemClock;
    use crate::adc::mock_hal::{MockBus, MockDevice};
    use crate::adc::types::ChannelConfig;
    use tokio::time::timeout;

    fn test_config(channels: usize) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.channels = (0..channels)
            .map(|i| {
                let mut ch = ChannelConfig::new(8 - i as u8, 25 - i as u8);
                // Keep converted values easy to reason about.
                ch.offset_pa = Some(0.0);
                ch
            })
            .collect();
        config.window_ms = 100;
        config
    }

    fn mock_front_end(config: MonitorConfig) -> (FrontEnd, mpsc::Receiver<MonitorEvent>) {
        let devices: Vec<MockDevice> = config
            .channels
            .iter()
            .map(|_| MockDevice::synthetic())
            .collect();
        let pins = devices
            .iter()
            .map(|dev| {
                (
                    Box::new(dev.cs_pin()) as Box<dyn crate::adc::hal::OutputPin>,
                    Box::new(dev.drdy_pin()) as Box<dyn crate::adc::hal::InputPin>,
                )
            })
            .collect();
        let bus = Box::new(MockBus::new(devices));
        FrontEnd::with_hal(config, bus, Box::new(SystemClock::new()), pins)
            .expect("mock front-end should assemble")
    }

    #[tokio::test]
    async fn lifecycle_calibrates_samples_and_stops() {
        let config = test_config(2);
        let (mut front_end, mut rx) = mock_front_end(config);

        assert_eq!(
            front_end.channel_statuses().await,
            vec![ChannelStatus::Unconfigured, ChannelStatus::Unconfigured]
        );

        front_end.start().await.unwrap();

        // The first two events report per-channel calibration.
        for expected in 0..2usize {
            match timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(MonitorEvent::Calibration {
                    channel,
                    calibrated,
                }) => {
                    assert_eq!(channel, expected);
                    assert!(calibrated);
                }
                other => panic!("expected calibration event, got {:?}", other),
            }
        }
        assert_eq!(
            front_end.channel_statuses().await,
            vec![ChannelStatus::Calibrated, ChannelStatus::Calibrated]
        );

        // Then readings flow.
        let mut got_reading = false;
        for _ in 0..10 {
            match timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
                Some(MonitorEvent::Reading(readings)) => {
                    assert!(!readings.is_empty());
                    for reading in &readings {
                        assert!(reading.channel < 2);
                        // Synthetic codes sit near 0x0200 at unity gain
                        // with no offset.
                        assert!(reading.raw_average > 0.0);
                        assert!(reading.current_pa > 0.0);
                    }
                    got_reading = true;
                    break;
                }
                Some(_) => continue,
                None => panic!("event channel closed early"),
            }
        }
        assert!(got_reading, "no reading received");

        // Queries share the same state the task writes into.
        let avg = front_end.average_last(0, 5).await.unwrap();
        assert!(avg > 0.0);
        assert!(front_end.latest_current_pa(0).await.unwrap() > 0.0);

        front_end.stop().await.unwrap();
        front_end.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_calibration_leaves_channel_out_of_rotation() {
        let config = test_config(1);
        let device = MockDevice::synthetic();
        device.fail_setup_writes(3);
        let pins = vec![(
            Box::new(device.cs_pin()) as Box<dyn crate::adc::hal::OutputPin>,
            Box::new(device.drdy_pin()) as Box<dyn crate::adc::hal::InputPin>,
        )];
        let bus = Box::new(MockBus::new(vec![device]));
        let (mut front_end, mut rx) =
            FrontEnd::with_hal(config, bus, Box::new(SystemClock::new()), pins).unwrap();

        front_end.start().await.unwrap();
        match timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            Some(MonitorEvent::Calibration {
                channel,
                calibrated,
            }) => {
                assert_eq!(channel, 0);
                assert!(!calibrated);
            }
            other => panic!("expected calibration event, got {:?}", other),
        }
        assert_eq!(
            front_end.channel_statuses().await,
            vec![ChannelStatus::Unconfigured]
        );

        // No samples ever arrive from an unconfigured channel.
        assert!(matches!(
            front_end.average_last(0, 1).await,
            Err(AdcError::NoSamples)
        ));

        front_end.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_empty_channel_list() {
        let mut config = MonitorConfig::default();
        config.channels.clear();
        match FrontEnd::with_hal(
            config,
            Box::new(MockBus::new(vec![])),
            Box::new(SystemClock::new()),
            vec![],
        ) {
            Err(AdcError::ConfigurationError(_)) => {}
            other => panic!("expected configuration error, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn hardware_lock_admits_one_front_end_at_a_time() {
        let (front_end, _rx) = FrontEnd::new(test_config(1)).unwrap();
        match FrontEnd::new(test_config(1)) {
            Err(AdcError::HardwareInUse(_)) => {}
            other => panic!("expected HardwareInUse, got {:?}", other.err()),
        }
        drop(front_end);
        let (_front_end, _rx) = FrontEnd::new(test_config(1)).unwrap();
    }
}
