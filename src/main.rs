use std::error::Error;

use clap::Parser;
use log::info;

use ad7715_daq::{format_auto, Backend, CurrentUnit, FrontEnd, MonitorConfig, MonitorEvent};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run with simulated devices instead of the hardware bus
    #[arg(long)]
    mock: bool,

    /// Gain applied to every channel (1, 2, 32 or 128)
    #[arg(long, default_value_t = 1)]
    gain: u8,

    /// Sample rate in Hz (50, 60, 250 or 500)
    #[arg(long, default_value_t = 50)]
    sample_rate: u16,

    /// Averaging window applied to printed readings, in ms
    #[arg(long, default_value_t = 1000)]
    window_ms: u32,

    /// Display unit: p, n, u or a (auto)
    #[arg(long, default_value_t = 'a')]
    unit: char,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Args::parse();

    let mut config = MonitorConfig::default();
    config.backend = if args.mock {
        Backend::Mock
    } else {
        Backend::Ad7715
    };
    config.window_ms = args.window_ms;
    for channel in &mut config.channels {
        channel.gain = args.gain;
        channel.sample_rate_hz = args.sample_rate;
    }
    let unit = CurrentUnit::from_selector(args.unit);

    info!(
        "Starting acquisition on {} channel(s) at {} Hz, gain {}",
        config.channels.len(),
        args.sample_rate,
        args.gain
    );

    let (mut front_end, mut events) = FrontEnd::new(config)?;
    front_end.start().await?;

    while let Some(event) = events.recv().await {
        match event {
            MonitorEvent::Reading(readings) => {
                for reading in readings {
                    print_reading(reading.channel, reading.current_pa, unit);
                }
            }
            MonitorEvent::Calibration {
                channel,
                calibrated,
            } => {
                if calibrated {
                    println!("channel {}: calibrated", channel);
                } else {
                    println!("channel {}: calibration FAILED, channel disabled", channel);
                }
            }
            MonitorEvent::Error(message) => {
                eprintln!("acquisition error: {}", message);
            }
        }
    }

    front_end.shutdown().await?;
    Ok(())
}

fn print_reading(channel: usize, current_pa: f32, unit: CurrentUnit) {
    match unit {
        CurrentUnit::Auto => println!("channel {}: {}", channel, format_auto(current_pa)),
        fixed => println!(
            "channel {}: {:.2} [{}]",
            channel,
            fixed.scale(current_pa),
            fixed.label()
        ),
    }
}
