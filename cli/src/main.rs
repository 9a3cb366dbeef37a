use std::fs::File;
use std::io::{self, BufWriter, Write};

use clap::Parser;
use color_eyre::{Result, eyre::eyre};
use tokio_serial::SerialStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::CaptureReport;
use crate::cli::{CaptureArgs, Cli, Commands};
use crate::config::Config;
use crate::link::{DeviceLink, Timing};
use crate::output::Layout;

mod capture;
mod cli;
mod config;
mod errors;
mod link;
mod logging;
mod output;

#[tokio::main]
async fn main() -> Result<()> {
    errors::init()?;
    logging::init()?;

    let args = Cli::parse();
    let mut config = Config::new()?;
    config.apply_cli(&args);

    match &args.command {
        Commands::Identify { json } => identify(&config, *json).await,
        Commands::Names => names(&config).await,
        Commands::Capture(capture) => {
            config.apply_capture(capture);
            run_capture(&config, capture).await
        }
    }
}

fn open(config: &Config) -> Result<DeviceLink<SerialStream>> {
    let port = config
        .port
        .as_deref()
        .ok_or_else(|| eyre!("no serial port given; use --port or set SRPICO_PORT"))?;
    DeviceLink::open(
        port,
        config.baud_rate,
        Timing {
            response: config.response_timeout(),
            quiet: config.quiet(),
            stop_drain: config.stop_drain(),
        },
    )
}

async fn identify(config: &Config, json: bool) -> Result<()> {
    let mut link = open(config)?;
    link.reset().await?;
    let identity = link.identify().await?;
    if json {
        let value = serde_json::json!({
            "identity": identity.to_string(),
            "analog_channels": identity.analog_channels,
            "digital_channels": identity.digital_channels,
            "version": identity.version,
            "pin_mode": srpico_host::pin_mode_for(&identity),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{identity}");
        println!(
            "{} digital, {} analog channels, protocol version {}",
            identity.digital_channels, identity.analog_channels, identity.version
        );
    }
    Ok(())
}

async fn names(config: &Config) -> Result<()> {
    let mut link = open(config)?;
    link.reset().await?;
    let identity = link.identify().await?;
    for (channel, pin) in link.pin_names(&identity).await? {
        println!("{channel}\t{pin}");
    }
    Ok(())
}

async fn run_capture(config: &Config, args: &CaptureArgs) -> Result<()> {
    let trigger = config.trigger()?;
    let mut link = open(config)?;
    let prepared = capture::prepare(&mut link, &config.capture, trigger).await?;

    let layout = Layout {
        digital_channels: config.capture.digital_channels,
        analog_channels: config.capture.analog_channels,
        sample_rate: prepared.sample_rate(),
    };
    let out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    let mut writer = output::writer_for(config.format, layout, out);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received");
            interrupt.cancel();
        }
    });

    let summary = capture::receive(&mut link, &prepared, writer.as_mut(), &cancel).await?;
    writer.finish()?;

    let report = CaptureReport::new(&prepared, &summary);
    if !report.bytes_match && report.device_bytes.is_some() {
        warn!(
            host = report.host_bytes,
            device = ?report.device_bytes,
            "byte counts differ; samples may have been lost"
        );
    }
    if args.json {
        eprintln!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        eprintln!(
            "{} samples at {} S/s, {} bytes{}",
            report.samples,
            report.sample_rate,
            report.host_bytes,
            report
                .trigger_at
                .map(|at| format!(", triggered at sample {at}"))
                .unwrap_or_default()
        );
    }
    match summary.error {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
