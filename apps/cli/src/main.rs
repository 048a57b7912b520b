use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sdfu_core::transport::{BtleplugTransport, DeviceSelector};
use sdfu_core::{DfuEvent, DfuObserver, SecureDfu, SessionConfig, TracingObserver};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Nordic Secure DFU over BLE (Pure Rust)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install an init packet and firmware image
    Update(UpdateArgs),
    /// Reboot a device from its application into the bootloader
    DfuMode(TargetArgs),
    /// List nearby BLE devices
    Scan {
        /// Scan duration in seconds
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct Target {
    /// Device address (e.g. C0:FF:EE:00:11:22)
    #[arg(long)]
    address: Option<String>,

    /// Advertised device name (e.g. DfuTarg)
    #[arg(long)]
    name: Option<String>,
}

impl Target {
    fn selector(&self) -> DeviceSelector {
        match (&self.address, &self.name) {
            (Some(address), _) => DeviceSelector::Address(address.clone()),
            (None, Some(name)) => DeviceSelector::Name(name.clone()),
            (None, None) => unreachable!("clap requires --address or --name"),
        }
    }
}

#[derive(Args, Debug)]
struct TargetArgs {
    #[command(flatten)]
    target: Target,

    /// Seconds to search for the device
    #[arg(long, default_value_t = 10)]
    scan_timeout: u64,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    /// Path to the init packet (.dat)
    #[arg(long)]
    init: PathBuf,

    /// Path to the firmware image (.bin)
    #[arg(long)]
    firmware: PathBuf,

    #[command(flatten)]
    target: TargetArgs,

    /// Session configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Resend the init packet even if the device already holds it
    #[arg(long)]
    force_init: bool,

    /// Attempts per firmware page before giving up
    #[arg(long)]
    attempts: Option<u32>,

    /// Write packets without response (faster, less robust)
    #[arg(long)]
    no_packet_ack: bool,
}

/// Prints transfer progress on stderr and forwards everything else to tracing.
struct ProgressPrinter;

impl DfuObserver for ProgressPrinter {
    fn on_event(&self, event: &DfuEvent) {
        match event {
            DfuEvent::Progress {
                object,
                current,
                total,
            } => {
                let pct = if *total > 0 { current * 100 / total } else { 0 };
                let mut stderr = std::io::stderr().lock();
                let _ = write!(stderr, "\r{:>8}: {:>3}% ({}/{})", object, pct, current, total);
                if current == total {
                    let _ = writeln!(stderr);
                }
                let _ = stderr.flush();
            }
            other => TracingObserver.on_event(other),
        }
    }
}

fn load_config(args: &UpdateArgs) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig {
            packet_write_with_response: BtleplugTransport::default_packet_write_with_response(),
            ..Default::default()
        },
    };
    if args.force_init {
        config.force_init = true;
    }
    if let Some(attempts) = args.attempts {
        config.firmware_attempts = attempts;
    }
    if args.no_packet_ack {
        config.packet_write_with_response = false;
    }
    Ok(config)
}

async fn open(target: &TargetArgs) -> Result<BtleplugTransport> {
    let adapter = BtleplugTransport::first_adapter().await?;
    let transport = BtleplugTransport::open(
        adapter,
        target.target.selector(),
        Duration::from_secs(target.scan_timeout),
    )
    .await?;
    Ok(transport)
}

async fn update(args: UpdateArgs) -> Result<()> {
    let config = load_config(&args)?;
    let init = std::fs::read(&args.init)
        .with_context(|| format!("Failed to read init packet {}", args.init.display()))?;
    let firmware = std::fs::read(&args.firmware)
        .with_context(|| format!("Failed to read firmware {}", args.firmware.display()))?;
    info!(init = init.len(), firmware = firmware.len(), "Loaded update files");

    let transport = open(&args.target).await?;
    let dfu = SecureDfu::with_observer(config, Arc::new(ProgressPrinter));

    let abort = dfu.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting after the current page");
            abort.abort();
        }
    });

    dfu.update(&transport, &init, &firmware).await?;
    info!("Update finished");
    Ok(())
}

async fn dfu_mode(args: TargetArgs) -> Result<()> {
    let transport = open(&args).await?;
    let dfu = SecureDfu::new(SessionConfig::default());
    dfu.set_dfu_mode(&transport).await?;
    Ok(())
}

async fn scan(seconds: u64) -> Result<()> {
    let adapter = BtleplugTransport::first_adapter().await?;
    info!("Scanning for {}s...", seconds);
    let devices = BtleplugTransport::scan(&adapter, Duration::from_secs(seconds)).await?;
    for device in devices {
        let rssi = device
            .rssi
            .map(|r| format!("{} dBm", r))
            .unwrap_or_else(|| "-".to_string());
        let marker = if device.dfu_service { " [DFU]" } else { "" };
        println!("{}  {:<24} {:>8}{}", device.address, device.name, rssi, marker);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if cli.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let result = match cli.command {
        Command::Update(args) => update(args).await,
        Command::DfuMode(args) => dfu_mode(args).await,
        Command::Scan { seconds } => scan(seconds).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(args: &[&str]) -> Result<DeviceSelector, clap::Error> {
        let cli = Cli::try_parse_from(args.iter().copied())?;
        match cli.command {
            Command::DfuMode(args) => Ok(args.target.selector()),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_target_by_name_or_address() {
        assert_eq!(
            target(&["sdfu", "dfu-mode", "--name", "DfuTarg"]).unwrap(),
            DeviceSelector::Name("DfuTarg".into())
        );
        assert_eq!(
            target(&["sdfu", "dfu-mode", "--address", "C0:FF:EE:00:11:22"]).unwrap(),
            DeviceSelector::Address("C0:FF:EE:00:11:22".into())
        );
    }

    #[test]
    fn test_target_requires_exactly_one_selector() {
        assert!(target(&["sdfu", "dfu-mode"]).is_err());
        assert!(
            target(&[
                "sdfu",
                "dfu-mode",
                "--name",
                "DfuTarg",
                "--address",
                "C0:FF:EE:00:11:22"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_update_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "sdfu",
            "update",
            "--init",
            "app.dat",
            "--firmware",
            "app.bin",
            "--name",
            "DfuTarg",
            "--attempts",
            "5",
            "--force-init",
            "--no-packet-ack",
        ])
        .unwrap();
        let Command::Update(args) = cli.command else {
            panic!("expected update");
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.firmware_attempts, 5);
        assert!(config.force_init);
        assert!(!config.packet_write_with_response);
    }
}
