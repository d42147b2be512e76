//! CLI Entry Point for probe-daq
//!
//! Provides command-line access to a gauging station:
//! - `ports`: list serial ports visible to the host
//! - `poll`: poll one box once and print its channels
//! - `live`: continuous acquisition, printing live values until Ctrl-C
//! - `collect`: bounded acquisition of N distinct samples per parameter
//!
//! Every acquisition command reads `config/probe.toml` (or `--config`).
//! `--mock` replaces the serial line with a simulated box bus answering for
//! every configured box.
//!
//! # Usage
//!
//! ```bash
//! probe-daq --mock live
//! probe-daq --config station.toml collect --count 20 --timeout-ms 30000
//! probe-daq poll --box 3
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use probe_daq::acquisition::{poll_once, Scheduler, SessionHandle};
use probe_daq::config::{ProbeConfig, DEFAULT_CONFIG_PATH};
use probe_daq::protocol::BoxId;
use probe_daq::store::SampleStore;
use probe_daq::transport::mock::MockBus;
use probe_daq::transport::{self, Transport};
use probe_daq::{logging, SessionState};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "probe-daq")]
#[command(about = "Multi-channel gauging box acquisition", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use a simulated box bus instead of the serial port
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Poll one box once and print its four channels
    Poll {
        /// Box address (1-999)
        #[arg(long = "box")]
        box_id: u16,
    },

    /// Continuous acquisition until Ctrl-C
    Live {
        /// Refresh interval for the printed table
        #[arg(long, default_value = "500")]
        interval_ms: u64,
    },

    /// Collect distinct samples for every parameter
    Collect {
        /// Samples per parameter (defaults to acquisition.target_count)
        #[arg(long)]
        count: Option<usize>,

        /// Give up after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Ports = cli.command {
        logging::init(logging::TracingConfig::default()).map_err(anyhow::Error::msg)?;
        return list_ports();
    }

    let config = ProbeConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config).map_err(anyhow::Error::msg)?;

    let mock = cli.mock.then(|| simulated_bus(&config));
    info!(
        name = %config.application.name,
        port = %config.serial.port,
        dialect = config.protocol.name(),
        mock = cli.mock,
        "configuration loaded"
    );

    match cli.command {
        Commands::Ports => Ok(()),
        Commands::Poll { box_id } => poll(&config, mock.as_ref(), box_id).await,
        Commands::Live { interval_ms } => {
            live(&config, mock.as_ref(), Duration::from_millis(interval_ms)).await
        }
        Commands::Collect { count, timeout_ms } => {
            let target = count.unwrap_or(config.acquisition.target_count);
            collect(&config, mock.as_ref(), target, timeout_ms.map(Duration::from_millis)).await
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = transport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        println!("{}", port);
    }
    Ok(())
}

/// Simulated bus with a steady, slightly noisy reading on every configured box.
fn simulated_bus(config: &ProbeConfig) -> MockBus {
    let bus = MockBus::new(config.protocol.clone());
    for binding in &config.parameters {
        let id = binding.box_id.get();
        let base = f64::from(id) * 0.001;
        bus.set_values(id, [base, base + 0.010, base - 0.010, base + 0.020]);
        bus.set_jitter(id, 0.002);
    }
    bus
}

fn open_transport(config: &ProbeConfig, mock: Option<&MockBus>) -> Box<dyn Transport> {
    match mock {
        Some(bus) => Box::new(bus.transport(format!("mock:{}", config.serial.port))),
        None => Box::new(config.serial_transport()),
    }
}

async fn poll(config: &ProbeConfig, mock: Option<&MockBus>, box_id: u16) -> Result<()> {
    let box_id = BoxId::new(box_id)?;
    let mut transport = open_transport(config, mock);
    transport.open().await?;

    let result = poll_once(
        &mut transport,
        &config.protocol,
        box_id,
        config.scheduler_settings().box_timeout,
    )
    .await;
    transport.close().await;

    let values = result?;
    println!("Box {}", box_id);
    for (channel, value) in (1u8..).zip(values.as_array()) {
        if value.is_finite() {
            println!("  channel {}: {:.3}", channel, value);
        } else {
            println!("  channel {}: invalid", channel);
        }
    }
    Ok(())
}

async fn live(config: &ProbeConfig, mock: Option<&MockBus>, interval: Duration) -> Result<()> {
    let scheduler = Scheduler::new(config.registry()?, config.scheduler_settings());
    if let Err(e) = scheduler.registry().check_channels() {
        warn!(error = %e, "parameter will report a channel fault every tick");
    }
    let mut session = scheduler
        .start_continuous(open_transport(config, mock))
        .await?;
    let store = scheduler.store();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut refresh = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = refresh.tick() => print_live(&store, &session),
        }
    }

    finish(&mut session).await;
    Ok(())
}

fn print_live(store: &SampleStore, session: &SessionHandle) {
    println!("--- tick {}", session.ticks());
    for name in store.parameters() {
        if let Some(cell) = store.live_value(name) {
            if cell.has_reading() {
                println!("{:<24} {}", name, cell.text);
            } else {
                println!("{:<24} -", name);
            }
        }
    }
}

async fn collect(
    config: &ProbeConfig,
    mock: Option<&MockBus>,
    target: usize,
    limit: Option<Duration>,
) -> Result<()> {
    let scheduler = Scheduler::new(config.registry()?, config.scheduler_settings());
    let mut session = scheduler
        .start_bounded(open_transport(config, mock), target)
        .await?;

    let outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        outcome = wait_bounded(&session, limit) => Some(outcome),
    };
    finish(&mut session).await;

    let store = scheduler.store();
    for name in store.parameters() {
        let samples = store.samples(name).unwrap_or_default();
        let rendered: Vec<String> = samples.iter().map(|v| format!("{:.3}", v)).collect();
        println!("{:<24} [{}]", name, rendered.join(", "));
    }

    match outcome {
        Some(Ok(progress)) => {
            info!(samples = progress.target, "collection complete");
            Ok(())
        }
        Some(Err(progress)) => {
            let pending: Vec<&str> = progress.pending().collect();
            anyhow::bail!(
                "collection incomplete: {} of {} parameters short of {} samples ({})",
                pending.len(),
                progress.counts.len(),
                progress.target,
                pending.join(", ")
            )
        }
        None => anyhow::bail!("collection interrupted"),
    }
}

async fn wait_bounded(
    session: &SessionHandle,
    limit: Option<Duration>,
) -> std::result::Result<probe_daq::BoundedProgress, probe_daq::BoundedProgress> {
    match limit {
        Some(limit) => session.wait_complete_timeout(limit).await,
        None => match session.wait_finished().await {
            SessionState::Completed => Ok(session.progress()),
            _ => Err(session.progress()),
        },
    }
}

async fn finish(session: &mut SessionHandle) {
    let state = session.stop().await;
    info!(?state, ticks = session.ticks(), port = session.port(), "session closed");
}
