//! sb-hub2-log - SwitchBot Hub 2 telemetry collector
//!
//! Polls the configured Hub 2 devices for temperature, humidity and light
//! level on wall-clock aligned intervals and pushes each cycle's readings to
//! Zabbix with `zabbix_sender`.
//!
//! ## Usage
//!
//! ```text
//! sb-hub2-log [-t|--temp]
//! ```
//!
//! `-t` also records the host SoC temperature every cycle.
//!
//! ## Configuration
//!
//! - `SB_HUB2_LOG_CONFIG`: INI file path (default: sb_hub2_log.ini)
//! - `RUST_LOG`: Logging level filter (default: info)
//!
//! The trap file and the sender transcript (`zabbix.trap`, `zabbix.log`) are
//! written to the working directory.

use clap::Parser;
use thiserror::Error;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hub2_collector::client::{ClientError, SwitchBotClient};
use hub2_collector::collector::{Collector, RetryPolicy};
use hub2_collector::config::Config;
use hub2_collector::device::{DeviceRegistry, RegistryError};
use hub2_collector::sink::MetricSink;
use hub2_collector::thermal::HostThermal;

/// Log SwitchBot Hub 2 readings to Zabbix.
#[derive(Parser, Debug)]
#[command(name = "sb-hub2-log", version, about)]
struct Cli {
    /// Also log the host (Raspberry Pi) temperature
    #[arg(short = 't', long = "temp")]
    temp: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    init_tracing();

    info!("Starting Hub 2 collector...");

    let config_path = Config::path_from_env();
    let config = match Config::load(&config_path) {
        Ok(config) => {
            info!(
                path = %config_path.display(),
                devices = config.hub2.device_ids.len(),
                retry = config.hub2.retry,
                interval_secs = config.hub2.interval.as_secs(),
                api_url = %config.hub2.api_url,
                zabbix_server = config.zabbix.as_ref().map(|z| z.server.as_str()),
                key_prefix = %config.key_prefix,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let mut collector = match start(&config, cli.temp).await {
        Ok(collector) => collector,
        Err(e) => {
            error!(error = %e, "Failed to start collector");
            std::process::exit(1);
        }
    };

    info!("Hub 2 collector running. Press Ctrl+C to stop.");
    collector.run(shutdown_signal()).await;

    info!("Hub 2 collector stopped");
}

/// Fatal errors while wiring the collector together.
#[derive(Debug, Error)]
enum StartupError {
    #[error("failed to create SwitchBot client: {0}")]
    Client(#[from] ClientError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Build the collector: API client, resolved device registry, and sink.
///
/// Fails before any cycle runs if a configured device cannot be resolved.
async fn start(
    config: &Config,
    host_temperature: bool,
) -> Result<Collector<SwitchBotClient>, StartupError> {
    let client = SwitchBotClient::new(&config.hub2)?;

    let registry = DeviceRegistry::resolve(&client, &config.hub2.device_ids).await?;
    info!(
        devices = ?registry.ids().collect::<Vec<_>>(),
        "Devices resolved"
    );

    let sink = MetricSink::new(config.key_prefix.clone(), config.zabbix.clone(), ".");
    let mut collector = Collector::new(
        client,
        registry,
        sink,
        RetryPolicy::new(config.hub2.retry),
        config.hub2.interval,
    );
    if host_temperature {
        let thermal = HostThermal::default();
        info!(path = %thermal.path().display(), "Host temperature sampling enabled");
        collector = collector.with_host_temperature(thermal);
    }
    Ok(collector)
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}

/// Resolves on Ctrl+C. If the handler cannot be installed, never resolves and
/// the default signal disposition stays in effect.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
