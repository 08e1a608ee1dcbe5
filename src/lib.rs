//! Hub 2 Collector Library
//!
//! This library provides the components of a scheduled SwitchBot Hub 2 to
//! Zabbix telemetry collector:
//!
//! - **config**: INI-based configuration (`[hub2]`, `[zabbix]`)
//! - **device**: Device capability trait and the startup device registry
//! - **client**: Signed SwitchBot Open API v1.1 client
//! - **sink**: Per-cycle metric batching and `zabbix_sender` push
//! - **schedule**: Wall-clock tick alignment
//! - **thermal**: Host temperature sampling
//! - **collector**: The collection loop with per-device retry
//!
//! # Example
//!
//! ```no_run
//! use hub2_collector::client::SwitchBotClient;
//! use hub2_collector::collector::{Collector, RetryPolicy};
//! use hub2_collector::config::Config;
//! use hub2_collector::device::DeviceRegistry;
//! use hub2_collector::sink::MetricSink;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let config = Config::load("sb_hub2_log.ini").expect("Failed to load config");
//!     let client = SwitchBotClient::new(&config.hub2).expect("Failed to create client");
//!
//!     let registry = DeviceRegistry::resolve(&client, &config.hub2.device_ids)
//!         .await
//!         .expect("Unknown device");
//!     let sink = MetricSink::new(config.key_prefix.clone(), config.zabbix.clone(), ".");
//!
//!     let mut collector = Collector::new(
//!         client,
//!         registry,
//!         sink,
//!         RetryPolicy::new(config.hub2.retry),
//!         config.hub2.interval,
//!     );
//!     collector.run_cycle().await;
//! }
//! ```

// Module declarations
pub mod client;
pub mod collector;
pub mod config;
pub mod device;
pub mod schedule;
pub mod sink;
pub mod thermal;

// Re-export commonly used types at crate root for convenience
pub use client::{ClientError, SwitchBotClient};
pub use collector::{poll_device, Collector, CycleReport, PollOutcome, RetryPolicy};
pub use config::{Config, ConfigError, Hub2Config, ZabbixConfig};
pub use device::{Device, DeviceApi, DeviceRegistry, DeviceStatus, FetchError, RegistryError};
pub use schedule::{first_tick_after, CycleClock, Wait};
pub use sink::{FlushReport, Metric, MetricBatch, MetricSink, MetricValue, SinkError};
pub use thermal::{HostThermal, ThermalError};
