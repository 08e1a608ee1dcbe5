//! Collection loop: tick alignment, per-device retry, and one push per cycle.
//!
//! Every cycle optionally samples the host temperature, polls each registered
//! device in order, then flushes the sink. Device failures are isolated: a
//! device that keeps failing only costs its own retry budget, and nothing a
//! device or the push transport does can stop the loop. The only way out is
//! the shutdown future handed to [`Collector::run`].

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::device::{Device, DeviceApi, DeviceRegistry, DeviceStatus, FetchError};
use crate::schedule::{CycleClock, Wait};
use crate::sink::{FlushReport, MetricSink, MetricValue};
use crate::thermal::{HostThermal, HOST_TEMPERATURE_KEY};

/// Fixed pause between attempts after a recoverable failure.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Status fields forwarded per device; anything else in a snapshot is ignored.
pub const TRACKED_METRICS: [&str; 3] = ["humidity", "temperature", "light_level"];

/// Attempt budget for one device within one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum status fetches per device per cycle (at least one is made)
    pub attempts: u32,

    /// Pause between consecutive attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

/// How one device fared in one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Readings recorded after `attempts` fetches
    Recorded { attempts: u32 },

    /// Every attempt failed with a recoverable error
    Exhausted { attempts: u32 },

    /// Connectivity failure; remaining attempts were skipped
    Abandoned { attempts: u32 },
}

impl PollOutcome {
    pub fn attempts(&self) -> u32 {
        match *self {
            PollOutcome::Recorded { attempts }
            | PollOutcome::Exhausted { attempts }
            | PollOutcome::Abandoned { attempts } => attempts,
        }
    }

    pub fn is_recorded(&self) -> bool {
        matches!(self, PollOutcome::Recorded { .. })
    }
}

/// Summary of one collection cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Host temperature in °C, if sampling is enabled and the read succeeded
    pub host_temperature: Option<f64>,

    /// Devices that produced readings
    pub devices_ok: usize,

    /// Devices that produced nothing this cycle
    pub devices_failed: usize,

    /// Metrics recorded before the flush
    pub metrics: usize,

    /// What the flush did with them
    pub flush: FlushReport,
}

/// Poll one device with bounded retry, recording its readings on success.
///
/// Recoverable failures are retried after `policy.backoff`, up to
/// `policy.attempts` fetches in total. A connectivity failure abandons the
/// device for this cycle at once.
pub async fn poll_device<A>(
    api: &A,
    device: &Device,
    sink: &mut MetricSink,
    policy: &RetryPolicy,
) -> PollOutcome
where
    A: DeviceApi + ?Sized,
{
    let max_attempts = policy.attempts.max(1);

    for attempt in 1..=max_attempts {
        let error = match api.fetch_status(device).await {
            Ok(status) => match tracked_readings(&status) {
                Ok(readings) => {
                    for (name, value) in readings {
                        sink.record(format!("{}.{}", device.id, name), value);
                    }
                    debug!(device_id = %device.id, attempt = attempt, "Recorded device status");
                    return PollOutcome::Recorded { attempts: attempt };
                }
                Err(missing) => {
                    FetchError::Recoverable(format!("status snapshot has no {missing}"))
                }
            },
            Err(e) => e,
        };

        if !error.is_retryable() {
            warn!(
                device_id = %device.id,
                attempt = attempt,
                error = %error,
                "Device unreachable, skipping until next cycle"
            );
            return PollOutcome::Abandoned { attempts: attempt };
        }

        warn!(
            device_id = %device.id,
            attempt = attempt,
            max_attempts = max_attempts,
            error = %error,
            "Status fetch failed"
        );
        if attempt < max_attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    debug!(
        device_id = %device.id,
        attempts = max_attempts,
        "Retry budget exhausted, no readings this cycle"
    );
    PollOutcome::Exhausted {
        attempts: max_attempts,
    }
}

/// The forwarded readings, or the name of the first missing one.
fn tracked_readings(
    status: &DeviceStatus,
) -> Result<Vec<(&'static str, MetricValue)>, &'static str> {
    TRACKED_METRICS
        .iter()
        .map(|&name| status.get(name).map(|value| (name, value)).ok_or(name))
        .collect()
}

/// Owns everything one collection loop needs.
pub struct Collector<A> {
    api: A,
    registry: DeviceRegistry,
    sink: MetricSink,
    policy: RetryPolicy,
    interval: Duration,
    thermal: Option<HostThermal>,
    cycles: u64,
}

impl<A: DeviceApi> Collector<A> {
    pub fn new(
        api: A,
        registry: DeviceRegistry,
        sink: MetricSink,
        policy: RetryPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            api,
            registry,
            sink,
            policy,
            interval,
            thermal: None,
            cycles: 0,
        }
    }

    /// Sample `thermal` at the start of every cycle.
    pub fn with_host_temperature(mut self, thermal: HostThermal) -> Self {
        self.thermal = Some(thermal);
        self
    }

    #[cfg(test)]
    pub(crate) fn api(&self) -> &A {
        &self.api
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &MetricSink {
        &self.sink
    }

    /// Number of cycles completed so far.
    #[cfg(test)]
    pub(crate) fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run cycles on interval boundaries until `shutdown` resolves.
    ///
    /// `shutdown` is only observed between cycles; a cycle in progress
    /// always finishes, including its flush.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let mut clock = CycleClock::new(self.interval, Utc::now());
        info!(
            interval_secs = clock.interval().as_secs(),
            devices = self.registry.len(),
            attempts = self.policy.attempts,
            host_temperature = self.thermal.is_some(),
            push = self.sink.is_enabled(),
            first_tick = %clock.next_tick(),
            "Collector started"
        );

        loop {
            match clock.plan(Utc::now()) {
                Wait::Sleep { until, duration } => {
                    debug!(tick = %until, wait_ms = duration.as_millis() as u64, "Waiting for next tick");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = tokio::time::sleep(duration) => {}
                    }
                }
                Wait::Overrun { missed } => {
                    warn!(
                        missed_tick = %missed,
                        next_tick = %clock.next_tick(),
                        "Previous cycle overran the interval, collecting immediately"
                    );
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        _ = std::future::ready(()) => {}
                    }
                }
            }

            self.run_cycle().await;
        }

        let stats = self.sink.stats();
        info!(
            cycles = self.cycles,
            metrics_recorded = stats.metrics_recorded,
            pushes_sent = stats.pushes_sent,
            pushes_failed = stats.pushes_failed,
            "Shutdown signal received, collector stopped"
        );
    }

    /// Run one collection cycle immediately.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.sink.begin_cycle();

        let mut host_temperature = None;
        if let Some(thermal) = &self.thermal {
            match thermal.read_celsius().await {
                Ok(celsius) => {
                    self.sink.record(HOST_TEMPERATURE_KEY, celsius);
                    host_temperature = Some(celsius);
                }
                Err(e) => warn!(error = %e, "Failed to read host temperature"),
            }
        }

        let mut devices_ok = 0;
        let mut devices_failed = 0;
        for device in self.registry.iter() {
            let outcome = poll_device(&self.api, device, &mut self.sink, &self.policy).await;
            if outcome.is_recorded() {
                devices_ok += 1;
            } else {
                devices_failed += 1;
            }
        }

        let metrics = self.sink.pending().len();
        let flush = self.sink.flush().await;
        self.cycles += 1;

        info!(
            cycle = self.cycles,
            devices_ok = devices_ok,
            devices_failed = devices_failed,
            metrics = metrics,
            "Collection cycle finished"
        );

        CycleReport {
            host_temperature,
            devices_ok,
            devices_failed,
            metrics,
            flush,
        }
    }
}
