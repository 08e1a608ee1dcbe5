//! Metric sink module for batching readings and pushing them to Zabbix.
//!
//! Readings are accumulated per collection cycle in a [`MetricBatch`] and
//! pushed once at the end of the cycle by writing a trap file and invoking
//! `zabbix_sender` on it. Recording never depends on whether a push target is
//! configured; without one, flushing just discards the batch.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ZabbixConfig;

/// Trap file handed to the sender with `-i`.
pub const TRAP_FILE: &str = "zabbix.trap";

/// Combined stdout/stderr of the last sender invocation.
pub const TRANSCRIPT_FILE: &str = "zabbix.log";

/// A numeric reading. Integers and floats render differently in the trap
/// file (`55` vs `45.0`) so Zabbix numeric(unsigned) items accept them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Integer(i64),
    Float(f64),
}

impl MetricValue {
    /// Convert a JSON number, keeping integers as integers.
    pub fn from_json(number: &serde_json::Number) -> Option<Self> {
        match number.as_i64() {
            Some(i) => Some(MetricValue::Integer(i)),
            None => number.as_f64().map(MetricValue::Float),
        }
    }

    pub fn as_f64(&self) -> f64 {
        match *self {
            MetricValue::Integer(i) => i as f64,
            MetricValue::Float(f) => f,
        }
    }
}

impl From<i64> for MetricValue {
    fn from(value: i64) -> Self {
        MetricValue::Integer(value)
    }
}

impl From<i32> for MetricValue {
    fn from(value: i32) -> Self {
        MetricValue::Integer(i64::from(value))
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Float(value)
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Integer(i) => write!(f, "{i}"),
            // Debug keeps the trailing ".0" on whole floats
            MetricValue::Float(v) => write!(f, "{v:?}"),
        }
    }
}

/// A single prefixed item key and its value.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub key: String,
    pub value: MetricValue,
}

/// Readings accumulated during one collection cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricBatch {
    metrics: Vec<Metric>,
}

impl MetricBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: String, value: MetricValue) {
        self.metrics.push(Metric { key, value });
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Metric> {
        self.metrics.iter()
    }

    pub fn get(&self, key: &str) -> Option<MetricValue> {
        self.metrics.iter().find(|m| m.key == key).map(|m| m.value)
    }

    /// Render in `zabbix_sender -i` input format, one `- key value` line each.
    pub fn to_trap_text(&self) -> String {
        self.metrics
            .iter()
            .map(|m| format!("- {} {}\n", m.key, m.value))
            .collect()
    }
}

/// Statistics about sink operations.
#[derive(Debug, Clone, Default)]
pub struct SinkStats {
    /// Total number of metrics recorded
    pub metrics_recorded: u64,

    /// Number of successful sender invocations
    pub pushes_sent: u64,

    /// Number of failed sender invocations (spawn error or non-zero exit)
    pub pushes_failed: u64,
}

/// Result of flushing one cycle's batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushReport {
    /// No push target configured; the batch was dropped without any I/O
    Disabled { discarded: usize },

    /// The sender exited successfully
    Sent { metrics: usize },

    /// The push failed; details are in the log and the transcript file
    Failed { metrics: usize, error: String },
}

/// Errors that can occur while pushing a batch. Never escapes [`MetricSink::flush`].
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to write trap file {}: {source}", path.display())]
    Trap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to open transcript {}: {source}", path.display())]
    Transcript {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} {status}")]
    Exit { program: String, status: ExitStatus },
}

/// Per-cycle accumulator with a Zabbix push transport.
pub struct MetricSink {
    /// Prefix for every item key
    prefix: String,

    /// Push target; `None` disables the transport
    target: Option<ZabbixConfig>,

    /// Directory holding the trap and transcript files
    dir: PathBuf,

    /// Current cycle's readings
    batch: MetricBatch,

    /// Statistics about sink operations
    stats: SinkStats,
}

impl MetricSink {
    /// Create a sink writing its transport files under `dir`.
    pub fn new(
        prefix: impl Into<String>,
        target: Option<ZabbixConfig>,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            target,
            dir: dir.into(),
            batch: MetricBatch::new(),
            stats: SinkStats::default(),
        }
    }

    /// Whether flushing pushes anywhere.
    pub fn is_enabled(&self) -> bool {
        self.target.is_some()
    }

    /// Start a fresh batch for a new cycle.
    pub fn begin_cycle(&mut self) {
        if !self.batch.is_empty() {
            debug!(
                discarded = self.batch.len(),
                "Dropping readings left over from an unfinished cycle"
            );
        }
        self.batch = MetricBatch::new();
    }

    /// Append `{prefix}.{key} value` to the current batch.
    pub fn record(&mut self, key: impl fmt::Display, value: impl Into<MetricValue>) {
        let key = format!("{}.{}", self.prefix, key);
        let value = value.into();
        debug!(key = %key, value = %value, "Recorded metric");
        self.batch.push(key, value);
        self.stats.metrics_recorded += 1;
    }

    /// Readings recorded since the last flush.
    pub fn pending(&self) -> &MetricBatch {
        &self.batch
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    pub fn trap_path(&self) -> PathBuf {
        self.dir.join(TRAP_FILE)
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.dir.join(TRANSCRIPT_FILE)
    }

    /// Push the current batch and start an empty one.
    ///
    /// With a target configured the trap file and transcript are rewritten
    /// every cycle, even when nothing was recorded. Push failures are logged and reported, never returned as errors, so a
    /// broken collector cannot stall the collection loop.
    pub async fn flush(&mut self) -> FlushReport {
        let batch = std::mem::take(&mut self.batch);

        let Some(target) = &self.target else {
            return FlushReport::Disabled {
                discarded: batch.len(),
            };
        };

        let metrics = batch.len();
        match self.push(target, &batch).await {
            Ok(()) => {
                self.stats.pushes_sent += 1;
                info!(
                    metrics = metrics,
                    server = %target.server,
                    "Pushed metrics to Zabbix"
                );
                FlushReport::Sent { metrics }
            }
            Err(e) => {
                self.stats.pushes_failed += 1;
                warn!(
                    error = %e,
                    metrics = metrics,
                    transcript = %self.transcript_path().display(),
                    "Failed to push metrics"
                );
                FlushReport::Failed {
                    metrics,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Write the trap file and run the sender with output captured.
    async fn push(&self, target: &ZabbixConfig, batch: &MetricBatch) -> Result<(), SinkError> {
        let trap_path = self.trap_path();
        tokio::fs::write(&trap_path, batch.to_trap_text())
            .await
            .map_err(|source| SinkError::Trap {
                path: trap_path.clone(),
                source,
            })?;

        let transcript_path = self.transcript_path();
        let transcript_err = |source| SinkError::Transcript {
            path: transcript_path.clone(),
            source,
        };
        let stdout = tokio::fs::File::create(&transcript_path)
            .await
            .map_err(transcript_err)?
            .into_std()
            .await;
        let stderr = stdout.try_clone().map_err(transcript_err)?;

        let status = sender_command(target, &trap_path)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .await
            .map_err(|source| SinkError::Spawn {
                program: target.sender.clone(),
                source,
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(SinkError::Exit {
                program: target.sender.clone(),
                status,
            })
        }
    }
}

fn sender_command(target: &ZabbixConfig, trap_path: &Path) -> Command {
    let mut command = Command::new(&target.sender);
    command
        .arg("-z")
        .arg(&target.server)
        .arg("-p")
        .arg(target.port.to_string())
        .arg("-s")
        .arg(&target.host)
        .arg("-i")
        .arg(trap_path);
    command
}
