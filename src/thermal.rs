//! Host temperature sampling from the Linux thermal sysfs interface.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// SoC temperature on a Raspberry Pi, in millidegrees Celsius.
pub const DEFAULT_THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";

/// Item key the host temperature is recorded under.
pub const HOST_TEMPERATURE_KEY: &str = "cpu_temperature";

#[derive(Debug, Error)]
pub enum ThermalError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: '{raw}' is not an integer millidegree value", path.display())]
    Parse { path: PathBuf, raw: String },
}

/// Reads a thermal zone file.
#[derive(Debug, Clone)]
pub struct HostThermal {
    path: PathBuf,
}

impl Default for HostThermal {
    fn default() -> Self {
        Self::new(DEFAULT_THERMAL_ZONE)
    }
}

impl HostThermal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current temperature in degrees Celsius.
    pub async fn read_celsius(&self) -> Result<f64, ThermalError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ThermalError::Read {
                path: self.path.clone(),
                source,
            })?;
        parse_millidegrees(&text).ok_or_else(|| ThermalError::Parse {
            path: self.path.clone(),
            raw: text.lines().next().unwrap_or_default().to_string(),
        })
    }
}

/// Parse the first line as integer millidegrees and convert to degrees.
fn parse_millidegrees(text: &str) -> Option<f64> {
    let millis: i64 = text.lines().next()?.trim().parse().ok()?;
    Some(millis as f64 / 1000.0)
}
