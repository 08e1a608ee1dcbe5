//! Device capability and startup registry.
//!
//! [`DeviceApi`] is the seam between the collection loop and the vendor
//! cloud: it can enumerate devices and fetch one status snapshot at a time.
//! [`DeviceRegistry`] resolves the configured identifiers against the live
//! device list once at startup and is never refreshed afterwards.

use async_trait::async_trait;
use indexmap::IndexMap;
use thiserror::Error;

use crate::sink::MetricValue;

/// A sensor device known to the vendor API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Stable vendor-assigned identifier
    pub id: String,

    /// User-facing name
    pub name: String,

    /// Vendor device type (e.g. "Hub 2")
    pub device_type: String,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        device_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type: device_type.into(),
        }
    }
}

/// Numeric readings from one status fetch, keyed by snake_case metric name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceStatus {
    metrics: IndexMap<String, MetricValue>,
}

impl DeviceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<MetricValue>) {
        self.metrics.insert(name.into(), value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<MetricValue> {
        self.metrics.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Failure of a single device API call.
///
/// The collector retries `Recoverable` failures within the cycle's budget
/// and abandons the device for the cycle on `Connectivity`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Device or vendor-side error; worth another attempt
    #[error("{0}")]
    Recoverable(String),

    /// Network connection could not be established
    #[error("connection failed: {0}")]
    Connectivity(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Recoverable(_))
    }
}

/// Access to the vendor's device cloud.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Enumerate every device on the account.
    async fn list_devices(&self) -> Result<Vec<Device>, FetchError>;

    /// Fetch one status snapshot for `device`.
    async fn fetch_status(&self, device: &Device) -> Result<DeviceStatus, FetchError>;
}

/// Errors raised while resolving configured devices.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device {ids:?} not found")]
    Unresolved { ids: Vec<String> },

    #[error("failed to list devices: {0}")]
    Listing(#[source] FetchError),
}

/// Configured devices resolved against the live device list.
///
/// Iteration follows the configured order.
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: IndexMap<String, Device>,
}

impl DeviceRegistry {
    /// List the account's devices and resolve `ids` against them.
    ///
    /// # Errors
    ///
    /// `RegistryError::Listing` if the device list cannot be fetched,
    /// `RegistryError::Unresolved` naming every identifier without a match.
    pub async fn resolve<A>(api: &A, ids: &[String]) -> Result<Self, RegistryError>
    where
        A: DeviceApi + ?Sized,
    {
        let live = api.list_devices().await.map_err(RegistryError::Listing)?;
        Self::from_live(live, ids)
    }

    /// Resolve `ids` against an already fetched device list (exact match).
    pub fn from_live(live: Vec<Device>, ids: &[String]) -> Result<Self, RegistryError> {
        let mut by_id: IndexMap<String, Device> =
            live.into_iter().map(|d| (d.id.clone(), d)).collect();

        let mut devices = IndexMap::with_capacity(ids.len());
        let mut unresolved = Vec::new();
        for id in ids {
            match by_id.shift_remove(id) {
                Some(device) => {
                    devices.insert(id.clone(), device);
                }
                None if devices.contains_key(id) => {}
                None => unresolved.push(id.clone()),
            }
        }

        if !unresolved.is_empty() {
            return Err(RegistryError::Unresolved { ids: unresolved });
        }
        Ok(Self { devices })
    }

    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.devices.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
