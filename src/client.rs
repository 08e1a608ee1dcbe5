//! HTTP client module for the SwitchBot Open API (v1.1).
//!
//! This module provides the concrete [`DeviceApi`] used in production:
//! request signing, response envelope handling, and the mapping from
//! transport failures onto the collector's retry policy.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::Hub2Config;
use crate::device::{Device, DeviceApi, DeviceStatus, FetchError};
use crate::sink::MetricValue;

type HmacSha256 = Hmac<Sha256>;

/// Upper bound on establishing a connection, capped by the request timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// `statusCode` the API uses for success.
const STATUS_SUCCESS: i64 = 100;

/// Errors that can occur during SwitchBot API calls.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Connection could not be established or was lost mid-request
    #[error("Connection failed: {0}")]
    Connect(#[source] reqwest::Error),

    /// Server returned an error status code
    #[error("Server error ({code}): {message}")]
    Status { code: StatusCode, message: String },

    /// API envelope carried a non-success `statusCode`
    #[error("SwitchBot API returned status {code}: {message}")]
    Api { code: i64, message: String },

    /// Failed to parse response body
    #[error("Failed to parse response: {0}")]
    Parse(String),

    /// Request timeout
    #[error("Request timed out")]
    Timeout,

    /// Client configuration error
    #[error("Client configuration error: {0}")]
    Config(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        // A connect timeout is also a timeout; classify the connection first.
        if err.is_connect() || caused_by_connection_loss(&err) {
            ClientError::Connect(err)
        } else if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::Request(err)
        }
    }
}

impl ClientError {
    /// Whether the connection failed rather than the request or the API.
    pub fn is_connect(&self) -> bool {
        matches!(self, ClientError::Connect(_))
    }
}

/// Walk the source chain for an I/O error that means the socket is gone.
fn caused_by_connection_loss(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<io::Error>() {
            if matches!(
                io.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
            ) {
                return true;
            }
        }
        source = cause.source();
    }
    false
}

impl From<ClientError> for FetchError {
    fn from(err: ClientError) -> Self {
        if err.is_connect() {
            FetchError::Connectivity(err.to_string())
        } else {
            FetchError::Recoverable(err.to_string())
        }
    }
}

/// Common response wrapper: `{"statusCode": 100, "message": "...", "body": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<T> {
    status_code: i64,

    #[serde(default)]
    message: String,

    body: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceListBody {
    #[serde(default)]
    device_list: Vec<DeviceRecord>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRecord {
    device_id: String,

    #[serde(default)]
    device_name: String,

    #[serde(default)]
    device_type: String,
}

impl From<DeviceRecord> for Device {
    fn from(record: DeviceRecord) -> Self {
        Device::new(record.device_id, record.device_name, record.device_type)
    }
}

/// Signed client for the SwitchBot Open API.
///
/// The underlying `reqwest::Client` is built once and reused for every
/// request, so connections are pooled across cycles.
pub struct SwitchBotClient {
    client: Client,
    base_url: String,
    token: SecretString,
    secret: SecretString,
    timeout: Duration,
}

impl SwitchBotClient {
    /// Create a client from the `[hub2]` settings.
    ///
    /// # Errors
    ///
    /// Returns `ClientError::Config` if the HTTP client cannot be built.
    pub fn new(config: &Hub2Config) -> Result<Self, ClientError> {
        Self::with_settings(
            config.api_url.clone(),
            SecretString::from(config.token.expose_secret().to_string()),
            SecretString::from(config.secret.expose_secret().to_string()),
            config.request_timeout,
        )
    }

    /// Create a client with explicit settings.
    pub fn with_settings(
        base_url: impl Into<String>,
        token: SecretString,
        secret: SecretString,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            secret,
            timeout,
        })
    }

    /// Get the API base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the request timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// `GET /v1.1/devices`
    pub async fn devices(&self) -> Result<Vec<Device>, ClientError> {
        let body: DeviceListBody = self.get("/v1.1/devices").await?;
        Ok(body.device_list.into_iter().map(Device::from).collect())
    }

    /// `GET /v1.1/devices/{id}/status`
    pub async fn device_status(&self, device_id: &str) -> Result<DeviceStatus, ClientError> {
        let path = format!("/v1.1/devices/{device_id}/status");
        let body: serde_json::Map<String, serde_json::Value> = self.get(&path).await?;
        let status = status_from_body(&body);
        if status.is_empty() {
            return Err(ClientError::Parse(
                "status body has no numeric fields".to_string(),
            ));
        }
        debug!(device_id = %device_id, fields = status.len(), "Fetched device status");
        Ok(status)
    }

    /// Send a signed GET and unwrap the response envelope.
    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let t = Utc::now().timestamp_millis().to_string();
        let nonce = Uuid::new_v4().to_string();
        let sign = self.sign(&t, &nonce)?;

        debug!(url = %url, "Sending SwitchBot API request");

        let response = self
            .client
            .get(&url)
            .header(AUTHORIZATION, self.token.expose_secret())
            .header(CONTENT_TYPE, "application/json; charset=utf8")
            .header("t", t)
            .header("sign", sign)
            .header("nonce", nonce)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::Status {
                code: status,
                message,
            });
        }

        let text = response.text().await?;
        let envelope: Envelope<T> =
            serde_json::from_str(&text).map_err(|e| ClientError::Parse(e.to_string()))?;

        if envelope.status_code != STATUS_SUCCESS {
            return Err(ClientError::Api {
                code: envelope.status_code,
                message: envelope.message,
            });
        }

        envelope
            .body
            .ok_or_else(|| ClientError::Parse("response has no body".to_string()))
    }

    /// `base64(HMAC-SHA256(secret, token + t + nonce))`
    fn sign(&self, t: &str, nonce: &str) -> Result<String, ClientError> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| ClientError::Config(e.to_string()))?;
        mac.update(self.token.expose_secret().as_bytes());
        mac.update(t.as_bytes());
        mac.update(nonce.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl DeviceApi for SwitchBotClient {
    async fn list_devices(&self) -> Result<Vec<Device>, FetchError> {
        Ok(self.devices().await?)
    }

    async fn fetch_status(&self, device: &Device) -> Result<DeviceStatus, FetchError> {
        Ok(self.device_status(&device.id).await?)
    }
}

/// Keep the numeric fields of a status body, with snake_case names.
fn status_from_body(body: &serde_json::Map<String, serde_json::Value>) -> DeviceStatus {
    let mut status = DeviceStatus::new();
    for (key, value) in body {
        if let Some(value) = value.as_number().and_then(MetricValue::from_json) {
            status.insert(to_snake_case(key), value);
        }
    }
    status
}

/// `lightLevel` -> `light_level`
fn to_snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(c);
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_client() -> SwitchBotClient {
        SwitchBotClient::with_settings(
            "http://localhost:9000/",
            SecretString::from("tok-4f9a".to_string()),
            SecretString::from("sec-77c1".to_string()),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_client_with_settings() {
        let client = test_client();
        assert_eq!(client.base_url(), "http://localhost:9000");
        assert_eq!(client.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_sign_matches_reference_vector() {
        let client = test_client();
        let sign = client
            .sign("1700000000000", "5f0c6b0e-8f0e-4d7a-9d2c-2a4c3b1e0f11")
            .unwrap();
        assert_eq!(sign, "V6MtF3mtGDKy/epcBBDsPzLqvDAl7xNd9kTbM64VLDw=");
    }

    #[test]
    fn test_to_snake_case() {
        assert_eq!(to_snake_case("lightLevel"), "light_level");
        assert_eq!(to_snake_case("humidity"), "humidity");
        assert_eq!(to_snake_case("deviceId"), "device_id");
        assert_eq!(to_snake_case("CO2"), "co2");
        assert_eq!(to_snake_case("battery2Level"), "battery2_level");
    }

    #[test]
    fn test_status_from_body_keeps_numbers() {
        let body = json!({
            "deviceId": "AA01",
            "deviceType": "Hub 2",
            "hubDeviceId": "AA01",
            "humidity": 55,
            "temperature": 23.4,
            "lightLevel": 10,
            "version": "V1.2",
            "online": true
        });
        let status = status_from_body(body.as_object().unwrap());

        assert_eq!(status.len(), 3);
        assert_eq!(status.get("humidity"), Some(MetricValue::Integer(55)));
        assert_eq!(status.get("temperature"), Some(MetricValue::Float(23.4)));
        assert_eq!(status.get("light_level"), Some(MetricValue::Integer(10)));
    }

    #[test]
    fn test_envelope_deserialization() {
        let json = r#"{
            "statusCode": 100,
            "message": "success",
            "body": {
                "deviceList": [
                    {"deviceId": "AA01", "deviceName": "Living", "deviceType": "Hub 2", "hubDeviceId": "000000000000"}
                ],
                "infraredRemoteList": []
            }
        }"#;

        let envelope: Envelope<DeviceListBody> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.status_code, 100);
        let devices: Vec<Device> = envelope
            .body
            .unwrap()
            .device_list
            .into_iter()
            .map(Device::from)
            .collect();
        assert_eq!(devices, vec![Device::new("AA01", "Living", "Hub 2")]);
    }

    #[test]
    fn test_envelope_error_without_body() {
        let json = r#"{"statusCode": 190, "message": "Device internal error due to device states not synchronized with server"}"#;
        let envelope: Envelope<DeviceListBody> = serde_json::from_str(json).unwrap();
        assert_eq!(envelope.status_code, 190);
        assert!(envelope.body.is_none());
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::Timeout;
        assert_eq!(format!("{}", err), "Request timed out");

        let err = ClientError::Status {
            code: StatusCode::INTERNAL_SERVER_ERROR,
            message: "boom".to_string(),
        };
        assert!(format!("{}", err).contains("500"));

        let err = ClientError::Api {
            code: 190,
            message: "device internal error".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "SwitchBot API returned status 190: device internal error"
        );
    }

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "connection error")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_connection_loss_found_in_source_chain() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionRefused,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
        ] {
            let err = Wrapped(io::Error::new(kind, "socket gone"));
            assert!(caused_by_connection_loss(&err), "{kind:?}");
        }

        let direct = io::Error::from(io::ErrorKind::ConnectionReset);
        assert!(caused_by_connection_loss(&direct));
    }

    #[test]
    fn test_other_io_errors_are_not_connection_loss() {
        let err = Wrapped(io::Error::new(io::ErrorKind::TimedOut, "slow read"));
        assert!(!caused_by_connection_loss(&err));
        assert!(!caused_by_connection_loss(&io::Error::other("bad data")));
    }

    #[test]
    fn test_client_errors_map_to_recoverable() {
        let errors = [
            ClientError::Timeout,
            ClientError::Parse("eof".to_string()),
            ClientError::Api {
                code: 190,
                message: "busy".to_string(),
            },
            ClientError::Status {
                code: StatusCode::TOO_MANY_REQUESTS,
                message: "slow down".to_string(),
            },
        ];
        for err in errors {
            assert!(FetchError::from(err).is_retryable());
        }
    }
}
