// Integration tests for `SwitchBotClient` using wiremock.

use std::time::Duration;

use secrecy::SecretString;
use serde_json::json;
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hub2_collector::{
    Device, DeviceApi, DeviceRegistry, FetchError, MetricValue, RegistryError, SwitchBotClient,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn client_for(base_url: &str) -> SwitchBotClient {
    SwitchBotClient::with_settings(
        base_url,
        SecretString::from("test-token".to_string()),
        SecretString::from("test-secret".to_string()),
        Duration::from_secs(5),
    )
    .unwrap()
}

async fn setup() -> (MockServer, SwitchBotClient) {
    let server = MockServer::start().await;
    let client = client_for(&server.uri());
    (server, client)
}

fn device_list_body() -> serde_json::Value {
    json!({
        "statusCode": 100,
        "message": "success",
        "body": {
            "deviceList": [
                {
                    "deviceId": "C271111EC0AB",
                    "deviceName": "Living Hub 2",
                    "deviceType": "Hub 2",
                    "enableCloudService": true,
                    "hubDeviceId": "000000000000"
                },
                {
                    "deviceId": "D7A1B2C3D4E5",
                    "deviceName": "Bedroom Hub 2",
                    "deviceType": "Hub 2",
                    "enableCloudService": true,
                    "hubDeviceId": "000000000000"
                }
            ],
            "infraredRemoteList": []
        }
    })
}

// ── Happy-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn test_list_devices_sends_signed_request() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/devices"))
        .and(header("authorization", "test-token"))
        .and(header_exists("sign"))
        .and(header_exists("nonce"))
        .and(header_exists("t"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_list_body()))
        .expect(1)
        .mount(&server)
        .await;

    let devices = client.list_devices().await.unwrap();

    assert_eq!(
        devices,
        vec![
            Device::new("C271111EC0AB", "Living Hub 2", "Hub 2"),
            Device::new("D7A1B2C3D4E5", "Bedroom Hub 2", "Hub 2"),
        ]
    );
}

#[tokio::test]
async fn test_fetch_status() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/devices/C271111EC0AB/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statusCode": 100,
            "message": "success",
            "body": {
                "deviceId": "C271111EC0AB",
                "deviceType": "Hub 2",
                "hubDeviceId": "C271111EC0AB",
                "humidity": 55,
                "temperature": 23.4,
                "lightLevel": 10,
                "version": "V2.1-1.6"
            }
        })))
        .mount(&server)
        .await;

    let device = Device::new("C271111EC0AB", "Living Hub 2", "Hub 2");
    let status = client.fetch_status(&device).await.unwrap();

    assert_eq!(status.get("humidity"), Some(MetricValue::Integer(55)));
    assert_eq!(status.get("temperature"), Some(MetricValue::Float(23.4)));
    assert_eq!(status.get("light_level"), Some(MetricValue::Integer(10)));
    assert!(status.get("version").is_none());
}

#[tokio::test]
async fn test_registry_resolves_through_client() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(device_list_body()))
        .mount(&server)
        .await;

    let registry = DeviceRegistry::resolve(&client, &["D7A1B2C3D4E5".to_string()])
        .await
        .unwrap();
    assert_eq!(registry.ids().collect::<Vec<_>>(), vec!["D7A1B2C3D4E5"]);

    let err = DeviceRegistry::resolve(
        &client,
        &["C271111EC0AB".to_string(), "C271111EC0AC".to_string()],
    )
    .await
    .unwrap_err();
    match err {
        RegistryError::Unresolved { ids } => assert_eq!(ids, vec!["C271111EC0AC"]),
        other => panic!("unexpected error: {other:?}"),
    }
}

// ── Error-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn test_vendor_status_code_is_recoverable() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/devices/C271111EC0AB/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statusCode": 190,
            "message": "Device internal error due to device states not synchronized with server",
            "body": {}
        })))
        .mount(&server)
        .await;

    let device = Device::new("C271111EC0AB", "Living Hub 2", "Hub 2");
    let err = client.fetch_status(&device).await.unwrap_err();

    match err {
        FetchError::Recoverable(message) => assert!(message.contains("190")),
        other => panic!("expected recoverable error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_http_error_is_recoverable() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/devices/C271111EC0AB/status"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
        .mount(&server)
        .await;

    let device = Device::new("C271111EC0AB", "Living Hub 2", "Hub 2");
    let err = client.fetch_status(&device).await.unwrap_err();

    assert!(err.is_retryable());
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn test_malformed_body_is_recoverable() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/devices"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&server)
        .await;

    let err = client.list_devices().await.unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_refused_connection_is_connectivity() {
    // Reserve a port, then free it so nothing is listening there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let client = client_for(&format!("http://127.0.0.1:{port}"));
    let device = Device::new("C271111EC0AB", "Living Hub 2", "Hub 2");

    let err = client.fetch_status(&device).await.unwrap_err();
    assert!(
        matches!(err, FetchError::Connectivity(_)),
        "expected connectivity error, got {err:?}"
    );
}

#[tokio::test]
async fn test_status_without_readings_is_recoverable() {
    let (server, client) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1.1/devices/C271111EC0AB/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statusCode": 100,
            "message": "success",
            "body": {
                "deviceId": "C271111EC0AB",
                "deviceType": "Hub 2",
                "version": "V2.1-1.6"
            }
        })))
        .mount(&server)
        .await;

    let device = Device::new("C271111EC0AB", "Living Hub 2", "Hub 2");
    let err = client.fetch_status(&device).await.unwrap_err();

    match err {
        FetchError::Recoverable(message) => assert!(message.contains("no numeric fields")),
        other => panic!("expected recoverable error, got {other:?}"),
    }
}
