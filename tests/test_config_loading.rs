//! Configuration loading and validation
//!
//! Exercises the JSON config surface the provisioning pipeline produces:
//! required fields per connection type, defaults, and the validation that
//! keeps a half-configured device from starting.

use scale_agent::config::{ConfigError, ConnectionType, DeviceConfig, CA_FILE, CERT_FILE, KEY_FILE};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;


fn load(json: &str) -> Result<DeviceConfig, ConfigError> {
    let dir = TempDir::new().expect("tempdir");
    let path = test_helpers::write_config(dir.path(), json);
    DeviceConfig::load_from_file(&path)
}

#[test]
fn test_minimal_serial_config_applies_defaults() {
    let config = load(
        r#"{
            "device_id": "barn-7",
            "connection_type": "serial",
            "serial_port": "/dev/ttyUSB0",
            "baud_rate": 1200,
            "broker_endpoint": "a1b2c3-ats.iot.eu-west-1.amazonaws.com",
            "stage": "prod"
        }"#,
    )
    .expect("minimal serial config should load");

    assert_eq!(config.device_id, "barn-7");
    assert_eq!(config.connection_type, ConnectionType::Serial);
    assert_eq!(config.broker_port, 8883);
    assert_eq!(config.certs_dir, PathBuf::from("/etc/scale-agent/certs"));
    assert_eq!(
        config.store_dir,
        PathBuf::from("/var/lib/scale-agent/measurements")
    );
    assert_eq!(config.sampling_interval_secs, 1800);
    assert_eq!(config.sampling_interval(), Duration::from_secs(1800));
}

#[test]
fn test_radio_config_loads() {
    let config = load(
        r#"{
            "device_id": "pen-3",
            "connection_type": "radio",
            "radio_address": "AA:BB:CC:DD:EE:FF",
            "broker_endpoint": "mqtts://broker.example.com:8883",
            "stage": "dev",
            "sampling_interval_secs": 600
        }"#,
    )
    .expect("radio config should load");

    assert_eq!(config.connection_type, ConnectionType::Radio);
    assert_eq!(config.radio_address.as_deref(), Some("AA:BB:CC:DD:EE:FF"));
    assert_eq!(config.sampling_interval_secs, 600);
}

#[test]
fn test_unknown_extra_keys_are_tolerated() {
    let config = load(
        r#"{
            "device_id": "barn-7",
            "connection_type": "serial",
            "serial_port": "/dev/ttyUSB0",
            "baud_rate": 1200,
            "broker_endpoint": "broker.example.com",
            "stage": "prod",
            "provisioned_by": "fleet-tool-2.3",
            "site": {"barn": 7}
        }"#,
    );
    assert!(
        config.is_ok(),
        "newer provisioning keys must not break older agents"
    );
}

#[test]
fn test_serial_requires_port_and_baud_rate() {
    let missing_port = load(
        r#"{
            "device_id": "barn-7",
            "connection_type": "serial",
            "baud_rate": 1200,
            "broker_endpoint": "broker.example.com",
            "stage": "prod"
        }"#,
    );
    assert!(matches!(
        missing_port,
        Err(ConfigError::MissingField {
            field: "serial_port",
            ..
        })
    ));

    let missing_baud = load(
        r#"{
            "device_id": "barn-7",
            "connection_type": "serial",
            "serial_port": "/dev/ttyUSB0",
            "broker_endpoint": "broker.example.com",
            "stage": "prod"
        }"#,
    );
    assert!(matches!(
        missing_baud,
        Err(ConfigError::MissingField {
            field: "baud_rate",
            ..
        })
    ));
}

#[test]
fn test_radio_requires_address() {
    let result = load(
        r#"{
            "device_id": "pen-3",
            "connection_type": "radio",
            "broker_endpoint": "broker.example.com",
            "stage": "dev"
        }"#,
    );
    assert!(matches!(
        result,
        Err(ConfigError::MissingField {
            field: "radio_address",
            ..
        })
    ));
}

#[test]
fn test_unknown_connection_type_is_rejected() {
    let result = load(
        r#"{
            "device_id": "barn-7",
            "connection_type": "bluetooth",
            "broker_endpoint": "broker.example.com",
            "stage": "prod"
        }"#,
    );
    assert!(matches!(result, Err(ConfigError::JsonParse(_))));
}

#[test]
fn test_device_id_characters_are_validated() {
    // '/' would corrupt the command topic path.
    let result = load(
        r#"{
            "device_id": "barn/7",
            "connection_type": "serial",
            "serial_port": "/dev/ttyUSB0",
            "baud_rate": 1200,
            "broker_endpoint": "broker.example.com",
            "stage": "prod"
        }"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidDeviceId(_))));
}

#[test]
fn test_sampling_interval_bounds_are_enforced() {
    let too_fast = load(
        r#"{
            "device_id": "barn-7",
            "connection_type": "serial",
            "serial_port": "/dev/ttyUSB0",
            "baud_rate": 1200,
            "broker_endpoint": "broker.example.com",
            "stage": "prod",
            "sampling_interval_secs": 5
        }"#,
    );
    assert!(matches!(too_fast, Err(ConfigError::InvalidConfig(_))));

    let too_slow = load(
        r#"{
            "device_id": "barn-7",
            "connection_type": "serial",
            "serial_port": "/dev/ttyUSB0",
            "baud_rate": 1200,
            "broker_endpoint": "broker.example.com",
            "stage": "prod",
            "sampling_interval_secs": 90000
        }"#,
    );
    assert!(matches!(too_slow, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_empty_stage_is_rejected() {
    let result = load(
        r#"{
            "device_id": "barn-7",
            "connection_type": "serial",
            "serial_port": "/dev/ttyUSB0",
            "baud_rate": 1200,
            "broker_endpoint": "broker.example.com",
            "stage": ""
        }"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_missing_file_is_a_read_error() {
    let result = DeviceConfig::load_from_file(std::path::Path::new(
        "/nonexistent/scale-agent/config.json",
    ));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_client_id_is_stable_and_prefixed() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_helpers::serial_config(dir.path());
    assert_eq!(config.client_id(), "scale-test-scale");
}

#[test]
fn test_certificate_paths_use_fixed_names() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_helpers::serial_config(dir.path());
    let paths = config.certificate_paths();

    assert_eq!(paths.ca, config.certs_dir.join(CA_FILE));
    assert_eq!(paths.cert, config.certs_dir.join(CERT_FILE));
    assert_eq!(paths.key, config.certs_dir.join(KEY_FILE));
}

#[test]
fn test_verify_certificates_reports_the_missing_file() {
    let dir = TempDir::new().expect("tempdir");
    let config = test_helpers::serial_config(dir.path());

    // certs_dir does not exist at all.
    let result = config.verify_certificates();
    assert!(matches!(result, Err(ConfigError::MissingCertificate(_))));

    // With all three files present the check passes.
    std::fs::create_dir_all(&config.certs_dir).expect("create certs dir");
    for name in [CA_FILE, CERT_FILE, KEY_FILE] {
        std::fs::write(config.certs_dir.join(name), "dummy pem").expect("write cert");
    }
    assert!(config.verify_certificates().is_ok());
}
