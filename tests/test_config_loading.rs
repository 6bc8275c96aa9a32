//! Configuration loading and validation tests

use mqtt_facade::config::{ConfigError, FacadeConfig};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio_test::{assert_err, assert_ok};

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
broker_url = "tcp://127.0.0.1:1883"
topics = ["a", "b", "c"]
client_id = "id1"
"#
    )
    .unwrap();

    let config = assert_ok!(FacadeConfig::load_from_file(temp_file.path()));

    assert_eq!(config.mqtt.broker_url, "tcp://127.0.0.1:1883");
    assert_eq!(config.mqtt.topics, vec!["a", "b", "c"]);
    assert_eq!(config.mqtt.client_id.as_deref(), Some("id1"));
    assert_eq!(config.mqtt.keep_alive_secs, 5);
    assert_eq!(config.mqtt.connect_timeout_ms, 30_000);
}

#[test]
fn test_config_fails_with_missing_file() {
    let result = FacadeConfig::load_from_file(Path::new("/nonexistent/mqtt-facade.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_config_fails_with_invalid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[mqtt\nbroker_url = ").unwrap();

    let result = FacadeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_fails_without_broker_url() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[mqtt]\ntopics = [\"a\"]").unwrap();

    let result = FacadeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_bad_client_id() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
broker_url = "tcp://127.0.0.1:1883"
client_id = "has spaces"
"#
    )
    .unwrap();

    let err = assert_err!(FacadeConfig::load_from_file(temp_file.path()));
    assert!(matches!(err, ConfigError::InvalidClientId(_)));
}

#[test]
fn test_config_rejects_unsupported_scheme() {
    let result = FacadeConfig::from_toml_str(
        r#"
[mqtt]
broker_url = "ws://127.0.0.1:1883"
"#,
    );
    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_serializes_back_to_toml() {
    let config = FacadeConfig::with_broker("ssl://broker.example.com:8883");
    let text = assert_ok!(toml::to_string_pretty(&config));
    let reparsed = assert_ok!(FacadeConfig::from_toml_str(&text));
    assert_eq!(reparsed, config);
}
