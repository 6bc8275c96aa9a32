//! File-based configuration for the MQTT facade
//!
//! A TOML file with a single `[mqtt]` section describes the broker, the
//! startup topics and the connection options. Credentials are never stored in
//! the file; it names the environment variables that hold them.

use crate::transport::mqtt::{BrokerEndpoint, ClientConfig, MIN_KEEP_ALIVE};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Top-level configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FacadeConfig {
    pub mqtt: MqttSection,
}

/// `[mqtt]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Broker URI, e.g. `tcp://127.0.0.1:1883`
    pub broker_url: String,
    /// Topics subscribed on start, in order
    #[serde(default)]
    pub topics: Vec<String>,
    /// Fixed client id; a random one is generated when absent
    #[serde(default)]
    pub client_id: Option<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    #[serde(default)]
    pub auto_reconnect: bool,
}

fn default_keep_alive_secs() -> u64 {
    5
}

fn default_ping_timeout_ms() -> u64 {
    1000
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_subscribe_timeout_ms() -> u64 {
    10_000
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid client id format: {0}")]
    InvalidClientId(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl FacadeConfig {
    /// Configuration with every option at its default
    pub fn with_broker(broker_url: impl Into<String>) -> Self {
        Self {
            mqtt: MqttSection {
                broker_url: broker_url.into(),
                topics: Vec::new(),
                client_id: None,
                username_env: None,
                password_env: None,
                keep_alive_secs: default_keep_alive_secs(),
                ping_timeout_ms: default_ping_timeout_ms(),
                connect_timeout_ms: default_connect_timeout_ms(),
                subscribe_timeout_ms: default_subscribe_timeout_ms(),
                auto_reconnect: false,
            },
        }
    }

    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FacadeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mqtt.validate()
    }
}

impl MqttSection {
    pub fn validate(&self) -> Result<(), ConfigError> {
        BrokerEndpoint::parse(&self.broker_url)
            .map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        if let Some(client_id) = &self.client_id {
            validate_client_id(client_id)?;
        }

        if let Some(topic) = self.topics.iter().find(|t| t.is_empty()) {
            return Err(ConfigError::InvalidConfig(format!(
                "topic names must not be empty: {topic:?}"
            )));
        }

        if self.keep_alive_secs < MIN_KEEP_ALIVE.as_secs() {
            return Err(ConfigError::InvalidConfig(format!(
                "keep_alive_secs must be at least {}, got {}",
                MIN_KEEP_ALIVE.as_secs(),
                self.keep_alive_secs
            )));
        }

        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "connect_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.subscribe_timeout_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "subscribe_timeout_ms must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Copy the file options onto a client configuration
    pub fn apply_to(&self, config: &mut ClientConfig) {
        config.broker = self.broker_url.clone();
        if let Some(client_id) = &self.client_id {
            config.set_client_id(client_id.clone());
        }
        config.keep_alive = Duration::from_secs(self.keep_alive_secs);
        config.ping_timeout = Duration::from_millis(self.ping_timeout_ms);
        config.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        config.subscribe_timeout = Duration::from_millis(self.subscribe_timeout_ms);
        config.auto_reconnect = self.auto_reconnect;

        if let Some(username) = self.get_username() {
            let password = self.get_password().unwrap_or_default();
            config.set_credentials(username, password);
        }
    }

    /// Helper method to get environment variable with consistent error handling
    fn get_env_var_optional(env_var_name: Option<&String>) -> Option<String> {
        env_var_name.and_then(|name| std::env::var(name).ok())
    }

    /// Get MQTT username from environment variable
    pub fn get_username(&self) -> Option<String> {
        Self::get_env_var_optional(self.username_env.as_ref())
    }

    /// Get MQTT password from environment variable
    pub fn get_password(&self) -> Option<String> {
        Self::get_env_var_optional(self.password_env.as_ref())
    }
}

/// Client ids must match `[a-zA-Z0-9._-]+`
fn validate_client_id(client_id: &str) -> Result<(), ConfigError> {
    let valid_chars = client_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');

    if client_id.is_empty() || !valid_chars {
        return Err(ConfigError::InvalidClientId(format!(
            "Client id '{client_id}' must match pattern [a-zA-Z0-9._-]+"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::{ClientContext, MessageHandler};
    use std::sync::Arc;

    fn client_config() -> ClientConfig {
        let handler: Arc<dyn MessageHandler> = Arc::new(|_: &ClientContext, _: &str, _: &[u8]| {});
        ClientConfig::new("tcp://unused:1883", handler)
    }

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[mqtt]
broker_url = "tcp://127.0.0.1:1883"
topics = ["a", "b", "c"]
client_id = "sensor-01"
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
keep_alive_secs = 10
ping_timeout_ms = 2000
connect_timeout_ms = 1000
subscribe_timeout_ms = 3000
auto_reconnect = true
"#;

        let config = FacadeConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.mqtt.broker_url, "tcp://127.0.0.1:1883");
        assert_eq!(config.mqtt.topics, vec!["a", "b", "c"]);
        assert_eq!(config.mqtt.client_id.as_deref(), Some("sensor-01"));
        assert_eq!(config.mqtt.keep_alive_secs, 10);
        assert!(config.mqtt.auto_reconnect);
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = FacadeConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "tcp://127.0.0.1:1883"
"#,
        )
        .unwrap();

        assert_eq!(config, FacadeConfig::with_broker("tcp://127.0.0.1:1883"));
        assert!(config.mqtt.topics.is_empty());
        assert_eq!(config.mqtt.keep_alive_secs, 5);
        assert_eq!(config.mqtt.ping_timeout_ms, 1000);
        assert!(!config.mqtt.auto_reconnect);
    }

    #[test]
    fn test_invalid_client_id() {
        assert!(validate_client_id("bad id!").is_err());
        assert!(validate_client_id("").is_err());
        assert!(validate_client_id("valid-client_123.test").is_ok());
    }

    #[test]
    fn test_invalid_broker_url_rejected() {
        let mut config = FacadeConfig::with_broker("http://broker.local");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConfig(_))
        ));
        config.mqtt.broker_url = "mqtts://broker.local".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_topic_rejected() {
        let mut config = FacadeConfig::with_broker("tcp://127.0.0.1:1883");
        config.mqtt.topics = vec!["a".to_string(), String::new()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_short_keep_alive_rejected() {
        for keep_alive_secs in [0, 2, 4] {
            let mut config = FacadeConfig::with_broker("tcp://127.0.0.1:1883");
            config.mqtt.keep_alive_secs = keep_alive_secs;
            assert!(
                matches!(config.validate(), Err(ConfigError::InvalidConfig(_))),
                "keep_alive_secs = {keep_alive_secs} should be rejected"
            );
        }

        let parsed = FacadeConfig::from_toml_str(
            r#"
[mqtt]
broker_url = "tcp://127.0.0.1:1883"
keep_alive_secs = 2
"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let mut config = FacadeConfig::with_broker("tcp://127.0.0.1:1883");
        config.mqtt.connect_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = FacadeConfig::with_broker("tcp://127.0.0.1:1883");
        config.mqtt.subscribe_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_to_client_config() {
        let mut section = FacadeConfig::with_broker("tcp://10.0.0.5:1884").mqtt;
        section.client_id = Some("id1".to_string());
        section.connect_timeout_ms = 1500;
        section.auto_reconnect = true;

        let mut config = client_config();
        section.apply_to(&mut config);

        assert_eq!(config.broker, "tcp://10.0.0.5:1884");
        assert_eq!(config.client_id.as_str(), "id1");
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert!(config.auto_reconnect);
        assert!(config.credentials.is_none());
    }

    #[test]
    fn test_apply_to_reads_credentials_from_env() {
        unsafe {
            std::env::set_var("MQTT_FACADE_UNIT_USER", "alice");
            std::env::set_var("MQTT_FACADE_UNIT_PASS", "s3cret");
        }
        let mut section = FacadeConfig::with_broker("tcp://127.0.0.1:1883").mqtt;
        section.username_env = Some("MQTT_FACADE_UNIT_USER".to_string());
        section.password_env = Some("MQTT_FACADE_UNIT_PASS".to_string());

        let mut config = client_config();
        section.apply_to(&mut config);

        let credentials = config.credentials.expect("credentials should be set");
        assert_eq!(credentials.username, "alice");
        assert_eq!(credentials.password, "s3cret");
    }

    #[test]
    fn test_missing_username_env_means_no_credentials() {
        let mut section = FacadeConfig::with_broker("tcp://127.0.0.1:1883").mqtt;
        section.username_env = Some("MQTT_FACADE_UNIT_USER_UNSET".to_string());
        assert!(section.get_username().is_none());

        let mut config = client_config();
        section.apply_to(&mut config);
        assert!(config.credentials.is_none());
    }
}
