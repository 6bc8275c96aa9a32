//! Pure connection configuration for the MQTT client
//!
//! This module contains the client configuration, identity generation,
//! broker URI parsing and translation into `rumqttc` options.

use super::message_handler::{
    log_connection_lost, log_on_connect, ClientContext, MessageHandler,
};
use rand::rngs::OsRng;
use rand::RngCore;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Default keep-alive interval
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(5);
/// Shortest keep-alive `rumqttc` accepts
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);
/// Default time to wait for PINGRESP after a PINGREQ
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);
/// Default time to wait for CONNACK
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default time to wait for SUBACK on an explicit subscription
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Grace period granted to in-flight work when disconnecting
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

const DEFAULT_PLAIN_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Invoked once per accepted CONNACK
pub type OnConnectHandler = Arc<dyn Fn(&ClientContext) + Send + Sync>;
/// Invoked when an established connection drops
pub type ConnectionLostHandler = Arc<dyn Fn(&ClientContext, &MqttError) + Send + Sync>;

/// Connection state reported by the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Waiting for CONNACK
    Connecting,
    /// CONNACK received, ready for operations
    Connected,
    /// Disconnected with reason
    Disconnected(String),
}

/// Facade lifecycle: `Unstarted -> Connected -> Destroyed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Unstarted,
    Connected,
    Destroyed,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lifecycle::Unstarted => "unstarted",
            Lifecycle::Connected => "connected",
            Lifecycle::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// MQTT facade errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectFailed(String),
    #[error("Connection timed out after {0:?} waiting for CONNACK")]
    ConnectTimeout(Duration),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid client option: {0}")]
    InvalidOption(String),
    #[error("Subscribing to {topic} failed: {reason}")]
    SubscribeFailed { topic: String, reason: String },
    #[error("Broker rejected subscription to {topic}: {codes:?}")]
    SubscribeRejected { topic: String, codes: Vec<String> },
    #[error("No SUBACK for {topic} within {timeout:?}")]
    SubscribeTimeout { topic: String, timeout: Duration },
    #[error("Publishing failed: {0}")]
    PublishFailed(String),
    #[error("No Tokio runtime to run the publish task")]
    NoRuntime,
    #[error("Not connected - client is {lifecycle}")]
    NotConnected { lifecycle: Lifecycle },
    #[error("Client already started")]
    AlreadyStarted,
    #[error("Client has been destroyed")]
    Destroyed,
}

/// MQTT client identifier: 8 lowercase hex characters by default
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity(String);

impl ClientIdentity {
    /// Generate a fresh identity from 4 bytes of OS entropy.
    ///
    /// If the OS source fails the bytes are derived from the clock and the
    /// process id instead. The identity is never empty.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 4];
        match OsRng.try_fill_bytes(&mut bytes) {
            Ok(()) => Self::from_bytes(bytes),
            Err(e) => {
                warn!(
                    error = %e,
                    "OS entropy source failed, deriving client id from clock and pid"
                );
                Self::from_bytes(fallback_bytes())
            }
        }
    }

    /// Hex-encode 4 bytes into an identity
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    /// Use an explicit identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn fallback_bytes() -> [u8; 4] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mixed = (nanos as u64) ^ ((nanos >> 64) as u64) ^ (u64::from(std::process::id()) << 17);
    ((mixed ^ (mixed >> 32)) as u32).to_be_bytes()
}

/// Username/password pair sent in CONNECT
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Client options, mutable until `start`
#[derive(Clone)]
pub struct ClientConfig {
    /// Broker URI, e.g. `tcp://127.0.0.1:1883`
    pub broker: String,
    pub client_id: ClientIdentity,
    pub keep_alive: Duration,
    pub ping_timeout: Duration,
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    /// Keep driving the event loop after a connection loss
    pub auto_reconnect: bool,
    pub credentials: Option<Credentials>,
    /// Default handler for every incoming publish
    pub message_handler: Arc<dyn MessageHandler>,
    pub on_connect: OnConnectHandler,
    pub on_connection_lost: ConnectionLostHandler,
}

impl ClientConfig {
    /// Defaults: keep-alive 5s, ping timeout 1s, no auto-reconnect, fresh identity
    pub fn new(broker: impl Into<String>, message_handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            broker: broker.into(),
            client_id: ClientIdentity::generate(),
            keep_alive: DEFAULT_KEEP_ALIVE,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            auto_reconnect: false,
            credentials: None,
            message_handler,
            on_connect: Arc::new(log_on_connect),
            on_connection_lost: Arc::new(log_connection_lost),
        }
    }

    pub fn set_client_id(&mut self, id: impl Into<String>) -> &mut Self {
        self.client_id = ClientIdentity::new(id);
        self
    }

    pub fn set_credentials(
        &mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> &mut Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("broker", &self.broker)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("ping_timeout", &self.ping_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("subscribe_timeout", &self.subscribe_timeout)
            .field("auto_reconnect", &self.auto_reconnect)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

/// Host, port and transport security parsed from a broker URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerEndpoint {
    /// Parse `tcp://`, `mqtt://` (plain) or `ssl://`, `tls://`, `mqtts://` (TLS)
    pub fn parse(broker: &str) -> Result<Self, MqttError> {
        let invalid = || MqttError::InvalidBrokerUrl(broker.to_string());
        let url = Url::parse(broker).map_err(|_| invalid())?;

        let tls = match url.scheme() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            _ => return Err(invalid()),
        };

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
            .filter(|h| !h.is_empty())
            .ok_or_else(invalid)?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PLAIN_PORT });

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

/// Whole seconds for the library's own connect timeout, rounded up so it
/// never fires before `connect_timeout`
pub fn connection_timeout_secs(connect_timeout: Duration) -> u64 {
    let secs = connect_timeout.as_secs();
    let rounded = if connect_timeout.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    };
    rounded.max(1)
}

/// Translate a client configuration into `rumqttc` options
pub fn configure_mqtt_options(config: &ClientConfig) -> Result<MqttOptions, MqttError> {
    let endpoint = BrokerEndpoint::parse(&config.broker)?;

    // rumqttc panics on keep-alives under five seconds, zero included
    if config.keep_alive < MIN_KEEP_ALIVE {
        return Err(MqttError::InvalidOption(format!(
            "keep-alive must be at least {MIN_KEEP_ALIVE:?}, got {:?}",
            config.keep_alive
        )));
    }

    let mut mqtt_options =
        MqttOptions::new(config.client_id.as_str(), endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = &config.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    mqtt_options.set_keep_alive(config.keep_alive);
    mqtt_options.set_connection_timeout(connection_timeout_secs(config.connect_timeout));

    Ok(mqtt_options)
}
