//! MQTT Facade
//!
//! A thin connection-lifecycle layer over [`rumqttc`]: it builds client
//! options, manages a single broker connection and forwards subscribe and
//! publish operations.
//!
//! # Overview
//!
//! - [`transport::mqtt::MqttClient`] - construct, `start`, `subscribe_to_topic`,
//!   fire-and-forget `publish`, `destroy`
//! - [`config`] - TOML configuration with environment-provided credentials
//! - [`observability`] - structured logging setup
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use mqtt_facade::{ClientContext, MqttClient};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let handler = |ctx: &ClientContext, topic: &str, payload: &[u8]| {
//!     println!("[{}] {topic}: {payload:?}", ctx.client_id());
//! };
//!
//! let mut client = MqttClient::new(handler, ["a", "b", "c"], "tcp://127.0.0.1:1883");
//! client.config_mut().connect_timeout = Duration::from_secs(1);
//! client.start().await?;
//!
//! client.subscribe_to_topic("d").await?;
//! client.publish(&b"hello"[..], "b")?;
//!
//! client.destroy().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod observability;
pub mod transport;

pub use config::{ConfigError, FacadeConfig, MqttSection};
pub use transport::mqtt::{
    ClientConfig, ClientContext, ClientIdentity, ConnectionState, Lifecycle, MessageHandler,
    MqttClient, MqttError, SubscriptionReport,
};
