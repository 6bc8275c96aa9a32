//! MQTT client facade over `rumqttc`
//!
//! This module separates pure configuration and routing logic from the
//! impure connection handling.
//!
//! # Architecture
//!
//! - [`connection`] - Client options, identity and broker URI parsing
//! - [`message_handler`] - Message handler seam and pure event routing
//! - [`subscription`] - SUBACK bookkeeping for subscribe requests
//! - [`client`] - Impure I/O: connect, subscribe, publish, disconnect
//!
//! # Usage
//!
//! ```rust,no_run
//! use mqtt_facade::transport::mqtt::{ClientContext, MqttClient};
//!
//! # tokio_test::block_on(async {
//! let handler = |_ctx: &ClientContext, topic: &str, payload: &[u8]| {
//!     println!("{topic}: {}", String::from_utf8_lossy(payload));
//! };
//! let mut client = MqttClient::new(handler, ["a", "b", "c"], "tcp://127.0.0.1:1883");
//! client.start().await?;
//! client.publish("hello", "b")?;
//! client.destroy().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;
pub mod subscription;

pub use client::{MqttClient, SubscriptionReport};
pub use connection::{
    configure_mqtt_options, connection_timeout_secs, BrokerEndpoint, ClientConfig, ClientIdentity,
    ConnectionLostHandler, ConnectionState, Credentials, Lifecycle, MqttError, OnConnectHandler,
    MIN_KEEP_ALIVE,
};
pub use message_handler::{
    log_connection_lost, log_on_connect, ClientContext, EventRoute, EventRouter, MessageHandler,
};
pub use subscription::{PendingSubscriptions, SubscriptionTracker};

