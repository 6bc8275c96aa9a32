//! Transport layer
//!
//! MQTT is the only transport; see [`mqtt`].

pub mod mqtt;
