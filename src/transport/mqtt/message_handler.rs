//! Message handler seam and pure event routing
//!
//! Incoming publishes are handed to a [`MessageHandler`]; every other library
//! event is classified by [`EventRouter`] into an [`EventRoute`] that the
//! event loop acts on.

use super::connection::MqttError;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use tracing::debug;

/// Identity of the connection a callback fires for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    client_id: String,
    broker: String,
}

impl ClientContext {
    pub fn new(client_id: impl Into<String>, broker: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            broker: broker.into(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }
}

/// Receives every message delivered on a subscribed topic.
///
/// Runs on the event loop task, so implementations should return quickly.
/// Any `Fn(&ClientContext, &str, &[u8]) + Send + Sync` closure is a handler.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, context: &ClientContext, topic: &str, payload: &[u8]);
}

impl<F> MessageHandler for F
where
    F: Fn(&ClientContext, &str, &[u8]) + Send + Sync,
{
    fn handle(&self, context: &ClientContext, topic: &str, payload: &[u8]) {
        self(context, topic, payload)
    }
}

/// Default on-connect callback
pub fn log_on_connect(context: &ClientContext) {
    debug!(client_id = %context.client_id(), "Connected to MQTT broker");
}

/// Default connection-lost callback
pub fn log_connection_lost(context: &ClientContext, cause: &MqttError) {
    debug!(
        client_id = %context.client_id(),
        error = %cause,
        "Connection lost"
    );
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// CONNACK received
    ConnectionAcknowledged { session_present: bool },
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// SUBSCRIBE written with this packet id
    SubscribeSent { packet_id: u16 },
    /// SUBACK received; `failures` holds every non-success reason code
    SubscriptionAcknowledged { packet_id: u16, failures: Vec<String> },
    PingSent,
    PingResponse,
    /// Broker sent DISCONNECT
    DisconnectedByBroker { reason: String },
    /// Our own DISCONNECT was written
    DisconnectSent,
    /// Anything else (PUBACK, UNSUBACK, ...)
    InfrastructureEvent(String),
    /// Outgoing event with no follow-up
    OutgoingEvent,
}

/// Pure classification of library events
pub struct EventRouter;

impl EventRouter {
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(connack) => EventRoute::ConnectionAcknowledged {
                    session_present: connack.session_present,
                },
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                },
                Packet::SubAck(suback) => EventRoute::SubscriptionAcknowledged {
                    packet_id: suback.pkid,
                    failures: Self::subscription_failures(&suback.return_codes),
                },
                Packet::PingResp(_) => EventRoute::PingResponse,
                Packet::Disconnect(disconnect) => EventRoute::DisconnectedByBroker {
                    reason: format!("{disconnect:?}"),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(outgoing) => match outgoing {
                Outgoing::Subscribe(packet_id) => EventRoute::SubscribeSent {
                    packet_id: *packet_id,
                },
                Outgoing::PingReq => EventRoute::PingSent,
                Outgoing::Disconnect => EventRoute::DisconnectSent,
                _ => EventRoute::OutgoingEvent,
            },
        }
    }

    /// Non-success SUBACK reason codes, formatted for error reporting
    pub fn subscription_failures(codes: &[SubscribeReasonCode]) -> Vec<String> {
        codes
            .iter()
            .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
            .map(|code| format!("{code:?}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::v5::mqttbytes::v5::SubAck;
    use rumqttc::v5::mqttbytes::QoS;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_closure_is_message_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |ctx: &ClientContext, topic: &str, payload: &[u8]| {
            sink.lock()
                .unwrap()
                .push((ctx.client_id().to_string(), topic.to_string(), payload.to_vec()));
        };

        let ctx = ClientContext::new("abcd1234", "tcp://127.0.0.1:1883");
        handler.handle(&ctx, "b", b"hello");

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[("abcd1234".to_string(), "b".to_string(), b"hello".to_vec())]
        );
    }

    #[test]
    fn test_default_callbacks_do_not_panic() {
        let ctx = ClientContext::new("abcd1234", "tcp://127.0.0.1:1883");
        log_on_connect(&ctx);
        log_connection_lost(&ctx, &MqttError::ConnectionLost("reset".to_string()));
    }

    #[test]
    fn test_route_outgoing_events() {
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::Subscribe(7))),
            EventRoute::SubscribeSent { packet_id: 7 }
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::PingReq)),
            EventRoute::PingSent
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Outgoing(Outgoing::Publish(3))),
            EventRoute::OutgoingEvent
        );
    }

    #[test]
    fn test_route_suback() {
        let suback = SubAck {
            pkid: 4,
            return_codes: vec![SubscribeReasonCode::Success(QoS::AtMostOnce)],
            properties: None,
        };
        assert_eq!(
            EventRouter::route_mqtt_event(&Event::Incoming(Packet::SubAck(suback))),
            EventRoute::SubscriptionAcknowledged {
                packet_id: 4,
                failures: vec![],
            }
        );
    }

    #[test]
    fn test_subscription_failures() {
        let codes = vec![
            SubscribeReasonCode::Success(QoS::AtMostOnce),
            SubscribeReasonCode::NotAuthorized,
        ];
        let failures = EventRouter::subscription_failures(&codes);
        assert_eq!(failures, vec!["NotAuthorized".to_string()]);
    }
}
