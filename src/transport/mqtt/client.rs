//! Impure I/O operations for the MQTT client facade
//!
//! This module owns the live `rumqttc` connection: it drives the event loop on
//! a tokio task, waits for CONNACK and SUBACK, and spawns the fire-and-forget
//! publish tasks.

use super::connection::{
    configure_mqtt_options, ClientConfig, ConnectionLostHandler, ConnectionState, Lifecycle,
    MqttError, OnConnectHandler, DISCONNECT_GRACE,
};
use super::message_handler::{ClientContext, EventRoute, EventRouter, MessageHandler};
use super::subscription::SubscriptionTracker;
use crate::mqtt_span;
use bytes::Bytes;
use rumqttc::v5::{mqttbytes::QoS, AsyncClient, EventLoop};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn, Instrument};

/// Capacity of the request channel between the client handle and event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;
/// Pause between polls after a connection error when auto-reconnect is on
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Outcome of one subscription attempted during `start`
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionReport {
    pub topic: String,
    /// `Err` carries the error description that was logged
    pub outcome: Result<(), String>,
}

/// Connection-lifecycle facade over a single `rumqttc` connection
pub struct MqttClient {
    config: ClientConfig,
    topics: Vec<String>,
    lifecycle: Lifecycle,
    connection: Option<ActiveConnection>,
    startup_subscriptions: Vec<SubscriptionReport>,
}

/// Everything that only exists between `start` and `destroy`
struct ActiveConnection {
    client: AsyncClient,
    event_loop_handle: JoinHandle<()>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown_tx: watch::Sender<bool>,
    subscriptions: SubscriptionTracker,
}

impl MqttClient {
    /// Build a client with default options. No connection is opened.
    pub fn new<H, I, S>(handler: H, topics: I, broker: impl Into<String>) -> Self
    where
        H: MessageHandler + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_config(
            ClientConfig::new(broker, Arc::new(handler)),
            topics.into_iter().map(Into::into).collect(),
        )
    }

    /// Build a client from a prepared configuration
    pub fn with_config(config: ClientConfig, topics: Vec<String>) -> Self {
        Self {
            config,
            topics,
            lifecycle: Lifecycle::Unstarted,
            connection: None,
            startup_subscriptions: Vec::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Options may be changed before `start`; changes afterwards take no effect
    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    pub fn client_id(&self) -> &str {
        self.config.client_id.as_str()
    }

    pub fn broker(&self) -> &str {
        &self.config.broker
    }

    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Per-topic outcome of the subscriptions made by the last `start`, in order
    pub fn startup_subscriptions(&self) -> &[SubscriptionReport] {
        &self.startup_subscriptions
    }

    /// Current link state, `None` before `start` and after `destroy`
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.connection
            .as_ref()
            .map(|connection| connection.state_rx.borrow().clone())
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state(), Some(ConnectionState::Connected))
    }

    /// Create connection state and shutdown channels
    #[allow(clippy::type_complexity)]
    fn setup_connection_channels() -> (
        (
            watch::Sender<ConnectionState>,
            watch::Receiver<ConnectionState>,
        ),
        (watch::Sender<bool>, watch::Receiver<bool>),
    ) {
        let state_channels = watch::channel(ConnectionState::Connecting);
        let shutdown_channels = watch::channel(false);
        (state_channels, shutdown_channels)
    }

    /// Wait for CONNACK, a connection error, or the timeout
    async fn wait_for_connection_confirmation(
        mut state_rx: watch::Receiver<ConnectionState>,
        timeout: Duration,
    ) -> Result<(), MqttError> {
        let timeout_result = tokio::time::timeout(timeout, async {
            loop {
                if state_rx.changed().await.is_err() {
                    return Err(MqttError::ConnectFailed(
                        "event loop stopped before CONNACK".to_string(),
                    ));
                }
                match *state_rx.borrow() {
                    ConnectionState::Connected => return Ok(()),
                    ConnectionState::Disconnected(ref reason) => {
                        return Err(MqttError::ConnectFailed(reason.clone()));
                    }
                    ConnectionState::Connecting => continue,
                }
            }
        })
        .await;

        match timeout_result {
            Ok(result) => result,
            Err(_) => Err(MqttError::ConnectTimeout(timeout)),
        }
    }

    /// Connect and subscribe to every configured topic.
    ///
    /// Only a connect failure is returned; failed startup subscriptions are
    /// logged and recorded in [`MqttClient::startup_subscriptions`].
    pub async fn start(&mut self) -> Result<(), MqttError> {
        match self.lifecycle {
            Lifecycle::Unstarted => {}
            Lifecycle::Connected => return Err(MqttError::AlreadyStarted),
            Lifecycle::Destroyed => return Err(MqttError::Destroyed),
        }

        let mqtt_options = configure_mqtt_options(&self.config)?;
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let ((state_tx, state_rx), (shutdown_tx, shutdown_rx)) =
            Self::setup_connection_channels();
        let subscriptions = SubscriptionTracker::new();
        let context = ClientContext::new(self.config.client_id.as_str(), &self.config.broker);

        let driver = EventLoopDriver {
            context,
            client: client.clone(),
            handler: self.config.message_handler.clone(),
            on_connect: self.config.on_connect.clone(),
            on_connection_lost: self.config.on_connection_lost.clone(),
            state_tx,
            shutdown_rx,
            subscriptions: subscriptions.clone(),
            topics: self.topics.clone(),
            auto_reconnect: self.config.auto_reconnect,
            ping_timeout: self.config.ping_timeout,
            connected_once: false,
        };
        let span = mqtt_span!(client_id = %self.client_id(), broker = %self.broker());
        let event_loop_handle = tokio::spawn(driver.run(event_loop).instrument(span));

        if let Err(e) =
            Self::wait_for_connection_confirmation(state_rx.clone(), self.config.connect_timeout)
                .await
        {
            let _ = shutdown_tx.send(true);
            event_loop_handle.abort();
            warn!(broker = %self.broker(), error = %e, "Connecting to MQTT broker failed");
            return Err(e);
        }
        info!(broker = %self.broker(), client_id = %self.client_id(), "Connected to MQTT broker");

        self.connection = Some(ActiveConnection {
            client,
            event_loop_handle,
            state_rx,
            shutdown_tx,
            subscriptions,
        });
        self.lifecycle = Lifecycle::Connected;

        let mut reports = Vec::with_capacity(self.topics.len());
        for topic in &self.topics {
            let outcome = self.subscribe_to_topic(topic).await;
            if let Err(e) = &outcome {
                error!(topic = %topic, error = %e, "Subscribing to topic failed");
            }
            reports.push(SubscriptionReport {
                topic: topic.clone(),
                outcome: outcome.map_err(|e| e.to_string()),
            });
        }
        self.startup_subscriptions = reports;

        Ok(())
    }

    fn active_connection(&self) -> Result<&ActiveConnection, MqttError> {
        let connection = self.connection.as_ref().ok_or(MqttError::NotConnected {
            lifecycle: self.lifecycle,
        })?;
        if let ConnectionState::Disconnected(reason) = &*connection.state_rx.borrow() {
            return Err(MqttError::ConnectionLost(reason.clone()));
        }
        Ok(connection)
    }

    /// Subscribe to one more topic at QoS 0 and wait for the broker's SUBACK.
    ///
    /// The topic is not added to the configured topic list.
    pub async fn subscribe_to_topic(&self, topic: &str) -> Result<(), MqttError> {
        let connection = self.active_connection()?;
        let ack = connection
            .subscriptions
            .request(&connection.client, topic)
            .await?;

        let timeout = self.config.subscribe_timeout;
        let outcome = tokio::time::timeout(timeout, ack)
            .await
            .map_err(|_| MqttError::SubscribeTimeout {
                topic: topic.to_string(),
                timeout,
            })?
            .map_err(|_| MqttError::SubscribeFailed {
                topic: topic.to_string(),
                reason: "connection closed before SUBACK".to_string(),
            })?;

        if let Err(codes) = outcome {
            return Err(MqttError::SubscribeRejected {
                topic: topic.to_string(),
                codes,
            });
        }

        info!(topic = %topic, "Subscribed to topic");
        Ok(())
    }

    /// Fire-and-forget publish at QoS 0, not retained.
    ///
    /// Only misuse is reported: `NotConnected` before `start` or after
    /// `destroy`, and `NoRuntime` when called outside a Tokio runtime.
    /// Transport failures, including a dropped link, are logged by a
    /// background task and never reach the caller.
    pub fn publish(&self, payload: impl Into<Bytes>, topic: &str) -> Result<(), MqttError> {
        let connection = self.connection.as_ref().ok_or(MqttError::NotConnected {
            lifecycle: self.lifecycle,
        })?;
        let runtime = Handle::try_current().map_err(|_| MqttError::NoRuntime)?;
        let client = connection.client.clone();
        let payload: Bytes = payload.into();
        let topic = topic.to_string();

        runtime.spawn(async move {
            if let Err(e) = client
                .publish(topic.clone(), QoS::AtMostOnce, false, payload.to_vec())
                .await
            {
                let e = MqttError::PublishFailed(e.to_string());
                error!(
                    topic = %topic,
                    payload = %String::from_utf8_lossy(&payload),
                    error = %e,
                    "Failed to publish"
                );
            }
        });
        Ok(())
    }

    /// Disconnect, allowing in-flight work 250 ms to drain, then tear down.
    ///
    /// Safe to call repeatedly and without a prior `start`.
    pub async fn destroy(&mut self) {
        self.lifecycle = Lifecycle::Destroyed;
        let Some(mut connection) = self.connection.take() else {
            debug!("destroy on a client without a connection");
            return;
        };

        let deadline = Instant::now() + DISCONNECT_GRACE;
        match tokio::time::timeout_at(deadline, connection.client.disconnect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(error = %e, "Disconnect request not delivered"),
            Err(_) => debug!("Disconnect request timed out"),
        }

        match tokio::time::timeout_at(deadline, &mut connection.event_loop_handle).await {
            Ok(_) => debug!("Event loop stopped"),
            Err(_) => {
                warn!("Event loop did not stop within the grace period, aborting");
                let _ = connection.shutdown_tx.send(true);
                connection.event_loop_handle.abort();
            }
        }

        info!(client_id = %self.client_id(), "MQTT client disconnected");
    }
}

impl Drop for MqttClient {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            let _ = connection.shutdown_tx.send(true);
            connection.event_loop_handle.abort();
        }
    }
}

/// State owned by the event-loop task
struct EventLoopDriver {
    context: ClientContext,
    client: AsyncClient,
    handler: Arc<dyn MessageHandler>,
    on_connect: OnConnectHandler,
    on_connection_lost: ConnectionLostHandler,
    state_tx: watch::Sender<ConnectionState>,
    shutdown_rx: watch::Receiver<bool>,
    subscriptions: SubscriptionTracker,
    topics: Vec<String>,
    auto_reconnect: bool,
    ping_timeout: Duration,
    connected_once: bool,
}

impl EventLoopDriver {
    async fn run(mut self, mut event_loop: EventLoop) {
        debug!("Starting MQTT event loop");
        let mut awaiting_pong: Option<Instant> = None;

        loop {
            let pong_deadline = awaiting_pong
                .filter(|_| !self.ping_timeout.is_zero())
                .map(|sent| sent + self.ping_timeout);

            tokio::select! {
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        debug!("Shutdown signal received, stopping event loop");
                        break;
                    }
                }

                _ = Self::pong_overdue(pong_deadline) => {
                    awaiting_pong = None;
                    let reason = format!("no PINGRESP within {:?}", self.ping_timeout);
                    if !self.handle_connection_lost(reason).await {
                        break;
                    }
                    // The stale link is still open; drop it so the next poll reconnects
                    event_loop.clean();
                }

                event = event_loop.poll() => match event {
                    Ok(event) => {
                        let route = EventRouter::route_mqtt_event(&event);
                        if !self.process_event_route(route, &mut awaiting_pong).await {
                            break;
                        }
                    }
                    Err(e) => {
                        awaiting_pong = None;
                        if !self.handle_connection_lost(e.to_string()).await {
                            break;
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }
        self.subscriptions.close().await;
        debug!("MQTT event loop stopped");
    }

    async fn pong_overdue(deadline: Option<Instant>) {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    }

    /// Returns true to keep polling
    async fn process_event_route(
        &mut self,
        route: EventRoute,
        awaiting_pong: &mut Option<Instant>,
    ) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged { session_present } => {
                let _ = self.state_tx.send(ConnectionState::Connected);
                (self.on_connect)(&self.context);
                if self.connected_once {
                    info!(session_present, "Reconnected to MQTT broker");
                    if !session_present {
                        self.resubscribe();
                    }
                }
                self.connected_once = true;
                true
            }
            EventRoute::MessageReceived { topic, payload } => {
                trace!(topic = %topic, bytes = payload.len(), "Received MQTT message");
                self.handler.handle(&self.context, &topic, &payload);
                true
            }
            EventRoute::SubscribeSent { packet_id } => {
                self.subscriptions.subscribe_sent(packet_id).await;
                true
            }
            EventRoute::SubscriptionAcknowledged {
                packet_id,
                failures,
            } => {
                self.subscriptions.acknowledged(packet_id, failures).await;
                true
            }
            EventRoute::PingSent => {
                *awaiting_pong = Some(Instant::now());
                true
            }
            EventRoute::PingResponse => {
                *awaiting_pong = None;
                true
            }
            EventRoute::DisconnectedByBroker { reason } => {
                self.handle_connection_lost(reason).await
            }
            EventRoute::DisconnectSent => {
                let _ = self
                    .state_tx
                    .send(ConnectionState::Disconnected("client disconnected".to_string()));
                false
            }
            EventRoute::InfrastructureEvent(event) => {
                trace!(event = %event, "MQTT event");
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Publish the loss and report whether polling should continue
    async fn handle_connection_lost(&self, reason: String) -> bool {
        self.subscriptions.connection_lost().await;
        let was_connected = matches!(*self.state_tx.borrow(), ConnectionState::Connected);
        let _ = self
            .state_tx
            .send(ConnectionState::Disconnected(reason.clone()));

        let cause = MqttError::ConnectionLost(reason);
        if was_connected {
            (self.on_connection_lost)(&self.context, &cause);
        } else {
            debug!(error = %cause, "MQTT connection attempt failed");
        }
        self.auto_reconnect
    }

    /// Re-issue the configured subscriptions after a clean-session reconnect
    fn resubscribe(&self) {
        let client = self.client.clone();
        let subscriptions = self.subscriptions.clone();
        let topics = self.topics.clone();
        // Separate task: the gate may be held by a caller blocked on the
        // request channel this loop drains
        tokio::spawn(async move {
            for topic in topics {
                match subscriptions.request_detached(&client, &topic).await {
                    Ok(()) => debug!(topic = %topic, "Re-subscribed to topic"),
                    Err(e) => error!(topic = %topic, error = %e, "Re-subscribing failed"),
                }
            }
        });
    }
}
