//! SUBACK tracking for subscribe requests
//!
//! `rumqttc` assigns packet ids inside its event loop, so a caller cannot
//! know the id of its SUBSCRIBE up front. Requests are queued in the order
//! they enter the client's request channel; the event loop pairs each
//! `Outgoing::Subscribe(pkid)` with the oldest queued waiter and resolves it
//! when the matching SUBACK arrives. Waiters dropped on connection loss see
//! a closed channel.

use super::connection::MqttError;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::AsyncClient;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

/// `Ok` on success, otherwise the rejected reason codes
pub type SubAckOutcome = Result<(), Vec<String>>;

type Waiter = Option<oneshot::Sender<SubAckOutcome>>;

/// Pure bookkeeping of subscribe requests awaiting SUBACK
#[derive(Debug, Default)]
pub struct PendingSubscriptions {
    queued: VecDeque<Waiter>,
    in_flight: HashMap<u16, Waiter>,
}

impl PendingSubscriptions {
    /// Queue a request; `None` for subscriptions nobody waits on
    pub fn enqueue(&mut self, waiter: Waiter) {
        self.queued.push_back(waiter);
    }

    /// Drop the most recent request after its send failed
    pub fn cancel_last(&mut self) {
        self.queued.pop_back();
    }

    /// Bind the oldest queued request to the packet id it was written with
    pub fn on_subscribe_sent(&mut self, packet_id: u16) {
        match self.queued.pop_front() {
            Some(waiter) => {
                self.in_flight.insert(packet_id, waiter);
            }
            None => warn!(packet_id, "SUBSCRIBE sent with no queued request"),
        }
    }

    /// Resolve the request for `packet_id`. Returns false for unknown ids.
    pub fn on_suback(&mut self, packet_id: u16, failures: Vec<String>) -> bool {
        let Some(waiter) = self.in_flight.remove(&packet_id) else {
            return false;
        };
        if let Some(tx) = waiter {
            let outcome = if failures.is_empty() {
                Ok(())
            } else {
                Err(failures)
            };
            // Receiver gone means the caller timed out
            let _ = tx.send(outcome);
        }
        true
    }

    /// Drop waiters whose SUBSCRIBE was already written; the broker will not
    /// answer them on a new connection. Returns how many were dropped.
    pub fn abandon_in_flight(&mut self) -> usize {
        let dropped = self.in_flight.len();
        self.in_flight.clear();
        dropped
    }

    /// Drop every waiter, sent or not
    pub fn abandon_all(&mut self) -> usize {
        let dropped = self.len();
        self.queued.clear();
        self.in_flight.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.queued.len() + self.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle used by the facade and the event loop
#[derive(Debug, Clone, Default)]
pub struct SubscriptionTracker {
    // Held across enqueue + send so queue order matches request-channel order
    gate: Arc<Mutex<()>>,
    pending: Arc<Mutex<PendingSubscriptions>>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a QoS 0 SUBSCRIBE and return a receiver for its SUBACK
    pub async fn request(
        &self,
        client: &AsyncClient,
        topic: &str,
    ) -> Result<oneshot::Receiver<SubAckOutcome>, MqttError> {
        let (tx, rx) = oneshot::channel();
        self.send(client, topic, Some(tx)).await?;
        Ok(rx)
    }

    /// Send a QoS 0 SUBSCRIBE without waiting for its SUBACK
    pub async fn request_detached(&self, client: &AsyncClient, topic: &str) -> Result<(), MqttError> {
        self.send(client, topic, None).await
    }

    async fn send(&self, client: &AsyncClient, topic: &str, waiter: Waiter) -> Result<(), MqttError> {
        let _gate = self.gate.lock().await;
        self.pending.lock().await.enqueue(waiter);

        if let Err(e) = client.subscribe(topic, QoS::AtMostOnce).await {
            self.pending.lock().await.cancel_last();
            return Err(MqttError::SubscribeFailed {
                topic: topic.to_string(),
                reason: e.to_string(),
            });
        }
        Ok(())
    }

    pub async fn subscribe_sent(&self, packet_id: u16) {
        self.pending.lock().await.on_subscribe_sent(packet_id);
    }

    pub async fn acknowledged(&self, packet_id: u16, failures: Vec<String>) {
        if !self.pending.lock().await.on_suback(packet_id, failures) {
            warn!(packet_id, "SUBACK for unknown packet id");
        }
    }

    /// Fail requests that can no longer be acknowledged after a connection loss
    pub async fn connection_lost(&self) {
        let dropped = self.pending.lock().await.abandon_in_flight();
        if dropped > 0 {
            debug!(dropped, "Abandoned subscriptions awaiting SUBACK");
        }
    }

    /// Fail every outstanding request once the event loop has stopped
    pub async fn close(&self) {
        self.pending.lock().await.abandon_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_resolve_in_send_order() {
        let mut pending = PendingSubscriptions::default();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, mut rx_b) = oneshot::channel();
        pending.enqueue(Some(tx_a));
        pending.enqueue(Some(tx_b));

        pending.on_subscribe_sent(1);
        pending.on_subscribe_sent(2);
        assert_eq!(pending.len(), 2);

        // SUBACKs may arrive in any order
        assert!(pending.on_suback(2, vec!["NotAuthorized".to_string()]));
        assert!(pending.on_suback(1, vec![]));

        assert_eq!(rx_a.try_recv().unwrap(), Ok(()));
        assert_eq!(
            rx_b.try_recv().unwrap(),
            Err(vec!["NotAuthorized".to_string()])
        );
        assert!(pending.is_empty());
    }

    #[test]
    fn test_detached_request_keeps_order() {
        let mut pending = PendingSubscriptions::default();
        let (tx, mut rx) = oneshot::channel();
        pending.enqueue(None);
        pending.enqueue(Some(tx));

        pending.on_subscribe_sent(10);
        pending.on_subscribe_sent(11);
        assert!(pending.on_suback(10, vec![]));
        assert!(rx.try_recv().is_err(), "detached SUBACK must not resolve the waiter");
        assert!(pending.on_suback(11, vec![]));
        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_cancel_last_removes_newest() {
        let mut pending = PendingSubscriptions::default();
        let (tx_a, mut rx_a) = oneshot::channel();
        let (tx_b, _rx_b) = oneshot::channel();
        pending.enqueue(Some(tx_a));
        pending.enqueue(Some(tx_b));
        pending.cancel_last();

        pending.on_subscribe_sent(5);
        assert!(pending.on_suback(5, vec![]));
        assert_eq!(rx_a.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_unknown_suback_is_reported() {
        let mut pending = PendingSubscriptions::default();
        assert!(!pending.on_suback(42, vec![]));
        // Sent with nothing queued is tolerated
        pending.on_subscribe_sent(43);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_dropping_tracker_fails_waiters() {
        let mut pending = PendingSubscriptions::default();
        let (tx, mut rx) = oneshot::channel();
        pending.enqueue(Some(tx));
        pending.on_subscribe_sent(1);
        drop(pending);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_abandon_in_flight_keeps_queued_order() {
        let mut pending = PendingSubscriptions::default();
        let (tx_sent, mut rx_sent) = oneshot::channel();
        let (tx_queued, mut rx_queued) = oneshot::channel();
        pending.enqueue(Some(tx_sent));
        pending.on_subscribe_sent(1);
        pending.enqueue(Some(tx_queued));

        assert_eq!(pending.abandon_in_flight(), 1);
        assert!(matches!(
            rx_sent.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));

        // The queued request is written after reconnect with a new id
        pending.on_subscribe_sent(7);
        assert!(pending.on_suback(7, vec![]));
        assert_eq!(rx_queued.try_recv().unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_close_fails_every_waiter() {
        let tracker = SubscriptionTracker::new();
        let (tx_a, rx_a) = oneshot::channel();
        let (tx_b, rx_b) = oneshot::channel();
        {
            let mut pending = tracker.pending.lock().await;
            pending.enqueue(Some(tx_a));
            pending.on_subscribe_sent(3);
            pending.enqueue(Some(tx_b));
        }

        tracker.close().await;
        assert!(rx_a.await.is_err());
        assert!(rx_b.await.is_err());
        assert!(tracker.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_tracker_resolves_through_shared_handle() {
        let tracker = SubscriptionTracker::new();
        let (tx, rx) = oneshot::channel();
        tracker.pending.lock().await.enqueue(Some(tx));

        let event_loop_side = tracker.clone();
        event_loop_side.subscribe_sent(9).await;
        event_loop_side.acknowledged(9, vec![]).await;

        assert_eq!(rx.await.unwrap(), Ok(()));
    }
}
