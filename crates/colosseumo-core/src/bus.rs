//! Topic-based publish/subscribe transport.
//!
//! [`Bus`] is the seam between the bridge and the broker. Implementations
//! deliver at least once and preserve per-publisher ordering; nothing else is
//! assumed. [`MemoryBroker`] is an in-process broker with MQTT topic-filter
//! semantics, used by tests and single-machine runs. The MQTT implementation
//! lives in its own crate.

use crate::message::{self, EncodeError, Envelope};
use crate::topic;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A message received from the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Errors raised by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("not connected to the broker")]
    Disconnected,
    #[error("cannot connect to broker: {0}")]
    Connect(String),
    #[error("publish on {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
    #[error("subscribe to {filter} failed: {reason}")]
    Subscribe { filter: String, reason: String },
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

/// A connection to a publish/subscribe broker.
///
/// Shared between the step loop and application threads, hence `Send + Sync`
/// and `&self` receivers throughout.
pub trait Bus: Send + Sync {
    /// Publish raw bytes on `topic`.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Receive messages on topics matching `filter` (`+` and `#` allowed).
    fn subscribe(&self, filter: &str) -> Result<(), BusError>;

    /// Next inbound message, if one is queued.
    fn try_recv(&self) -> Option<InboundMessage>;

    /// Next inbound message, waiting up to `timeout`.
    fn recv_timeout(&self, timeout: Duration) -> Option<InboundMessage>;

    /// Close the connection. Later publishes fail with
    /// [`BusError::Disconnected`].
    fn disconnect(&self);

    /// Encode and publish a single envelope.
    fn publish_envelope(&self, topic: &str, envelope: &Envelope) -> Result<(), BusError> {
        let payload = message::encode(envelope)?;
        self.publish(topic, payload)
    }
}

// ---------------------------------------------------------------------------
// MemoryBroker
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct ClientSlot {
    id: u64,
    filters: Vec<String>,
    tx: Sender<InboundMessage>,
}

#[derive(Debug, Default)]
struct BrokerState {
    clients: Vec<ClientSlot>,
    next_id: u64,
}

/// An in-process broker. Cloning yields another handle to the same broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new client connection.
    pub fn connect(&self) -> MemoryBus {
        let (tx, rx) = channel::unbounded();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.clients.push(ClientSlot {
            id,
            filters: Vec::new(),
            tx,
        });
        MemoryBus {
            id,
            broker: self.clone(),
            rx,
            connected: AtomicBool::new(true),
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.state.lock().clients.len()
    }

    fn route(&self, topic: &str, payload: &[u8]) {
        // Delivery happens under the lock so concurrent publishers cannot
        // interleave one publisher's messages out of order.
        let state = self.state.lock();
        for client in &state.clients {
            if client.filters.iter().any(|f| topic::matches(f, topic)) {
                let _ = client.tx.send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
        }
    }

    fn add_filter(&self, id: u64, filter: &str) -> bool {
        let mut state = self.state.lock();
        match state.clients.iter_mut().find(|c| c.id == id) {
            Some(client) => {
                if !client.filters.iter().any(|f| f == filter) {
                    client.filters.push(filter.to_string());
                }
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: u64) {
        self.state.lock().clients.retain(|c| c.id != id);
    }
}

// ---------------------------------------------------------------------------
// MemoryBus
// ---------------------------------------------------------------------------

/// One client connection to a [`MemoryBroker`]. Like MQTT, a client receives
/// its own publications on topics it is subscribed to.
#[derive(Debug)]
pub struct MemoryBus {
    id: u64,
    broker: MemoryBroker,
    rx: Receiver<InboundMessage>,
    connected: AtomicBool,
}

impl MemoryBus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Drain every queued message.
    pub fn drain(&self) -> Vec<InboundMessage> {
        self.rx.try_iter().collect()
    }
}

impl Bus for MemoryBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if !self.is_connected() {
            return Err(BusError::Disconnected);
        }
        self.broker.route(topic, &payload);
        Ok(())
    }

    fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        if !self.is_connected() || !self.broker.add_filter(self.id, filter) {
            return Err(BusError::Disconnected);
        }
        Ok(())
    }

    fn try_recv(&self) -> Option<InboundMessage> {
        self.rx.try_recv().ok()
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<InboundMessage> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.broker.remove(self.id);
        }
    }
}

impl Drop for MemoryBus {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_to_matching_subscribers_only() {
        let broker = MemoryBroker::new();
        let a = broker.connect();
        let b = broker.connect();
        a.subscribe("apicall/+").unwrap();
        b.subscribe("sumo/update").unwrap();

        let publisher = broker.connect();
        publisher.publish("apicall/p.0", b"x".to_vec()).unwrap();
        publisher.publish("sumo/update", b"y".to_vec()).unwrap();

        assert_eq!(a.drain().len(), 1);
        let got = b.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].topic, "sumo/update");
        assert_eq!(got[0].payload, b"y");
    }

    #[test]
    fn client_receives_own_publications() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        bus.subscribe("#").unwrap();
        bus.publish("a/b", vec![1]).unwrap();
        assert_eq!(bus.try_recv().map(|m| m.topic), Some("a/b".to_string()));
    }

    #[test]
    fn preserves_publisher_order() {
        let broker = MemoryBroker::new();
        let rx = broker.connect();
        rx.subscribe("t").unwrap();
        let tx = broker.connect();
        for i in 0..50u8 {
            tx.publish("t", vec![i]).unwrap();
        }
        let payloads: Vec<u8> = rx.drain().into_iter().map(|m| m.payload[0]).collect();
        assert_eq!(payloads, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn duplicate_subscription_delivers_once() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        bus.subscribe("t").unwrap();
        bus.subscribe("t").unwrap();
        bus.publish("t", vec![]).unwrap();
        assert_eq!(bus.drain().len(), 1);
    }

    #[test]
    fn disconnect_stops_traffic() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        assert_eq!(broker.client_count(), 1);
        bus.disconnect();
        assert_eq!(broker.client_count(), 0);
        assert!(matches!(bus.publish("t", vec![]), Err(BusError::Disconnected)));
        assert!(bus.subscribe("t").is_err());
    }

    #[test]
    fn drop_disconnects() {
        let broker = MemoryBroker::new();
        {
            let _bus = broker.connect();
            assert_eq!(broker.client_count(), 1);
        }
        assert_eq!(broker.client_count(), 0);
    }

    #[test]
    fn recv_timeout_returns_none_when_idle() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        assert!(bus.recv_timeout(Duration::from_millis(5)).is_none());
    }

    #[test]
    fn publish_envelope_encodes() {
        let broker = MemoryBroker::new();
        let bus = broker.connect();
        bus.subscribe("colosseum/update").unwrap();
        bus.publish_envelope("colosseum/update", &Envelope::StartSimulation)
            .unwrap();
        let msg = bus.try_recv().unwrap();
        assert_eq!(message::decode(&msg.payload).unwrap(), Envelope::StartSimulation);
    }
}
