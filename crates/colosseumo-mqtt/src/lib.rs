//! MQTT transport for the Colosseumo bridge.
//!
//! [`MqttBus`] implements [`Bus`] over a synchronous `rumqttc` client. A
//! background thread drives the connection's event loop and feeds incoming
//! publications into a channel; the bus trait methods read from it.
//! Publishes and subscriptions use QoS 1 (at least once), which is all the
//! bridge relies on.
//!
//! The first connection attempt is awaited in [`MqttBus::connect`] and a
//! failure is reported as [`BusError::Connect`]. Once connected, transient
//! errors are logged and the client reconnects, restoring subscriptions.
//! [`Bus::disconnect`] queues a disconnect behind any pending publishes, so
//! a publish followed by a disconnect still reaches the broker.

use colosseumo_core::bus::{Bus, BusError, InboundMessage};
use colosseumo_core::config::BrokerConfig;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rumqttc::{
    Client, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Capacity of the client's outgoing request queue.
const REQUEST_CAPACITY: usize = 256;

/// Smallest keep-alive interval the client accepts.
const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Pause before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Client options for `config`, with `client_id` overriding the configured
/// one when given.
pub fn mqtt_options(config: &BrokerConfig, client_id: Option<&str>) -> MqttOptions {
    let id = client_id.unwrap_or(&config.client_id);
    let mut options = MqttOptions::new(id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive_secs).max(MIN_KEEP_ALIVE));
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    options
}

/// Turn a connection event into an inbound message, if it carries one.
fn inbound_of(event: &Event) -> Option<InboundMessage> {
    match event {
        Event::Incoming(Packet::Publish(publish)) => Some(InboundMessage {
            topic: publish.topic.clone(),
            payload: publish.payload.to_vec(),
        }),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// MqttBus
// ---------------------------------------------------------------------------

/// A [`Bus`] backed by an MQTT broker connection.
pub struct MqttBus {
    client: Client,
    inbox: Receiver<InboundMessage>,
    filters: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Connect to the broker, waiting up to `timeout` for it to accept.
    pub fn connect(options: MqttOptions, timeout: Duration) -> Result<Self, BusError> {
        let (host, port) = options.broker_address();
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let (inbox_tx, inbox) = channel::unbounded();
        let (ready_tx, ready) = channel::bounded(1);
        let filters = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let driver = {
            let client = client.clone();
            let filters = filters.clone();
            let closed = closed.clone();
            thread::Builder::new()
                .name("mqtt-events".to_string())
                .spawn(move || drive(connection, client, inbox_tx, ready_tx, filters, closed))
                .map_err(|e| BusError::Connect(format!("cannot spawn event thread: {e}")))?
        };

        let outcome = ready
            .recv_timeout(timeout)
            .unwrap_or_else(|_| Err(format!("no answer from {host}:{port} within {timeout:?}")));
        let bus = Self {
            client,
            inbox,
            filters,
            closed,
            driver: Mutex::new(Some(driver)),
        };
        match outcome {
            Ok(()) => {
                info!(%host, port, "connected to MQTT broker");
                Ok(bus)
            }
            Err(reason) => {
                bus.disconnect();
                Err(BusError::Connect(reason))
            }
        }
    }

    /// Connect using a [`BrokerConfig`].
    pub fn from_config(
        config: &BrokerConfig,
        client_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, BusError> {
        Self::connect(mqtt_options(config, client_id), timeout)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn drive(
    mut connection: Connection,
    client: Client,
    inbox: Sender<InboundMessage>,
    ready: Sender<Result<(), String>>,
    filters: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
) {
    let mut connected_once = false;
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if connected_once {
                    info!("reconnected to MQTT broker");
                    for filter in filters.lock().iter() {
                        if let Err(err) = client.subscribe(filter.clone(), QoS::AtLeastOnce) {
                            warn!(%filter, %err, "cannot restore subscription");
                        }
                    }
                } else {
                    connected_once = true;
                    let _ = ready.try_send(Ok(()));
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(event) => {
                if let Some(msg) = inbound_of(&event) {
                    debug!(topic = %msg.topic, bytes = msg.payload.len(), "received");
                    if inbox.send(msg).is_err() {
                        break;
                    }
                }
            }
            Err(err) => {
                if !connected_once {
                    let _ = ready.try_send(Err(err.to_string()));
                    break;
                }
                if closed.load(Ordering::Acquire)
                    || matches!(err, ConnectionError::RequestsDone)
                {
                    break;
                }
                warn!(%err, "MQTT connection error");
                thread::sleep(RECONNECT_DELAY);
            }
        }
    }
    debug!("MQTT event thread finished");
}

impl Bus for MqttBus {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Disconnected);
        }
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, filter: &str) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Disconnected);
        }
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .map_err(|e| BusError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;
        let mut filters = self.filters.lock();
        if !filters.iter().any(|f| f == filter) {
            filters.push(filter.to_string());
        }
        Ok(())
    }

    fn try_recv(&self) -> Option<InboundMessage> {
        self.inbox.try_recv().ok()
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<InboundMessage> {
        self.inbox.recv_timeout(timeout).ok()
    }

    fn disconnect(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.client.disconnect() {
            debug!(%err, "disconnect request not delivered");
        }
        if let Some(driver) = self.driver.lock().take()
            && driver.join().is_err()
        {
            warn!("MQTT event thread panicked");
        }
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.disconnect();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
