//! Runtime for one application on one testbed node.
//!
//! When the testbed runs the applications, each node hosts a single vehicle's
//! application. [`NodeRuntime`] connects it to the bus: it listens on the
//! vehicle's `apiresponse/{id}` and `directcomm/{id}` topics, feeds replies
//! into its own RPC gateway, forwards packets, and turns the bridge's update
//! batches into step events. It exits when the bridge deletes the vehicle,
//! when asked to, or when the application dies.
//!
//! Step events built from update batches carry position and time only; the
//! other kinematic fields are zero. Applications needing them query the
//! simulator through the API.

use crate::application::{
    ApplicationFactory, ApplicationFault, ApplicationHost, NodeContext, NodeInfo,
};
use crate::bus::{Bus, BusError, InboundMessage};
use crate::message::{self, Envelope};
use crate::rpc::{Resolution, RpcGateway};
use crate::simulator::Kinematics;
use crate::topic;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Errors starting a node runtime.
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Application(#[from] ApplicationFault),
}

/// Why a node runtime exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeExit {
    /// The bridge deleted this node's vehicle.
    VehicleDeleted,
    /// Shutdown was requested locally.
    Stopped,
    /// The application faulted or panicked.
    ApplicationEnded,
}

pub struct NodeRuntime {
    info: NodeInfo,
    bus: Arc<dyn Bus>,
    gateway: Arc<RpcGateway>,
    host: Option<ApplicationHost>,
    poll_interval: Duration,
}

impl NodeRuntime {
    /// Subscribe to the vehicle's topics and start its application.
    pub fn start(
        info: NodeInfo,
        factory: &dyn ApplicationFactory,
        bus: Arc<dyn Bus>,
        call_timeout: Duration,
    ) -> Result<Self, NodeError> {
        bus.subscribe(topic::SUMO_UPDATE)?;
        bus.subscribe(&topic::api_response(&info.sumo_id))?;
        bus.subscribe(&topic::direct_comm(&info.sumo_id))?;

        let gateway = Arc::new(RpcGateway::new(bus.clone()));
        let app = factory.create(&info)?;
        let ctx = NodeContext::new(info.clone(), gateway.clone(), bus.clone(), call_timeout);
        let host = ApplicationHost::spawn(app, ctx)?;
        info!(sumo_id = %info.sumo_id, node_id = %info.node_id, application = %info.application, "node started");

        Ok(Self {
            info,
            bus,
            gateway,
            host: Some(host),
            poll_interval: Duration::from_millis(100),
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// How long the application gets to stop before it is detached.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.host = self.host.take().map(|host| host.with_stop_timeout(stop_timeout));
        self
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    /// Handle at most one inbound message, waiting up to `timeout` for it.
    /// Returns why the runtime should exit, if it should.
    pub fn pump(&mut self, timeout: Duration) -> Option<NodeExit> {
        let exit = self
            .bus
            .recv_timeout(timeout)
            .and_then(|msg| self.handle(msg));
        self.gateway.expire(Instant::now());
        if exit.is_some() {
            return exit;
        }
        match &self.host {
            Some(host) if host.is_running() => None,
            _ => Some(NodeExit::ApplicationEnded),
        }
    }

    /// Pump until an exit condition or `shutdown` is set, then stop.
    pub fn run(mut self, shutdown: &AtomicBool) -> NodeExit {
        let exit = loop {
            if shutdown.load(Ordering::Acquire) {
                break NodeExit::Stopped;
            }
            if let Some(exit) = self.pump(self.poll_interval) {
                break exit;
            }
        };
        info!(sumo_id = %self.info.sumo_id, ?exit, "node exiting");
        self.shutdown();
        exit
    }

    fn handle(&mut self, msg: InboundMessage) -> Option<NodeExit> {
        if msg.topic == topic::SUMO_UPDATE {
            return self.handle_update(&msg.payload);
        }
        let envelope = match message::decode(&msg.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic = %msg.topic, %err, "dropping undecodable message");
                return None;
            }
        };
        let host = self.host.as_ref()?;
        match envelope {
            Envelope::ApiReturn(reply) => {
                if self.gateway.resolve(&reply) == Resolution::Resolved {
                    host.api_return(reply.transaction_id, reply.response);
                }
            }
            Envelope::VehicleData(packet) if packet.is_packet() => {
                let for_us = packet
                    .recipient
                    .as_deref()
                    .is_none_or(|r| r == self.info.sumo_id);
                if for_us {
                    host.deliver(packet);
                } else {
                    debug!(recipient = ?packet.recipient, "packet for another vehicle");
                }
            }
            other => debug!(kind = %other.kind(), "ignoring inbound message"),
        }
        None
    }

    fn handle_update(&mut self, payload: &[u8]) -> Option<NodeExit> {
        let batch = match message::decode_batch(payload) {
            Ok(batch) => batch,
            Err(err) => {
                warn!(%err, "dropping undecodable update");
                return None;
            }
        };
        let mut time = None;
        let mut position = None;
        for envelope in &batch {
            match envelope {
                Envelope::Time(t) => time = Some(t.time),
                Envelope::DeleteVehicle(d) if d.sumo_id == self.info.sumo_id => {
                    return Some(NodeExit::VehicleDeleted);
                }
                Envelope::UpdatePosition(p) if p.colosseum_id == self.info.node_id => {
                    position = Some((p.x, p.y));
                }
                _ => {}
            }
        }
        if let (Some(time), Some((x, y)), Some(host)) = (time, position, &self.host) {
            host.step(Kinematics {
                x,
                y,
                speed: 0.0,
                acceleration: 0.0,
                controller_acceleration: 0.0,
                time,
            });
        }
        None
    }

    fn shutdown(&mut self) {
        let Some(host) = self.host.take() else {
            return;
        };
        self.gateway.abort_all();
        host.stop();
        self.bus.disconnect();
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBroker;
    use crate::id::{NodeId, TransactionId};
    use crate::message::{ApiReturn, Batch, DeleteVehicle, PositionUpdate};
    use crate::test_utils::{AppEvent, RecordingFactory, kinematics_at};

    fn start(broker: &MemoryBroker, factory: &RecordingFactory) -> NodeRuntime {
        let info = NodeInfo {
            sumo_id: "p.1".into(),
            node_id: NodeId(1),
            application: "recording".into(),
            parameters: "{}".into(),
        };
        NodeRuntime::start(
            info,
            factory,
            Arc::new(broker.connect()),
            Duration::from_millis(100),
        )
        .unwrap()
    }

    fn update(envelopes: Vec<Envelope>) -> Vec<u8> {
        let mut batch = Batch::new();
        for e in envelopes {
            batch.push(e);
        }
        batch.encode().unwrap()
    }

    #[test]
    fn update_batches_become_steps() {
        let broker = MemoryBroker::new();
        let factory = RecordingFactory::new();
        let mut node = start(&broker, &factory);
        let bridge = broker.connect();

        let payload = update(vec![
            Envelope::time(1.5),
            Envelope::UpdatePosition(PositionUpdate {
                colosseum_id: NodeId(0),
                x: 1.0,
                y: 0.0,
                crs: None,
            }),
            Envelope::UpdatePosition(PositionUpdate {
                colosseum_id: NodeId(1),
                x: 42.0,
                y: 0.0,
                crs: None,
            }),
        ]);
        bridge.publish(topic::SUMO_UPDATE, payload).unwrap();
        assert_eq!(node.pump(Duration::from_secs(1)), None);

        let delete = update(vec![
            Envelope::time(1.6),
            Envelope::DeleteVehicle(DeleteVehicle {
                sumo_id: "p.1".into(),
                colosseum_id: NodeId(1),
            }),
        ]);
        bridge.publish(topic::SUMO_UPDATE, delete).unwrap();
        assert_eq!(node.pump(Duration::from_secs(1)), Some(NodeExit::VehicleDeleted));
        drop(node);

        assert_eq!(
            factory.log_of("p.1").unwrap(),
            vec![AppEvent::Start, AppEvent::Step(1.5), AppEvent::Stop]
        );
    }

    #[test]
    fn packets_reach_the_application() {
        let broker = MemoryBroker::new();
        let factory = RecordingFactory::new();
        let mut node = start(&broker, &factory);
        let peer = broker.connect();

        let mut packet = kinematics_at(3.0, 7.0).to_vehicle_data("p.0");
        packet.sender = Some("p.0".into());
        packet.recipient = Some("p.1".into());
        peer.publish_envelope(&topic::direct_comm("p.1"), &Envelope::VehicleData(packet.clone()))
            .unwrap();
        node.pump(Duration::from_secs(1));
        drop(node);

        let log = factory.log_of("p.1").unwrap();
        assert_eq!(log[1], AppEvent::Receive(packet));
    }

    #[test]
    fn stray_replies_are_not_forwarded() {
        let broker = MemoryBroker::new();
        let factory = RecordingFactory::new();
        let mut node = start(&broker, &factory);
        let bridge = broker.connect();
        let reply = ApiReturn {
            sumo_id: "p.1".into(),
            api_code: "ccvd".into(),
            transaction_id: TransactionId(5),
            response: "{}".into(),
        };
        bridge
            .publish_envelope(&topic::api_response("p.1"), &Envelope::ApiReturn(reply))
            .unwrap();
        node.pump(Duration::from_secs(1));
        drop(node);
        assert_eq!(
            factory.log_of("p.1").unwrap(),
            vec![AppEvent::Start, AppEvent::Stop]
        );
    }

    #[test]
    fn run_honours_shutdown_flag() {
        let broker = MemoryBroker::new();
        let factory = RecordingFactory::new();
        let node = start(&broker, &factory).with_poll_interval(Duration::from_millis(5));
        let shutdown = AtomicBool::new(true);
        assert_eq!(node.run(&shutdown), NodeExit::Stopped);
        assert_eq!(broker.client_count(), 0);
    }
}
