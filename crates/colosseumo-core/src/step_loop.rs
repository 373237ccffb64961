//! The control loop coupling the simulator to the bus.
//!
//! # Lifecycle
//!
//! ```text
//! INIT -> WAITING_FOR_START -> RUNNING -> STOPPING -> TERMINATED
//! ```
//!
//! 1. **Init** -- Subscribe to inbound topics, let the scenario insert its
//!    vehicles, register them and publish an initial update so the testbed
//!    learns the vehicle to node mapping.
//! 2. **Waiting for start** -- Serve inbound traffic until the testbed sends
//!    `start_simulation`, then start local applications. Skipped with
//!    `start_immediately`.
//! 3. **Running** -- One [`StepLoop::tick`] per simulator step (see below).
//! 4. **Stopping** -- Abort pending calls, publish a final update deleting
//!    every vehicle, stop applications, close the simulator and the bus.
//!    Runs on every exit path, fatal or not.
//!
//! # Tick
//!
//! Each tick advances the simulator, reconciles the vehicle registry, and
//! publishes one update batch on `sumo/update`:
//!
//! ```text
//! [time, delete_vehicle*, new_vehicle*, (update_position, vehicle_data?)*]
//! ```
//!
//! Position and data entries follow ascending node order. A vehicle's
//! position is never reported before its `new_vehicle`. Inbound messages are
//! drained after publishing; API calls are served against the simulator on
//! this thread, so the loop itself never waits on a pending call.

use crate::application::ApplicationFactory;
use crate::bus::{Bus, InboundMessage};
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::id::{NodeId, SimTime};
use crate::message::{
    self, ApiCall, ApiReturn, Batch, DeleteVehicle, Envelope, NewVehicle, PositionUpdate,
    VehicleData,
};
use crate::registry::{Launcher, VehicleRegistry};
use crate::rpc::{self, Resolution, RpcGateway};
use crate::simulator::{Kinematics, Scenario, Simulator};
use crate::topic;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Upper bound on inbound messages handled per tick, so a chatty peer cannot
/// hold the loop in one tick forever.
const MAX_INBOUND_PER_TICK: usize = 4096;

// ---------------------------------------------------------------------------
// States and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Init,
    WaitingForStart,
    Running,
    Stopping,
    Terminated,
}

/// Why a run ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The testbed sent `stop_simulation`.
    StopMessage,
    /// Simulation time passed the configured maximum.
    TimeLimit,
    /// No vehicles left and none scheduled.
    SimulationEmpty,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopReason::StopMessage => "stop requested",
            StopReason::TimeLimit => "time limit reached",
            StopReason::SimulationEmpty => "simulation empty",
        })
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub final_time: SimTime,
    pub reason: StopReason,
}

enum Control {
    Continue,
    Start,
    Stop,
}

// ---------------------------------------------------------------------------
// StepLoop
// ---------------------------------------------------------------------------

/// Drives one simulation from start to teardown.
pub struct StepLoop<S, Sc> {
    config: BridgeConfig,
    simulator: S,
    scenario: Sc,
    bus: Arc<dyn Bus>,
    gateway: Option<Arc<RpcGateway>>,
    registry: VehicleRegistry,
    /// Vehicles whose data the testbed asked for, answered next tick.
    data_requests: HashSet<String>,
    state: LoopState,
    ticks: u64,
}

impl<S: Simulator, Sc: Scenario<S>> StepLoop<S, Sc> {
    /// A loop publishing to a testbed that runs the applications itself.
    pub fn new(config: BridgeConfig, simulator: S, scenario: Sc, bus: Arc<dyn Bus>) -> Self {
        let registry = VehicleRegistry::new(
            config.node_pool_size,
            config.application.clone(),
            config.parameters.clone(),
        );
        Self {
            config,
            simulator,
            scenario,
            bus,
            gateway: None,
            registry,
            data_requests: HashSet::new(),
            state: LoopState::Init,
            ticks: 0,
        }
    }

    /// Run applications locally, one per vehicle, built by `factory`. Their
    /// API calls and packets travel over this loop's bus.
    pub fn with_applications(mut self, factory: Arc<dyn ApplicationFactory>) -> Self {
        let gateway = Arc::new(RpcGateway::new(self.bus.clone()));
        self.registry.set_launcher(Launcher {
            factory,
            gateway: gateway.clone(),
            bus: self.bus.clone(),
            call_timeout: self.config.rpc_timeout(),
            stop_timeout: self.config.stop_timeout(),
        });
        self.gateway = Some(gateway);
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn simulator(&self) -> &S {
        &self.simulator
    }

    pub fn registry(&self) -> &VehicleRegistry {
        &self.registry
    }

    /// Gateway used by local applications, if any.
    pub fn gateway(&self) -> Option<&Arc<RpcGateway>> {
        self.gateway.as_ref()
    }

    /// Run to completion. Teardown happens whatever the outcome.
    pub fn run(&mut self) -> Result<RunSummary, BridgeError> {
        if self.state != LoopState::Init {
            return Err(BridgeError::AlreadyRun);
        }
        let outcome = self.drive();
        let final_time = self.simulator.time();
        self.teardown(final_time);

        match outcome {
            Ok(reason) => {
                info!(ticks = self.ticks, final_time, %reason, "simulation finished");
                Ok(RunSummary {
                    ticks: self.ticks,
                    final_time,
                    reason,
                })
            }
            Err(err) => {
                error!(ticks = self.ticks, final_time, %err, "simulation aborted");
                Err(err)
            }
        }
    }

    fn drive(&mut self) -> Result<StopReason, BridgeError> {
        self.initialize()?;

        if !self.config.start_immediately {
            self.state = LoopState::WaitingForStart;
            info!(vehicles = self.registry.len(), "waiting for start signal");
            if let Some(reason) = self.wait_for_start()? {
                return Ok(reason);
            }
            self.registry.start_applications();
        }

        self.state = LoopState::Running;
        info!("simulation running");
        loop {
            if let Some(reason) = self.tick()? {
                return Ok(reason);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    fn initialize(&mut self) -> Result<(), BridgeError> {
        self.bus.subscribe(topic::COLOSSEUM_UPDATE)?;
        self.bus.subscribe(&topic::all_under(topic::API_CALL_PREFIX))?;
        if self.gateway.is_some() {
            self.bus
                .subscribe(&topic::all_under(topic::API_RESPONSE_PREFIX))?;
            self.bus
                .subscribe(&topic::all_under(topic::DIRECT_COMM_PREFIX))?;
        }

        if !self.config.start_immediately {
            self.registry.hold_applications();
        }
        self.scenario
            .configure_initial_vehicles(&mut self.simulator)?;

        let time = self.simulator.time();
        let mut batch = Batch::new();
        batch.push(Envelope::time(time));
        self.reconcile_into(&mut batch, time);
        self.report_vehicles(&mut batch, false);
        self.publish_batch(&batch);
        Ok(())
    }

    fn wait_for_start(&mut self) -> Result<Option<StopReason>, BridgeError> {
        let poll = self.config.poll_interval();
        loop {
            if let Some(gateway) = &self.gateway {
                gateway.expire(Instant::now());
            }
            let Some(msg) = self.bus.recv_timeout(poll) else {
                continue;
            };
            match self.handle_inbound(msg)? {
                Control::Start => return Ok(None),
                Control::Stop => return Ok(Some(StopReason::StopMessage)),
                Control::Continue => {}
            }
        }
    }

    /// Advance one step and exchange that step's traffic. Returns why the
    /// run should end, if it should.
    pub fn tick(&mut self) -> Result<Option<StopReason>, BridgeError> {
        let started = Instant::now();

        self.simulator.step()?;
        let step = self.ticks;
        self.ticks += 1;
        self.scenario.on_step(step, &mut self.simulator)?;

        let time = self.simulator.time();
        let mut batch = Batch::new();
        batch.push(Envelope::time(time));
        self.reconcile_into(&mut batch, time);
        self.report_vehicles(&mut batch, true);
        self.publish_batch(&batch);

        if let Some(gateway) = &self.gateway {
            gateway.expire(Instant::now());
        }
        let stop_requested = self.drain_inbound()?;

        if self.config.realtime {
            self.pace(started);
        }
        Ok(self.stop_reason(stop_requested, time))
    }

    fn stop_reason(&self, stop_requested: bool, time: SimTime) -> Option<StopReason> {
        if stop_requested {
            Some(StopReason::StopMessage)
        } else if time > self.config.max_time {
            Some(StopReason::TimeLimit)
        } else if self.config.stop_when_empty
            && self.registry.is_empty()
            && self.simulator.vehicle_ids().is_empty()
            && !self.simulator.has_pending_vehicles()
        {
            Some(StopReason::SimulationEmpty)
        } else {
            None
        }
    }

    fn teardown(&mut self, final_time: SimTime) {
        self.state = LoopState::Stopping;

        if let Some(gateway) = &self.gateway {
            let aborted = gateway.abort_all();
            if aborted > 0 {
                info!(aborted, "aborted pending API calls");
            }
        }

        let mut batch = Batch::new();
        batch.push(Envelope::time(final_time));
        for departure in self.registry.teardown_all() {
            batch.push(Envelope::DeleteVehicle(DeleteVehicle {
                sumo_id: departure.sumo_id,
                colosseum_id: departure.node_id,
            }));
        }
        self.publish_batch(&batch);
        self.data_requests.clear();

        self.simulator.close();
        self.bus.disconnect();
        self.state = LoopState::Terminated;
        debug!("teardown complete");
    }

    // -----------------------------------------------------------------------
    // Batch building
    // -----------------------------------------------------------------------

    fn reconcile_into(&mut self, batch: &mut Batch, time: SimTime) {
        let live = self.simulator.vehicle_ids();
        let removed = self.simulator.removed_vehicle_ids();
        let reused: Vec<String> = self
            .simulator
            .inserted_vehicle_ids()
            .into_iter()
            .filter(|id| removed.contains(id))
            .collect();

        let scenario = &self.scenario;
        let result = self
            .registry
            .reconcile(&live, &reused, time, |id| scenario.vehicle_parameters(id));

        for departure in result.departures {
            batch.push(Envelope::DeleteVehicle(DeleteVehicle {
                sumo_id: departure.sumo_id,
                colosseum_id: departure.node_id,
            }));
        }
        for arrival in result.arrivals {
            batch.push(Envelope::NewVehicle(NewVehicle {
                sumo_id: arrival.sumo_id,
                colosseum_id: arrival.node_id,
                application: self.registry.application().to_string(),
                parameters: arrival.parameters,
            }));
        }

        let registry = &self.registry;
        self.data_requests.retain(|id| registry.contains(id));
    }

    fn report_vehicles(&mut self, batch: &mut Batch, post_steps: bool) {
        let vehicles: Vec<(String, NodeId)> = self
            .registry
            .iter()
            .map(|r| (r.sumo_id.clone(), r.node_id))
            .collect();

        for (sumo_id, node_id) in vehicles {
            let Some(state) = self.simulator.kinematics(&sumo_id) else {
                warn!(%sumo_id, "no kinematics for registered vehicle");
                continue;
            };
            batch.push(Envelope::UpdatePosition(self.position_of(node_id, &state)));
            if self.data_requests.remove(&sumo_id) {
                batch.push(Envelope::VehicleData(state.to_vehicle_data(&sumo_id)));
            }
            if post_steps {
                self.registry.deliver_step(&sumo_id, state);
            }
        }
    }

    fn position_of(&self, node_id: NodeId, state: &Kinematics) -> PositionUpdate {
        if self.config.geo_coordinates
            && let Some(geo) = self.simulator.geo_position(state.x, state.y)
        {
            return PositionUpdate {
                colosseum_id: node_id,
                x: geo.x,
                y: geo.y,
                crs: Some(geo.crs),
            };
        }
        PositionUpdate {
            colosseum_id: node_id,
            x: state.x,
            y: state.y,
            crs: None,
        }
    }

    fn publish_batch(&self, batch: &Batch) {
        let payload = match batch.encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "cannot encode update");
                return;
            }
        };
        match self.bus.publish(topic::SUMO_UPDATE, payload) {
            Ok(()) => debug!(envelopes = batch.len(), "update published"),
            Err(err) => warn!(%err, "cannot publish update"),
        }
    }

    // -----------------------------------------------------------------------
    // Inbound traffic
    // -----------------------------------------------------------------------

    fn drain_inbound(&mut self) -> Result<bool, BridgeError> {
        let mut stop = false;
        for _ in 0..MAX_INBOUND_PER_TICK {
            let Some(msg) = self.bus.try_recv() else {
                break;
            };
            if let Control::Stop = self.handle_inbound(msg)? {
                stop = true;
            }
        }
        Ok(stop)
    }

    fn handle_inbound(&mut self, msg: InboundMessage) -> Result<Control, BridgeError> {
        let envelope = match message::decode(&msg.payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(topic = %msg.topic, %err, "dropping undecodable message");
                return Ok(Control::Continue);
            }
        };

        match envelope {
            Envelope::StartSimulation => {
                if self.state == LoopState::Running {
                    debug!("start signal while already running");
                }
                Ok(Control::Start)
            }
            Envelope::StopSimulation => {
                info!("stop signal received");
                Ok(Control::Stop)
            }
            Envelope::ApiCall(call) => {
                self.serve(&call)?;
                Ok(Control::Continue)
            }
            Envelope::ApiReturn(reply) => {
                self.accept_reply(reply);
                Ok(Control::Continue)
            }
            Envelope::VehicleData(data) if data.is_packet() => {
                self.relay(&msg.topic, data);
                Ok(Control::Continue)
            }
            Envelope::VehicleData(data) => {
                debug!(sumo_id = %data.sumo_id, "vehicle data requested");
                self.data_requests.insert(data.sumo_id);
                Ok(Control::Continue)
            }
            other => {
                debug!(kind = %other.kind(), topic = %msg.topic, "ignoring inbound message");
                Ok(Control::Continue)
            }
        }
    }

    fn serve(&mut self, call: &ApiCall) -> Result<(), BridgeError> {
        let reply = rpc::serve_api_call(&mut self.simulator, call)?;
        debug!(
            sumo_id = %call.sumo_id,
            api_code = %call.api_code,
            transaction_id = %call.transaction_id,
            "served API call"
        );
        if let Err(err) = self
            .bus
            .publish_envelope(&topic::api_response(&call.sumo_id), &Envelope::ApiReturn(reply))
        {
            warn!(sumo_id = %call.sumo_id, %err, "cannot publish API reply");
        }
        Ok(())
    }

    fn accept_reply(&mut self, reply: ApiReturn) {
        let Some(gateway) = &self.gateway else {
            return;
        };
        if gateway.resolve(&reply) == Resolution::Resolved {
            self.registry
                .deliver_api_return(&reply.sumo_id, reply.transaction_id, reply.response);
        }
    }

    fn relay(&mut self, topic_name: &str, packet: VehicleData) {
        let recipient = packet.recipient.clone().or_else(|| {
            topic::vehicle_suffix(topic_name, topic::DIRECT_COMM_PREFIX).map(str::to_string)
        });
        let Some(recipient) = recipient else {
            warn!(topic = topic_name, "packet without recipient");
            return;
        };
        if !self.registry.deliver_packet(&recipient, packet) {
            debug!(%recipient, "no application to receive packet");
        }
    }

    fn pace(&self, started: Instant) {
        let step = Duration::try_from_secs_f64(self.simulator.step_length()).unwrap_or_default();
        if let Some(rest) = step.checked_sub(started.elapsed()) {
            thread::sleep(rest);
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{MemoryBroker, MemoryBus};
    use crate::id::TransactionId;
    use crate::simulator::EmptyScenario;
    use crate::test_utils::{ScriptedSimulator, update_batches};

    fn config(pool: u32, max_time: f64) -> BridgeConfig {
        BridgeConfig {
            node_pool_size: pool,
            max_time,
            start_immediately: true,
            application: "app".into(),
            ..BridgeConfig::default()
        }
    }

    fn observer(broker: &MemoryBroker) -> MemoryBus {
        let bus = broker.connect();
        bus.subscribe(topic::SUMO_UPDATE).unwrap();
        bus
    }

    fn new_vehicles(batch: &[Envelope]) -> Vec<(String, NodeId)> {
        batch
            .iter()
            .filter_map(|e| match e {
                Envelope::NewVehicle(v) => Some((v.sumo_id.clone(), v.colosseum_id)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn each_batch_starts_with_time() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let mut sim = ScriptedSimulator::new(0.5);
        sim.insert_now("a");
        let mut lp = StepLoop::new(config(4, 2.0), sim, EmptyScenario, Arc::new(broker.connect()));

        let summary = lp.run().unwrap();
        assert_eq!(summary.reason, StopReason::TimeLimit);
        assert_eq!(summary.ticks, 5);
        assert_eq!(lp.state(), LoopState::Terminated);

        let batches = update_batches(&watch);
        // initial + 5 ticks + final
        assert_eq!(batches.len(), 7);
        let times: Vec<f64> = batches
            .iter()
            .map(|b| match &b[0] {
                Envelope::Time(t) => t.time,
                other => panic!("batch starts with {other:?}"),
            })
            .collect();
        assert_eq!(times, vec![0.0, 0.5, 1.0, 1.5, 2.0, 2.5, 2.5]);
    }

    #[test]
    fn initial_batch_announces_vehicles_then_positions() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let mut sim = ScriptedSimulator::new(0.1);
        sim.insert_now("a");
        sim.insert_now("b");
        let mut lp = StepLoop::new(config(4, 0.0), sim, EmptyScenario, Arc::new(broker.connect()));
        lp.run().unwrap();

        let first = &update_batches(&watch)[0];
        let kinds: Vec<_> = first.iter().map(Envelope::kind).collect();
        use message::MessageType::*;
        assert_eq!(
            kinds,
            vec![Time, NewVehicle, NewVehicle, UpdatePosition, UpdatePosition]
        );
    }

    #[test]
    fn pool_exhaustion_skips_vehicle() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_at(1, "a");
        sim.insert_at(1, "b");
        sim.insert_at(2, "c");
        let mut lp = StepLoop::new(config(2, 2.5), sim, EmptyScenario, Arc::new(broker.connect()));
        lp.run().unwrap();

        let batches = update_batches(&watch);
        assert_eq!(
            new_vehicles(&batches[1]),
            vec![("a".to_string(), NodeId(0)), ("b".to_string(), NodeId(1))]
        );
        let announced: Vec<String> = batches
            .iter()
            .flat_map(|b| new_vehicles(b))
            .map(|(id, _)| id)
            .collect();
        assert!(!announced.contains(&"c".to_string()));
    }

    #[test]
    fn departures_precede_arrivals_in_a_tick() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        sim.remove_at(1, "a");
        sim.insert_at(1, "b");
        let mut lp = StepLoop::new(config(1, 1.0), sim, EmptyScenario, Arc::new(broker.connect()));
        lp.run().unwrap();

        let tick = &update_batches(&watch)[1];
        let kinds: Vec<_> = tick.iter().map(Envelope::kind).collect();
        use message::MessageType::*;
        assert_eq!(kinds, vec![Time, DeleteVehicle, NewVehicle, UpdatePosition]);
        assert_eq!(new_vehicles(tick), vec![("b".to_string(), NodeId(0))]);
    }

    #[test]
    fn final_batch_deletes_remaining_vehicles() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        sim.insert_now("b");
        let mut lp = StepLoop::new(config(4, 0.5), sim, EmptyScenario, Arc::new(broker.connect()));
        lp.run().unwrap();

        let batches = update_batches(&watch);
        let last = batches.last().unwrap();
        let deleted: Vec<NodeId> = last
            .iter()
            .filter_map(|e| match e {
                Envelope::DeleteVehicle(d) => Some(d.colosseum_id),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec![NodeId(0), NodeId(1)]);
        assert!(lp.simulator().is_closed());
        assert!(lp.registry().is_empty());
    }

    #[test]
    fn waits_for_start_signal() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let control = broker.connect();
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        let cfg = BridgeConfig {
            start_immediately: false,
            poll_interval_ms: 5,
            ..config(4, 0.5)
        };
        let bus = Arc::new(broker.connect());
        let handle = std::thread::spawn(move || {
            let mut lp = StepLoop::new(cfg, sim, EmptyScenario, bus);
            lp.run()
        });

        // The initial batch goes out before the loop blocks.
        let first = watch.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(message::decode_batch(&first.payload).is_ok());
        control
            .publish_envelope(topic::COLOSSEUM_UPDATE, &Envelope::StartSimulation)
            .unwrap();

        let summary = handle.join().unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::TimeLimit);
        assert_eq!(summary.ticks, 1);
    }

    #[test]
    fn local_applications_start_with_the_start_signal() {
        use crate::test_utils::{AppEvent, RecordingFactory};

        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let control = broker.connect();
        let factory = Arc::new(RecordingFactory::new());
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        let cfg = BridgeConfig {
            start_immediately: false,
            poll_interval_ms: 5,
            ..config(4, 0.5)
        };
        let bus = Arc::new(broker.connect());
        let handle = {
            let factory = factory.clone();
            std::thread::spawn(move || {
                let mut lp =
                    StepLoop::new(cfg, sim, EmptyScenario, bus).with_applications(factory);
                lp.run()
            })
        };

        watch.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert!(factory.log_of("a").is_none(), "started before the signal");
        control
            .publish_envelope(topic::COLOSSEUM_UPDATE, &Envelope::StartSimulation)
            .unwrap();

        handle.join().unwrap().unwrap();
        let log = factory.log_of("a").unwrap();
        assert_eq!(log.first(), Some(&AppEvent::Start));
        assert_eq!(log.last(), Some(&AppEvent::Stop));
    }

    #[test]
    fn stop_while_waiting_ends_without_ticks() {
        let broker = MemoryBroker::new();
        let control = broker.connect();
        let cfg = BridgeConfig {
            start_immediately: false,
            poll_interval_ms: 5,
            ..config(4, 10.0)
        };
        let mut lp = StepLoop::new(
            cfg,
            ScriptedSimulator::new(1.0),
            EmptyScenario,
            Arc::new(broker.connect()),
        );
        // The loop subscribes during init, so publish a little later.
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            control
                .publish_envelope(topic::COLOSSEUM_UPDATE, &Envelope::StopSimulation)
                .unwrap();
        });
        let summary = lp.run().unwrap();
        handle.join().unwrap();
        assert_eq!(summary.reason, StopReason::StopMessage);
        assert_eq!(summary.ticks, 0);
    }

    #[test]
    fn stop_message_ends_running_loop() {
        let broker = MemoryBroker::new();
        let control = broker.connect();
        let mut lp = StepLoop::new(
            config(4, 1000.0),
            ScriptedSimulator::new(1.0),
            EmptyScenario,
            Arc::new(broker.connect()),
        );
        lp.initialize().unwrap();
        lp.state = LoopState::Running;
        assert_eq!(lp.tick().unwrap(), None);
        control
            .publish_envelope(topic::COLOSSEUM_UPDATE, &Envelope::StopSimulation)
            .unwrap();
        assert_eq!(lp.tick().unwrap(), Some(StopReason::StopMessage));
    }

    #[test]
    fn serves_api_calls_on_response_topic() {
        let broker = MemoryBroker::new();
        let app = broker.connect();
        app.subscribe("apiresponse/a").unwrap();
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        sim.set_api_response("getSpeed", "12.5");
        let mut lp = StepLoop::new(config(4, 100.0), sim, EmptyScenario, Arc::new(broker.connect()));
        lp.initialize().unwrap();
        lp.state = LoopState::Running;

        let call = ApiCall {
            sumo_id: "a".into(),
            api_code: "getSpeed".into(),
            transaction_id: TransactionId(9),
            parameters: "{}".into(),
        };
        app.publish_envelope(&topic::api_call("a"), &Envelope::ApiCall(call))
            .unwrap();
        lp.tick().unwrap();

        let reply = app.try_recv().unwrap();
        match message::decode(&reply.payload).unwrap() {
            Envelope::ApiReturn(r) => {
                assert_eq!(r.transaction_id, TransactionId(9));
                assert_eq!(r.response, "12.5");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(lp.simulator().api_calls().len(), 1);
    }

    #[test]
    fn data_request_answered_next_tick() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let control = broker.connect();
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        let mut lp = StepLoop::new(config(4, 100.0), sim, EmptyScenario, Arc::new(broker.connect()));
        lp.initialize().unwrap();
        lp.state = LoopState::Running;

        let request = crate::test_utils::kinematics_at(0.0, 0.0).to_vehicle_data("a");
        control
            .publish_envelope(topic::COLOSSEUM_UPDATE, &Envelope::VehicleData(request))
            .unwrap();
        lp.tick().unwrap();
        lp.tick().unwrap();
        lp.tick().unwrap();

        let batches = update_batches(&watch);
        let data_counts: Vec<usize> = batches
            .iter()
            .map(|b| {
                b.iter()
                    .filter(|e| matches!(e, Envelope::VehicleData(_)))
                    .count()
            })
            .collect();
        // initial, tick 1 (request drained after publish), tick 2, tick 3
        assert_eq!(data_counts, vec![0, 0, 1, 0]);
    }

    #[test]
    fn undecodable_inbound_is_dropped() {
        let broker = MemoryBroker::new();
        let control = broker.connect();
        let mut lp = StepLoop::new(
            config(4, 100.0),
            ScriptedSimulator::new(1.0),
            EmptyScenario,
            Arc::new(broker.connect()),
        );
        lp.initialize().unwrap();
        lp.state = LoopState::Running;
        control
            .publish(topic::COLOSSEUM_UPDATE, b"{not json".to_vec())
            .unwrap();
        assert_eq!(lp.tick().unwrap(), None);
    }

    #[test]
    fn simulator_fault_still_tears_down() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        sim.fail_at_step(2);
        let mut lp = StepLoop::new(config(4, 100.0), sim, EmptyScenario, Arc::new(broker.connect()));

        let err = lp.run().unwrap_err();
        assert!(matches!(err, BridgeError::Simulator(_)));
        assert_eq!(lp.state(), LoopState::Terminated);
        assert!(lp.simulator().is_closed());

        let last = update_batches(&watch).pop().unwrap();
        assert!(
            last.iter()
                .any(|e| matches!(e, Envelope::DeleteVehicle(d) if d.sumo_id == "a"))
        );
    }

    #[test]
    fn stops_when_empty() {
        let broker = MemoryBroker::new();
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        sim.remove_at(3, "a");
        let cfg = BridgeConfig {
            stop_when_empty: true,
            ..config(4, 100.0)
        };
        let mut lp = StepLoop::new(cfg, sim, EmptyScenario, Arc::new(broker.connect()));
        let summary = lp.run().unwrap();
        assert_eq!(summary.reason, StopReason::SimulationEmpty);
        assert_eq!(summary.ticks, 3);
    }

    #[test]
    fn geo_positions_carry_crs() {
        let broker = MemoryBroker::new();
        let watch = observer(&broker);
        let mut sim = ScriptedSimulator::new(1.0);
        sim.insert_now("a");
        sim.set_geo_reference("EPSG:32632");
        let cfg = BridgeConfig {
            geo_coordinates: true,
            ..config(4, 0.0)
        };
        let mut lp = StepLoop::new(cfg, sim, EmptyScenario, Arc::new(broker.connect()));
        lp.run().unwrap();

        let first = &update_batches(&watch)[0];
        let crs = first.iter().find_map(|e| match e {
            Envelope::UpdatePosition(p) => p.crs.clone(),
            _ => None,
        });
        assert_eq!(crs.as_deref(), Some("EPSG:32632"));
    }

    #[test]
    fn cannot_run_twice() {
        let broker = MemoryBroker::new();
        let mut lp = StepLoop::new(
            config(1, 0.0),
            ScriptedSimulator::new(1.0),
            EmptyScenario,
            Arc::new(broker.connect()),
        );
        lp.run().unwrap();
        assert!(matches!(lp.run(), Err(BridgeError::AlreadyRun)));
    }
}
