//! Shared test helpers for integration tests and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available in unit tests, integration tests, and benchmarks (via the
//! `test-utils` feature).

use crate::application::{Application, ApplicationFactory, ApplicationFault, NodeContext, NodeInfo};
use crate::bus::{Bus, MemoryBus};
use crate::id::{SimTime, TransactionId};
use crate::message::{self, Envelope, VehicleData};
use crate::simulator::{ApiError, GeoPosition, Kinematics, Simulator, SimulatorFault};
use crate::topic;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// ===========================================================================
// Small constructors
// ===========================================================================

/// Owned ids from string literals.
pub fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// A vehicle cruising at 10 m/s, at `x` and time `time`.
pub fn kinematics_at(time: SimTime, x: f64) -> Kinematics {
    Kinematics {
        x,
        y: 0.0,
        speed: 10.0,
        acceleration: 0.0,
        controller_acceleration: 0.0,
        time,
    }
}

/// Decode every update batch queued on `bus`, in arrival order. The bus
/// must be subscribed to `sumo/update`.
pub fn update_batches(bus: &MemoryBus) -> Vec<Vec<Envelope>> {
    bus.drain()
        .into_iter()
        .filter(|m| m.topic == topic::SUMO_UPDATE)
        .map(|m| message::decode_batch(&m.payload).expect("valid update batch"))
        .collect()
}

// ===========================================================================
// ScriptedSimulator
// ===========================================================================

#[derive(Debug, Clone)]
enum ScriptAction {
    Insert(String),
    Remove(String),
    Reinsert(String),
}

/// A deterministic simulator driven by a script of insertions and removals.
///
/// Time after step `n` is `n * step_length`. Every vehicle cruises at
/// 10 m/s from an offset given by its insertion order. API calls are
/// answered from a table keyed by API code.
#[derive(Debug)]
pub struct ScriptedSimulator {
    step_length: f64,
    steps: u64,
    live: Vec<String>,
    offsets: HashMap<String, f64>,
    inserted: Vec<String>,
    removed: Vec<String>,
    script: BTreeMap<u64, Vec<ScriptAction>>,
    api_responses: HashMap<String, String>,
    api_fault: Option<String>,
    api_calls: Vec<(String, String, String)>,
    fault_at: Option<u64>,
    geo_crs: Option<String>,
    closed: bool,
    next_offset: f64,
}

impl ScriptedSimulator {
    pub fn new(step_length: f64) -> Self {
        Self {
            step_length,
            steps: 0,
            live: Vec::new(),
            offsets: HashMap::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
            script: BTreeMap::new(),
            api_responses: HashMap::new(),
            api_fault: None,
            api_calls: Vec::new(),
            fault_at: None,
            geo_crs: None,
            closed: false,
            next_offset: 0.0,
        }
    }

    /// Insert a vehicle before the first step.
    pub fn insert_now(&mut self, sumo_id: &str) {
        self.apply(ScriptAction::Insert(sumo_id.to_string()));
    }

    /// Insert a vehicle during step `step` (1-based).
    pub fn insert_at(&mut self, step: u64, sumo_id: &str) {
        self.schedule(step, ScriptAction::Insert(sumo_id.to_string()));
    }

    /// Remove a vehicle during step `step`.
    pub fn remove_at(&mut self, step: u64, sumo_id: &str) {
        self.schedule(step, ScriptAction::Remove(sumo_id.to_string()));
    }

    /// Remove and re-insert a vehicle under the same id during `step`.
    pub fn reinsert_at(&mut self, step: u64, sumo_id: &str) {
        self.schedule(step, ScriptAction::Reinsert(sumo_id.to_string()));
    }

    /// Answer `api_code` with `response`.
    pub fn set_api_response(&mut self, api_code: &str, response: &str) {
        self.api_responses
            .insert(api_code.to_string(), response.to_string());
    }

    /// Every API call fails with a simulator fault.
    pub fn fail_api_with_fault(&mut self, reason: &str) {
        self.api_fault = Some(reason.to_string());
    }

    /// Step number `step` fails with a simulator fault.
    pub fn fail_at_step(&mut self, step: u64) {
        self.fault_at = Some(step);
    }

    /// Report geo positions offset from the plain ones, tagged with `crs`.
    pub fn set_geo_reference(&mut self, crs: &str) {
        self.geo_crs = Some(crs.to_string());
    }

    /// Calls served so far as `(sumo_id, api_code, parameters)`.
    pub fn api_calls(&self) -> &[(String, String, String)] {
        &self.api_calls
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn schedule(&mut self, step: u64, action: ScriptAction) {
        self.script.entry(step).or_default().push(action);
    }

    fn apply(&mut self, action: ScriptAction) {
        match action {
            ScriptAction::Insert(id) => {
                if !self.live.contains(&id) {
                    self.offsets.insert(id.clone(), self.next_offset);
                    self.next_offset -= 10.0;
                    self.live.push(id.clone());
                    self.inserted.push(id);
                }
            }
            ScriptAction::Remove(id) => {
                if let Some(pos) = self.live.iter().position(|v| *v == id) {
                    self.live.remove(pos);
                    self.removed.push(id);
                }
            }
            ScriptAction::Reinsert(id) => {
                self.apply(ScriptAction::Remove(id.clone()));
                self.apply(ScriptAction::Insert(id));
            }
        }
    }
}

impl Simulator for ScriptedSimulator {
    fn step(&mut self) -> Result<(), SimulatorFault> {
        if self.fault_at == Some(self.steps + 1) {
            return Err(SimulatorFault(format!("scripted fault at step {}", self.steps + 1)));
        }
        self.steps += 1;
        self.inserted.clear();
        self.removed.clear();
        for action in self.script.remove(&self.steps).unwrap_or_default() {
            self.apply(action);
        }
        Ok(())
    }

    fn time(&self) -> SimTime {
        self.steps as f64 * self.step_length
    }

    fn step_length(&self) -> f64 {
        self.step_length
    }

    fn vehicle_ids(&self) -> Vec<String> {
        self.live.clone()
    }

    fn inserted_vehicle_ids(&self) -> Vec<String> {
        self.inserted.clone()
    }

    fn removed_vehicle_ids(&self) -> Vec<String> {
        self.removed.clone()
    }

    fn has_pending_vehicles(&self) -> bool {
        self.script.values().flatten().any(|a| {
            matches!(a, ScriptAction::Insert(_) | ScriptAction::Reinsert(_))
        })
    }

    fn kinematics(&self, sumo_id: &str) -> Option<Kinematics> {
        if !self.live.iter().any(|v| v == sumo_id) {
            return None;
        }
        let offset = self.offsets.get(sumo_id).copied().unwrap_or(0.0);
        let time = self.time();
        Some(kinematics_at(time, offset + 10.0 * time))
    }

    fn geo_position(&self, x: f64, y: f64) -> Option<GeoPosition> {
        self.geo_crs.as_ref().map(|crs| GeoPosition {
            x: x + 500_000.0,
            y: y + 5_000_000.0,
            crs: crs.clone(),
        })
    }

    fn invoke_api(
        &mut self,
        sumo_id: &str,
        api_code: &str,
        parameters: &str,
    ) -> Result<String, ApiError> {
        self.api_calls.push((
            sumo_id.to_string(),
            api_code.to_string(),
            parameters.to_string(),
        ));
        if let Some(reason) = &self.api_fault {
            return Err(SimulatorFault(reason.clone()).into());
        }
        self.api_responses
            .get(api_code)
            .cloned()
            .ok_or_else(|| ApiError::Rejected(format!("unknown API code {api_code}")))
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

// ===========================================================================
// RecordingApplication
// ===========================================================================

/// One hook invocation seen by a [`RecordingApplication`].
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Start,
    Step(SimTime),
    Receive(VehicleData),
    ApiReturn(TransactionId, String),
    Stop,
}

/// Shared log of hook invocations.
pub type EventLog = Arc<Mutex<Vec<AppEvent>>>;

/// An application that records every hook it sees.
#[derive(Debug)]
pub struct RecordingApplication {
    log: EventLog,
}

impl RecordingApplication {
    /// The application and a handle to its log.
    pub fn new() -> (Self, EventLog) {
        let log = EventLog::default();
        (Self { log: log.clone() }, log)
    }
}

impl Application for RecordingApplication {
    fn on_start(&mut self, _ctx: &NodeContext) -> Result<(), ApplicationFault> {
        self.log.lock().push(AppEvent::Start);
        Ok(())
    }

    fn on_step(&mut self, _ctx: &NodeContext, state: &Kinematics) -> Result<(), ApplicationFault> {
        self.log.lock().push(AppEvent::Step(state.time));
        Ok(())
    }

    fn on_receive(
        &mut self,
        _ctx: &NodeContext,
        packet: &VehicleData,
    ) -> Result<(), ApplicationFault> {
        self.log.lock().push(AppEvent::Receive(packet.clone()));
        Ok(())
    }

    fn on_api_return(
        &mut self,
        _ctx: &NodeContext,
        transaction_id: TransactionId,
        response: &str,
    ) -> Result<(), ApplicationFault> {
        self.log
            .lock()
            .push(AppEvent::ApiReturn(transaction_id, response.to_string()));
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &NodeContext) -> Result<(), ApplicationFault> {
        self.log.lock().push(AppEvent::Stop);
        Ok(())
    }
}

/// Builds [`RecordingApplication`]s and keeps each vehicle's log.
#[derive(Debug, Default)]
pub struct RecordingFactory {
    logs: Mutex<BTreeMap<String, EventLog>>,
}

impl RecordingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Log of the most recent application built for `sumo_id`.
    pub fn log_of(&self, sumo_id: &str) -> Option<Vec<AppEvent>> {
        self.logs.lock().get(sumo_id).map(|log| log.lock().clone())
    }

    /// Vehicles an application was built for, sorted.
    pub fn vehicles(&self) -> Vec<String> {
        self.logs.lock().keys().cloned().collect()
    }
}

impl ApplicationFactory for RecordingFactory {
    fn name(&self) -> &str {
        "recording"
    }

    fn create(&self, info: &NodeInfo) -> Result<Box<dyn Application>, ApplicationFault> {
        let (app, log) = RecordingApplication::new();
        self.logs.lock().insert(info.sumo_id.clone(), log);
        Ok(Box::new(app))
    }
}

// ===========================================================================
// Bus helpers
// ===========================================================================

/// Publish a control envelope on the testbed's update topic.
pub fn send_control(bus: &dyn Bus, envelope: &Envelope) {
    bus.publish_envelope(topic::COLOSSEUM_UPDATE, envelope)
        .expect("control message published");
}
