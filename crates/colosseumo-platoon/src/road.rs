//! A single-lane road simulator for platooning experiments.
//!
//! [`PlatoonSimulator`] is a deterministic longitudinal model: every vehicle
//! sits on one lane, is driven by one of the controllers in
//! [`crate::controller`], and leaves the simulation once its rear passes the
//! end of the road. Vehicles are inserted immediately or scheduled for a
//! departure time.
//!
//! Each step computes every controller input from the state at the start of
//! the step, then advances all vehicles together.

use crate::api;
use crate::controller::{
    self, ActiveController, ControllerParams, PeerState, RadarReading,
};
use colosseumo_core::id::SimTime;
use colosseumo_core::simulator::{ApiError, GeoPosition, Kinematics, Simulator, SimulatorFault};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Road geometry and stepping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoadConfig {
    /// Seconds per step.
    pub step_length: f64,
    /// Road length in metres.
    pub length: f64,
    /// Lateral coordinate of the lane centre.
    pub lane_y: f64,
    pub controller: ControllerParams,
}

impl Default for RoadConfig {
    fn default() -> Self {
        Self {
            step_length: 0.1,
            length: 10_000.0,
            lane_y: -1.6,
            controller: ControllerParams::default(),
        }
    }
}

/// Maps road coordinates into a projected reference system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoReference {
    pub offset_x: f64,
    pub offset_y: f64,
    pub crs: String,
}

/// A vehicle to insert.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleSpec {
    pub id: String,
    /// Front bumper position in metres.
    pub position: f64,
    pub speed: f64,
    pub length: f64,
    pub controller: ActiveController,
    pub desired_speed: f64,
}

impl VehicleSpec {
    pub fn new(id: impl Into<String>, position: f64, speed: f64) -> Self {
        Self {
            id: id.into(),
            position,
            speed,
            length: 4.0,
            controller: ActiveController::Driver,
            desired_speed: speed,
        }
    }

    pub fn with_length(mut self, length: f64) -> Self {
        self.length = length;
        self
    }

    pub fn with_controller(mut self, controller: ActiveController) -> Self {
        self.controller = controller;
        self
    }

    pub fn with_desired_speed(mut self, speed: f64) -> Self {
        self.desired_speed = speed;
        self
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoadError {
    #[error("vehicle {0} already exists")]
    DuplicateVehicle(String),
    #[error("no vehicle {0}")]
    UnknownVehicle(String),
    #[error("simulator is closed")]
    Closed,
}

// ---------------------------------------------------------------------------
// Vehicle state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Vehicle {
    id: String,
    length: f64,
    x: f64,
    speed: f64,
    acceleration: f64,
    /// Controller output of the last step, before actuation lag.
    u: f64,
    controller: ActiveController,
    desired_speed: f64,
    leader_data: Option<PeerState>,
    preceding_data: Option<PeerState>,
    /// `(leader, preceding)` read straight from the simulation every step.
    auto_feed: Option<(String, String)>,
}

impl Vehicle {
    fn from_spec(spec: VehicleSpec) -> Self {
        Self {
            id: spec.id,
            length: spec.length,
            x: spec.position,
            speed: spec.speed,
            acceleration: 0.0,
            u: 0.0,
            controller: spec.controller,
            desired_speed: spec.desired_speed,
            leader_data: None,
            preceding_data: None,
            auto_feed: None,
        }
    }

    fn peer_state(&self) -> PeerState {
        PeerState {
            speed: self.speed,
            acceleration: self.acceleration,
        }
    }
}

// ---------------------------------------------------------------------------
// PlatoonSimulator
// ---------------------------------------------------------------------------

/// Deterministic single-lane simulator implementing [`Simulator`].
#[derive(Debug)]
pub struct PlatoonSimulator {
    config: RoadConfig,
    steps: u64,
    /// Live vehicles in insertion order.
    vehicles: Vec<Vehicle>,
    /// Pending departures, ordered by time.
    scheduled: Vec<(SimTime, VehicleSpec)>,
    inserted: Vec<String>,
    removed: Vec<String>,
    geo: Option<GeoReference>,
    closed: bool,
}

impl PlatoonSimulator {
    pub fn new(config: RoadConfig) -> Self {
        Self {
            config,
            steps: 0,
            vehicles: Vec::new(),
            scheduled: Vec::new(),
            inserted: Vec::new(),
            removed: Vec::new(),
            geo: None,
            closed: false,
        }
    }

    pub fn with_geo_reference(mut self, geo: GeoReference) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn config(&self) -> &RoadConfig {
        &self.config
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Insert a vehicle now. It shows up in the next id listing.
    pub fn add_vehicle(&mut self, spec: VehicleSpec) -> Result<(), RoadError> {
        if self.closed {
            return Err(RoadError::Closed);
        }
        if self.index_of(&spec.id).is_some() {
            return Err(RoadError::DuplicateVehicle(spec.id));
        }
        debug!(vehicle = %spec.id, x = spec.position, "vehicle inserted");
        self.inserted.push(spec.id.clone());
        self.vehicles.push(Vehicle::from_spec(spec));
        Ok(())
    }

    /// Insert a vehicle during the first step whose time reaches `depart`.
    pub fn schedule_vehicle(&mut self, depart: SimTime, spec: VehicleSpec) {
        let at = self.scheduled.partition_point(|(t, _)| *t <= depart);
        self.scheduled.insert(at, (depart, spec));
    }

    pub fn remove_vehicle(&mut self, id: &str) -> Result<(), RoadError> {
        let index = self.require(id)?;
        let vehicle = self.vehicles.remove(index);
        self.removed.push(vehicle.id);
        Ok(())
    }

    /// Feed `id`'s CACC from the true state of `leader` and `preceding`
    /// every step, instead of waiting for communicated data.
    pub fn enable_auto_feed(
        &mut self,
        id: &str,
        leader: &str,
        preceding: &str,
    ) -> Result<(), RoadError> {
        let index = self.require(id)?;
        self.vehicles[index].auto_feed = Some((leader.to_string(), preceding.to_string()));
        Ok(())
    }

    pub fn set_active_controller(
        &mut self,
        id: &str,
        controller: ActiveController,
    ) -> Result<(), RoadError> {
        let index = self.require(id)?;
        self.vehicles[index].controller = controller;
        Ok(())
    }

    pub fn active_controller(&self, id: &str) -> Option<ActiveController> {
        self.index_of(id).map(|i| self.vehicles[i].controller)
    }

    pub fn set_desired_speed(&mut self, id: &str, speed: f64) -> Result<(), RoadError> {
        let index = self.require(id)?;
        self.vehicles[index].desired_speed = speed;
        Ok(())
    }

    pub fn desired_speed(&self, id: &str) -> Option<f64> {
        self.index_of(id).map(|i| self.vehicles[i].desired_speed)
    }

    pub fn set_leader_data(&mut self, id: &str, data: PeerState) -> Result<(), RoadError> {
        let index = self.require(id)?;
        self.vehicles[index].leader_data = Some(data);
        Ok(())
    }

    pub fn set_preceding_data(&mut self, id: &str, data: PeerState) -> Result<(), RoadError> {
        let index = self.require(id)?;
        self.vehicles[index].preceding_data = Some(data);
        Ok(())
    }

    /// Communicated `(leader, preceding)` data last fed to `id`.
    pub fn fed_data(&self, id: &str) -> Option<(Option<PeerState>, Option<PeerState>)> {
        self.index_of(id).map(|i| {
            let v = &self.vehicles[i];
            (v.leader_data, v.preceding_data)
        })
    }

    /// Bumper-to-bumper distance from `id` to the vehicle ahead of it.
    pub fn gap_ahead(&self, id: &str) -> Option<f64> {
        self.index_of(id)
            .and_then(|i| self.radar(i))
            .map(|r| r.gap)
    }

    fn index_of(&self, id: &str) -> Option<usize> {
        self.vehicles.iter().position(|v| v.id == id)
    }

    fn require(&self, id: &str) -> Result<usize, RoadError> {
        self.index_of(id)
            .ok_or_else(|| RoadError::UnknownVehicle(id.to_string()))
    }

    /// The closest vehicle strictly ahead of vehicle `index`.
    fn radar(&self, index: usize) -> Option<RadarReading> {
        let me = &self.vehicles[index];
        self.vehicles
            .iter()
            .enumerate()
            .filter(|(j, other)| *j != index && other.x > me.x)
            .min_by(|(_, a), (_, b)| a.x.total_cmp(&b.x))
            .map(|(_, front)| RadarReading {
                gap: front.x - front.length - me.x,
                speed: front.speed,
            })
    }

    fn refresh_auto_feed(&mut self) {
        let states: HashMap<String, PeerState> = self
            .vehicles
            .iter()
            .map(|v| (v.id.clone(), v.peer_state()))
            .collect();
        for v in &mut self.vehicles {
            if let Some((leader, preceding)) = &v.auto_feed {
                if let Some(state) = states.get(leader) {
                    v.leader_data = Some(*state);
                }
                if let Some(state) = states.get(preceding) {
                    v.preceding_data = Some(*state);
                }
            }
        }
    }

    fn control_input(&self, index: usize) -> f64 {
        let params = &self.config.controller;
        let v = &self.vehicles[index];
        let radar = self.radar(index);
        match v.controller {
            ActiveController::Driver => controller::cruise(params, v.speed, v.desired_speed),
            ActiveController::Acc => controller::acc(params, v.speed, v.desired_speed, radar),
            ActiveController::Cacc => {
                // Without communicated data, fall back to the radar's view of
                // the vehicle ahead and assume steady peers.
                let measured = radar.map(|r| PeerState {
                    speed: r.speed,
                    acceleration: 0.0,
                });
                let preceding = v.preceding_data.or(measured);
                let leader = v.leader_data.or(preceding);
                match (leader, preceding) {
                    (Some(leader), Some(preceding)) => controller::cacc(
                        params,
                        v.speed,
                        v.desired_speed,
                        radar,
                        leader,
                        preceding,
                    ),
                    _ => controller::cruise(params, v.speed, v.desired_speed),
                }
            }
        }
    }

    fn advance_vehicles(&mut self) {
        let dt = self.config.step_length;
        let inputs: Vec<f64> = (0..self.vehicles.len())
            .map(|i| self.control_input(i))
            .collect();
        let params = &self.config.controller;
        for (v, u) in self.vehicles.iter_mut().zip(inputs) {
            v.u = u;
            v.acceleration = controller::actuate(params, u, v.acceleration, dt);
            v.speed += v.acceleration * dt;
            if v.speed <= 0.0 {
                v.speed = 0.0;
                v.acceleration = v.acceleration.max(0.0);
            }
            v.x += v.speed * dt;
        }
    }

    fn retire_finished(&mut self) {
        let end = self.config.length;
        let (gone, stay): (Vec<Vehicle>, Vec<Vehicle>) = std::mem::take(&mut self.vehicles)
            .into_iter()
            .partition(|v| v.x - v.length > end);
        self.vehicles = stay;
        for v in gone {
            info!(vehicle = %v.id, "vehicle reached the end of the road");
            self.removed.push(v.id);
        }
    }

    fn depart_scheduled(&mut self) {
        let now = self.time();
        let due = self.scheduled.partition_point(|(t, _)| *t <= now);
        for (_, spec) in self.scheduled.drain(..due).collect::<Vec<_>>() {
            if let Err(err) = self.add_vehicle(spec) {
                debug!(%err, "scheduled departure dropped");
            }
        }
    }
}

impl Simulator for PlatoonSimulator {
    fn step(&mut self) -> Result<(), SimulatorFault> {
        if self.closed {
            return Err(SimulatorFault(RoadError::Closed.to_string()));
        }
        self.inserted.clear();
        self.removed.clear();
        self.refresh_auto_feed();
        self.advance_vehicles();
        self.steps += 1;
        self.retire_finished();
        self.depart_scheduled();
        Ok(())
    }

    fn time(&self) -> SimTime {
        self.steps as f64 * self.config.step_length
    }

    fn step_length(&self) -> f64 {
        self.config.step_length
    }

    fn vehicle_ids(&self) -> Vec<String> {
        self.vehicles.iter().map(|v| v.id.clone()).collect()
    }

    fn inserted_vehicle_ids(&self) -> Vec<String> {
        self.inserted.clone()
    }

    fn removed_vehicle_ids(&self) -> Vec<String> {
        self.removed.clone()
    }

    fn has_pending_vehicles(&self) -> bool {
        !self.scheduled.is_empty()
    }

    fn kinematics(&self, sumo_id: &str) -> Option<Kinematics> {
        let v = &self.vehicles[self.index_of(sumo_id)?];
        Some(Kinematics {
            x: v.x,
            y: self.config.lane_y,
            speed: v.speed,
            acceleration: v.acceleration,
            controller_acceleration: v.u,
            time: self.time(),
        })
    }

    fn geo_position(&self, x: f64, y: f64) -> Option<GeoPosition> {
        self.geo.as_ref().map(|geo| GeoPosition {
            x: x + geo.offset_x,
            y: y + geo.offset_y,
            crs: geo.crs.clone(),
        })
    }

    fn invoke_api(
        &mut self,
        sumo_id: &str,
        api_code: &str,
        parameters: &str,
    ) -> Result<String, ApiError> {
        api::interpret(self, sumo_id, api_code, parameters)
    }

    fn close(&mut self) {
        if !self.closed {
            info!(steps = self.steps, vehicles = self.vehicles.len(), "platoon simulator closed");
            self.closed = true;
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
