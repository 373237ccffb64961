//! Interfaces of the external traffic simulator and scenario plugins.
//!
//! The simulator is a stepped black box owned exclusively by the step loop.
//! It is never reached from any other thread: node applications go through
//! the RPC gateway, which calls [`Simulator::invoke_api`] back on the step
//! loop thread.

use crate::id::SimTime;
use crate::message::VehicleData;

// ---------------------------------------------------------------------------
// Kinematics
// ---------------------------------------------------------------------------

/// Kinematic state of one vehicle at the current simulation time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Kinematics {
    pub x: f64,
    pub y: f64,
    pub speed: f64,
    pub acceleration: f64,
    /// Acceleration commanded by the active controller, before actuation lag.
    pub controller_acceleration: f64,
    pub time: SimTime,
}

impl Kinematics {
    /// Package as a [`VehicleData`] payload for `sumo_id`.
    pub fn to_vehicle_data(&self, sumo_id: &str) -> VehicleData {
        VehicleData {
            sumo_id: sumo_id.to_string(),
            controller_acceleration: self.controller_acceleration,
            acceleration: self.acceleration,
            speed: self.speed,
            time: self.time,
            x: self.x,
            y: self.y,
            sender: None,
            recipient: None,
            seqn: None,
            ts: None,
        }
    }

    /// Rebuild from a [`VehicleData`] payload.
    pub fn from_vehicle_data(data: &VehicleData) -> Self {
        Self {
            x: data.x,
            y: data.y,
            speed: data.speed,
            acceleration: data.acceleration,
            controller_acceleration: data.controller_acceleration,
            time: data.time,
        }
    }
}

/// A position projected into a geographic coordinate reference system.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoPosition {
    pub x: f64,
    pub y: f64,
    /// Authority code of the reference system, e.g. `EPSG:32632`.
    pub crs: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An unrecoverable simulator error. Ends the simulation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("simulator fault: {0}")]
pub struct SimulatorFault(pub String);

/// Failure of a single API invocation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ApiError {
    /// The call was refused (unknown code, bad parameters, unknown vehicle).
    /// The simulation continues.
    #[error("API call rejected: {0}")]
    Rejected(String),
    /// The simulator broke while serving the call.
    #[error(transparent)]
    Fault(#[from] SimulatorFault),
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

/// A stepped traffic microsimulator.
///
/// Vehicle id lists refer to the most recent [`Simulator::step`] (or, before
/// the first step, to vehicles inserted by the scenario).
pub trait Simulator {
    /// Advance one step.
    fn step(&mut self) -> Result<(), SimulatorFault>;

    /// Current simulation time in seconds.
    fn time(&self) -> SimTime;

    /// Length of one step in seconds.
    fn step_length(&self) -> f64;

    /// Every vehicle currently in the simulation, in insertion order.
    fn vehicle_ids(&self) -> Vec<String>;

    /// Vehicles inserted since the previous step.
    fn inserted_vehicle_ids(&self) -> Vec<String>;

    /// Vehicles removed since the previous step.
    fn removed_vehicle_ids(&self) -> Vec<String>;

    /// Whether vehicles are still scheduled to enter. With no live vehicles
    /// and nothing pending, the simulation has run its course.
    fn has_pending_vehicles(&self) -> bool;

    /// Kinematic state of a live vehicle, `None` for unknown ids.
    fn kinematics(&self, sumo_id: &str) -> Option<Kinematics>;

    /// Project a simulation position into geographic coordinates. `None`
    /// when the network carries no geo reference.
    fn geo_position(&self, x: f64, y: f64) -> Option<GeoPosition> {
        let _ = (x, y);
        None
    }

    /// Invoke a simulator API on behalf of `sumo_id`. `parameters` and the
    /// returned string are JSON.
    fn invoke_api(
        &mut self,
        sumo_id: &str,
        api_code: &str,
        parameters: &str,
    ) -> Result<String, ApiError>;

    /// Shut the simulator down. Called once during teardown.
    fn close(&mut self) {}
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

/// User-supplied scenario plugin, invoked at fixed lifecycle points.
pub trait Scenario<S: Simulator> {
    /// Insert the vehicles the simulation starts with.
    fn configure_initial_vehicles(&mut self, simulator: &mut S) -> Result<(), SimulatorFault>;

    /// Called after every simulator step, before vehicles are reconciled.
    fn on_step(&mut self, step: u64, simulator: &mut S) -> Result<(), SimulatorFault> {
        let _ = (step, simulator);
        Ok(())
    }

    /// Application parameters for one vehicle, as a JSON string. `None`
    /// falls back to the globally configured parameters.
    fn vehicle_parameters(&self, sumo_id: &str) -> Option<String> {
        let _ = sumo_id;
        None
    }
}

/// A scenario that inserts nothing, for simulators that populate themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyScenario;

impl<S: Simulator> Scenario<S> for EmptyScenario {
    fn configure_initial_vehicles(&mut self, _simulator: &mut S) -> Result<(), SimulatorFault> {
        Ok(())
    }
}
