//! Interpreter for the platooning API codes served to node applications.
//!
//! | code   | parameters                  | response             |
//! |--------|-----------------------------|----------------------|
//! | `ccvd` | ignored                     | `vehicle_data` JSON  |
//! | `ccla` | leader `vehicle_data` JSON  | `true`               |
//! | `ccpa` | preceding `vehicle_data`    | `true`               |
//! | `ccsp` | `vehicle_data` with `speed` | `true`               |
//! | `ccac` | controller code as integer  | `true`               |
//!
//! Anything else, or a call for an unknown vehicle, is rejected.

use crate::controller::{ActiveController, PeerState};
use crate::road::{PlatoonSimulator, RoadError};
use colosseumo_core::message::{self, Envelope};
use colosseumo_core::simulator::{ApiError, Simulator};
use serde::Deserialize;

/// Get the vehicle's own data.
pub const VEHICLE_DATA: &str = "ccvd";
/// Set the platoon leader's speed and acceleration.
pub const LEADER_DATA: &str = "ccla";
/// Set the preceding vehicle's speed and acceleration.
pub const PRECEDING_DATA: &str = "ccpa";
/// Set the cruise control desired speed.
pub const DESIRED_SPEED: &str = "ccsp";
/// Select the active controller.
pub const ACTIVE_CONTROLLER: &str = "ccac";

const ACK: &str = "true";

/// Only `speed` is read from a desired-speed request.
#[derive(Deserialize)]
struct SpeedRequest {
    content: SpeedContent,
}

#[derive(Deserialize)]
struct SpeedContent {
    speed: f64,
}

impl From<RoadError> for ApiError {
    fn from(err: RoadError) -> Self {
        ApiError::Rejected(err.to_string())
    }
}

fn peer_state(parameters: &str) -> Result<PeerState, ApiError> {
    let data = message::decode_vehicle_data(parameters.as_bytes())
        .map_err(|e| ApiError::Rejected(e.to_string()))?;
    Ok(PeerState {
        speed: data.speed,
        acceleration: data.acceleration,
    })
}

/// Serve one API call against `sim`.
pub fn interpret(
    sim: &mut PlatoonSimulator,
    sumo_id: &str,
    api_code: &str,
    parameters: &str,
) -> Result<String, ApiError> {
    match api_code {
        VEHICLE_DATA => {
            let state = sim
                .kinematics(sumo_id)
                .ok_or_else(|| RoadError::UnknownVehicle(sumo_id.to_string()))?;
            let bytes = message::encode(&Envelope::VehicleData(state.to_vehicle_data(sumo_id)))
                .map_err(|e| ApiError::Rejected(e.to_string()))?;
            String::from_utf8(bytes).map_err(|e| ApiError::Rejected(e.to_string()))
        }
        LEADER_DATA => {
            sim.set_leader_data(sumo_id, peer_state(parameters)?)?;
            Ok(ACK.to_string())
        }
        PRECEDING_DATA => {
            sim.set_preceding_data(sumo_id, peer_state(parameters)?)?;
            Ok(ACK.to_string())
        }
        DESIRED_SPEED => {
            let request: SpeedRequest = serde_json::from_str(parameters)
                .map_err(|e| ApiError::Rejected(format!("bad desired speed request: {e}")))?;
            sim.set_desired_speed(sumo_id, request.content.speed)?;
            Ok(ACK.to_string())
        }
        ACTIVE_CONTROLLER => {
            let code: i64 = parameters
                .trim()
                .parse()
                .map_err(|_| ApiError::Rejected(format!("bad controller code {parameters:?}")))?;
            let controller = ActiveController::from_code(code)
                .ok_or_else(|| ApiError::Rejected(format!("unknown controller {code}")))?;
            sim.set_active_controller(sumo_id, controller)?;
            Ok(ACK.to_string())
        }
        other => Err(ApiError::Rejected(format!("unknown API code {other}"))),
    }
}

/// Parameters for a desired-speed call.
pub fn desired_speed_request(speed: f64) -> String {
    serde_json::json!({ "type": "vehicle_data", "content": { "speed": speed } }).to_string()
}
