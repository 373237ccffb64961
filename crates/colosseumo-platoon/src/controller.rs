//! Longitudinal controllers: cruise control, ACC and CACC.
//!
//! Every controller returns a desired acceleration `u` in m/s². The vehicle
//! model then applies it through a first-order actuator lag (see
//! [`actuate`]).

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Active controller
// ---------------------------------------------------------------------------

/// Which controller drives a vehicle. Codes match the platooning API's
/// `ccac` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveController {
    /// Plain cruise control at the desired speed.
    Driver,
    /// Adaptive cruise control on radar measurements.
    Acc,
    /// Cooperative adaptive cruise control on communicated data.
    Cacc,
}

impl ActiveController {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(ActiveController::Driver),
            1 => Some(ActiveController::Acc),
            2 => Some(ActiveController::Cacc),
            _ => None,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            ActiveController::Driver => 0,
            ActiveController::Acc => 1,
            ActiveController::Cacc => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Gains and limits shared by every vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerParams {
    /// Proportional gain of the cruise controller.
    pub cc_gain: f64,
    /// ACC time headway in seconds.
    pub acc_headway: f64,
    /// ACC spacing error gain.
    pub acc_lambda: f64,
    /// Bumper-to-bumper CACC spacing in metres.
    pub cacc_spacing: f64,
    /// Weight of the leader's acceleration in the CACC law.
    pub cacc_c1: f64,
    /// CACC damping ratio.
    pub cacc_xi: f64,
    /// CACC bandwidth.
    pub cacc_omega_n: f64,
    /// Actuator time constant in seconds.
    pub engine_tau: f64,
    /// Radar range in metres; farther vehicles are not seen by ACC.
    pub radar_range: f64,
    pub max_acceleration: f64,
    /// Maximum deceleration, as a positive number.
    pub max_deceleration: f64,
}

impl Default for ControllerParams {
    fn default() -> Self {
        Self {
            cc_gain: 1.0,
            acc_headway: 1.2,
            acc_lambda: 0.1,
            cacc_spacing: 5.0,
            cacc_c1: 0.5,
            cacc_xi: 1.0,
            cacc_omega_n: 0.2,
            engine_tau: 0.5,
            radar_range: 250.0,
            max_acceleration: 2.5,
            max_deceleration: 6.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Speed and acceleration of another vehicle, either measured or received.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeerState {
    pub speed: f64,
    pub acceleration: f64,
}

/// What the radar sees of the vehicle directly ahead.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RadarReading {
    /// Bumper-to-bumper distance in metres.
    pub gap: f64,
    /// Measured speed of the vehicle ahead.
    pub speed: f64,
}

// ---------------------------------------------------------------------------
// Control laws
// ---------------------------------------------------------------------------

pub fn cruise(params: &ControllerParams, speed: f64, desired_speed: f64) -> f64 {
    -params.cc_gain * (speed - desired_speed)
}

/// ACC: constant time-headway spacing, never more aggressive than cruise
/// control. Without a vehicle in radar range it is cruise control.
pub fn acc(
    params: &ControllerParams,
    speed: f64,
    desired_speed: f64,
    radar: Option<RadarReading>,
) -> f64 {
    let cc = cruise(params, speed, desired_speed);
    match radar {
        Some(front) if front.gap <= params.radar_range => {
            let spacing_error = -front.gap + params.acc_headway * speed;
            let u = -(speed - front.speed + params.acc_lambda * spacing_error) / params.acc_headway;
            u.min(cc)
        }
        _ => cc,
    }
}

/// CACC with constant spacing, combining the leader's and the preceding
/// vehicle's state.
///
/// The gap always comes from the radar. With no vehicle ahead the law
/// degrades to cruise control.
pub fn cacc(
    params: &ControllerParams,
    speed: f64,
    desired_speed: f64,
    radar: Option<RadarReading>,
    leader: PeerState,
    preceding: PeerState,
) -> f64 {
    let Some(front) = radar else {
        return cruise(params, speed, desired_speed);
    };
    let xi = params.cacc_xi;
    let wn = params.cacc_omega_n;
    let c1 = params.cacc_c1;
    let root = (xi * xi - 1.0).max(0.0).sqrt();

    let alpha1 = 1.0 - c1;
    let alpha2 = c1;
    let alpha3 = -(2.0 * xi - c1 * (xi + root)) * wn;
    let alpha4 = -c1 * (xi + root) * wn;
    let alpha5 = -wn * wn;

    let spacing_error = -front.gap + params.cacc_spacing;
    let spacing_error_rate = speed - preceding.speed;

    alpha1 * preceding.acceleration
        + alpha2 * leader.acceleration
        + alpha3 * spacing_error_rate
        + alpha4 * (speed - leader.speed)
        + alpha5 * spacing_error
}

/// Clamp `u` to the vehicle's limits and pass it through the first-order
/// actuator lag, returning the acceleration after one step of `dt`.
pub fn actuate(params: &ControllerParams, u: f64, previous: f64, dt: f64) -> f64 {
    let u = u.clamp(-params.max_deceleration, params.max_acceleration);
    let alpha = dt / (params.engine_tau + dt);
    alpha * u + (1.0 - alpha) * previous
}
