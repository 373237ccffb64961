//! Built-in platooning simulator and application for Colosseumo.
//!
//! Lets the bridge run without an external traffic simulator:
//!
//! - [`road::PlatoonSimulator`] -- single-lane longitudinal simulator with
//!   cruise control, ACC and CACC controllers and first-order actuator lag.
//! - [`api`] -- interpreter for the platooning API codes (`ccvd`, `ccla`,
//!   `ccpa`, `ccsp`, `ccac`).
//! - [`scenario::PlatoonScenario`] -- an ACC leader followed by CACC
//!   vehicles, with per-vehicle formation parameters.
//! - [`cacc::CaccApplication`] -- beacons vehicle data along the platoon and
//!   feeds received beacons back into the controller.

pub mod api;
pub mod cacc;
pub mod controller;
pub mod road;
pub mod scenario;

pub use cacc::{CaccApplication, CaccFactory};
pub use road::{PlatoonSimulator, RoadConfig, VehicleSpec};
pub use scenario::{PlatoonConfig, PlatoonScenario};
