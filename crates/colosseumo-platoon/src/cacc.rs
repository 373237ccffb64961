//! The CACC platooning application.
//!
//! Every member beacons its own vehicle data, fetched through `ccvd`, once
//! per beacon interval: the leader to every follower, each follower to the
//! vehicle behind it. The tail only fetches. Followers feed beacons from the
//! leader and from their predecessor back into their controller through
//! `ccla` and `ccpa`. The leader alternates its cruise speed between
//! `max_speed` and `min_speed` every [`SPEED_PERIOD`] seconds.

use crate::api;
use colosseumo_core::application::{
    Application, ApplicationFactory, ApplicationFault, NodeContext, NodeInfo,
};
use colosseumo_core::id::SimTime;
use colosseumo_core::message::{self, Envelope, VehicleData};
use colosseumo_core::rpc::{CallError, REJECTED_RESPONSE};
use colosseumo_core::simulator::Kinematics;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Seconds the leader holds each cruise speed.
pub const SPEED_PERIOD: f64 = 10.0;

/// Name the application is registered under.
pub const APPLICATION_NAME: &str = "cacc";

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CaccParameters {
    /// Vehicle ids from leader to tail.
    pub platoon_formation: Vec<String>,
    /// Seconds between beacons.
    pub beacon_interval: f64,
    pub min_speed: f64,
    pub max_speed: f64,
}

impl CaccParameters {
    pub fn parse(json: &str) -> Result<Self, ApplicationFault> {
        let params: Self = serde_json::from_str(json)?;
        if params.beacon_interval.is_nan() || params.beacon_interval <= 0.0 {
            return Err(ApplicationFault::new(format!(
                "beacon_interval must be positive, got {}",
                params.beacon_interval
            )));
        }
        Ok(params)
    }
}

/// Where a vehicle sits in its platoon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Role {
    pub position: usize,
    pub leader: String,
    /// Vehicle ahead; `None` for the leader.
    pub preceding: Option<String>,
    /// Vehicles this one beacons to.
    pub recipients: Vec<String>,
}

impl Role {
    pub fn of(sumo_id: &str, formation: &[String]) -> Result<Self, ApplicationFault> {
        let position = formation
            .iter()
            .position(|id| id == sumo_id)
            .ok_or_else(|| ApplicationFault::new(format!("{sumo_id} is not in the formation")))?;
        let leader = formation[0].clone();
        let (preceding, recipients) = if position == 0 {
            (None, formation[1..].to_vec())
        } else {
            (
                Some(formation[position - 1].clone()),
                formation.get(position + 1).cloned().into_iter().collect(),
            )
        };
        Ok(Self {
            position,
            leader,
            preceding,
            recipients,
        })
    }

    pub fn is_leader(&self) -> bool {
        self.position == 0
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

pub struct CaccApplication {
    params: CaccParameters,
    role: Role,
    next_beacon: Option<SimTime>,
    beacon_id: u64,
    speed_phase: Option<u64>,
}

impl CaccApplication {
    pub fn new(sumo_id: &str, params: CaccParameters) -> Result<Self, ApplicationFault> {
        let role = Role::of(sumo_id, &params.platoon_formation)?;
        Ok(Self {
            params,
            role,
            next_beacon: None,
            beacon_id: 0,
            speed_phase: None,
        })
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Cruise speed the leader should hold at `time`.
    pub fn target_speed(&self, time: SimTime) -> f64 {
        if Self::phase(time) % 2 == 0 {
            self.params.max_speed
        } else {
            self.params.min_speed
        }
    }

    fn phase(time: SimTime) -> u64 {
        (time / SPEED_PERIOD).floor().max(0.0) as u64
    }

    /// Invoke an API, treating a timed-out or aborted call as no answer.
    fn call(
        ctx: &NodeContext,
        api_code: &str,
        parameters: &str,
    ) -> Result<Option<String>, ApplicationFault> {
        match ctx.call_api(api_code, parameters) {
            Ok(response) if response == REJECTED_RESPONSE => Ok(None),
            Ok(response) => Ok(Some(response)),
            Err(CallError::Timeout) => {
                warn!(vehicle = ctx.sumo_id(), api_code, "API call timed out");
                Ok(None)
            }
            Err(CallError::Aborted) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn send_beacon(&mut self, ctx: &NodeContext) -> Result<(), ApplicationFault> {
        let Some(raw) = Self::call(ctx, api::VEHICLE_DATA, ctx.sumo_id())? else {
            return Ok(());
        };
        let mut data = message::decode_vehicle_data(raw.as_bytes())?;
        debug!(vehicle = ctx.sumo_id(), x = data.x, y = data.y, "position");
        if self.role.recipients.is_empty() {
            return Ok(());
        }
        data.seqn = Some(self.beacon_id);
        data.ts = Some(wall_clock());
        for recipient in &self.role.recipients {
            ctx.transmit(recipient, data.clone())?;
        }
        self.beacon_id += 1;
        Ok(())
    }

    fn update_cruise_speed(
        &mut self,
        ctx: &NodeContext,
        time: SimTime,
    ) -> Result<(), ApplicationFault> {
        let phase = Self::phase(time);
        if self.speed_phase == Some(phase) {
            return Ok(());
        }
        let speed = self.target_speed(time);
        debug!(vehicle = ctx.sumo_id(), speed, "changing cruise speed");
        Self::call(ctx, api::DESIRED_SPEED, &api::desired_speed_request(speed))?;
        self.speed_phase = Some(phase);
        Ok(())
    }
}

fn wall_clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

impl Application for CaccApplication {
    fn on_step(&mut self, ctx: &NodeContext, state: &Kinematics) -> Result<(), ApplicationFault> {
        if self.role.is_leader() {
            self.update_cruise_speed(ctx, state.time)?;
        }
        if self.next_beacon.is_none_or(|due| state.time >= due) {
            self.send_beacon(ctx)?;
            self.next_beacon = Some(state.time + self.params.beacon_interval);
        }
        Ok(())
    }

    fn on_receive(&mut self, ctx: &NodeContext, packet: &VehicleData) -> Result<(), ApplicationFault> {
        if self.role.is_leader() {
            return Ok(());
        }
        let Some(source) = packet.sender.as_deref() else {
            return Ok(());
        };
        let from_leader = source == self.role.leader;
        let from_preceding = self.role.preceding.as_deref() == Some(source);
        if !from_leader && !from_preceding {
            return Ok(());
        }
        let bytes = message::encode(&Envelope::VehicleData(packet.clone()))
            .map_err(|e| ApplicationFault::new(e.to_string()))?;
        let json = String::from_utf8(bytes).map_err(|e| ApplicationFault::new(e.to_string()))?;
        if from_leader {
            Self::call(ctx, api::LEADER_DATA, &json)?;
        }
        if from_preceding {
            Self::call(ctx, api::PRECEDING_DATA, &json)?;
        }
        Ok(())
    }
}

/// Builds a [`CaccApplication`] from each vehicle's JSON parameters.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaccFactory;

impl ApplicationFactory for CaccFactory {
    fn name(&self) -> &str {
        APPLICATION_NAME
    }

    fn create(&self, info: &NodeInfo) -> Result<Box<dyn Application>, ApplicationFault> {
        let params = CaccParameters::parse(&info.parameters)?;
        Ok(Box::new(CaccApplication::new(&info.sumo_id, params)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use colosseumo_core::id::NodeId;

    fn formation(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("p.{i}")).collect()
    }

    fn params() -> CaccParameters {
        CaccParameters {
            platoon_formation: formation(4),
            beacon_interval: 0.1,
            min_speed: 15.0,
            max_speed: 25.0,
        }
    }

    #[test]
    fn leader_beacons_to_every_follower() {
        let role = Role::of("p.0", &formation(4)).unwrap();
        assert!(role.is_leader());
        assert_eq!(role.preceding, None);
        assert_eq!(role.recipients, vec!["p.1", "p.2", "p.3"]);
    }

    #[test]
    fn middle_vehicle_beacons_backwards() {
        let role = Role::of("p.2", &formation(4)).unwrap();
        assert_eq!(role.leader, "p.0");
        assert_eq!(role.preceding.as_deref(), Some("p.1"));
        assert_eq!(role.recipients, vec!["p.3"]);
    }

    #[test]
    fn tail_beacons_to_nobody() {
        let role = Role::of("p.3", &formation(4)).unwrap();
        assert!(role.recipients.is_empty());
    }

    #[test]
    fn outsider_is_refused() {
        assert!(Role::of("x", &formation(4)).is_err());
    }

    #[test]
    fn parameters_parse_from_scenario_json() {
        let json = r#"{"platoon_formation":["p.0","p.1"],"beacon_interval":0.5,
                       "min_speed":15,"max_speed":25}"#;
        let parsed = CaccParameters::parse(json).unwrap();
        assert_eq!(parsed.platoon_formation, vec!["p.0", "p.1"]);
        assert_eq!(parsed.min_speed, 15.0);
        assert!(CaccParameters::parse("{}").is_err());
        assert!(
            CaccParameters::parse(
                r#"{"platoon_formation":["p.0"],"beacon_interval":0,"min_speed":1,"max_speed":2}"#
            )
            .is_err()
        );
    }

    #[test]
    fn leader_alternates_speed_every_period() {
        let app = CaccApplication::new("p.0", params()).unwrap();
        assert_eq!(app.target_speed(0.0), 25.0);
        assert_eq!(app.target_speed(9.9), 25.0);
        assert_eq!(app.target_speed(10.0), 15.0);
        assert_eq!(app.target_speed(20.5), 25.0);
    }

    #[test]
    fn factory_builds_from_node_info() {
        let info = NodeInfo {
            sumo_id: "p.1".into(),
            node_id: NodeId(1),
            application: APPLICATION_NAME.into(),
            parameters: serde_json::json!({
                "platoon_formation": ["p.0", "p.1"],
                "beacon_interval": 0.1,
                "min_speed": 15.0,
                "max_speed": 25.0,
            })
            .to_string(),
        };
        assert!(CaccFactory.create(&info).is_ok());
        let bad = NodeInfo {
            parameters: "{}".into(),
            ..info
        };
        assert!(CaccFactory.create(&bad).is_err());
    }
}
