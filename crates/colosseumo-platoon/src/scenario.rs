//! The platoon scenario: one ACC leader followed by CACC vehicles.

use crate::controller::ActiveController;
use crate::road::{PlatoonSimulator, VehicleSpec};
use colosseumo_core::simulator::{Scenario, SimulatorFault};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Shape of the platoon and the parameters handed to each vehicle's
/// application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlatoonConfig {
    /// Number of vehicles, leader included.
    pub vehicles: u32,
    /// Leader front bumper position in metres.
    pub leader_position: f64,
    /// Insertion speed in m/s.
    pub speed: f64,
    /// Vehicle length in metres.
    pub length: f64,
    /// Bumper-to-bumper distance between consecutive vehicles.
    pub distance: f64,
    /// Seconds between beacons.
    pub beacon_interval: f64,
    pub min_speed: f64,
    pub max_speed: f64,
    /// Feed CACC vehicles from the simulation instead of from received
    /// beacons.
    pub auto_feed: bool,
}

impl Default for PlatoonConfig {
    fn default() -> Self {
        Self {
            vehicles: 4,
            leader_position: 100.0,
            speed: 25.0,
            length: 4.0,
            distance: 5.0,
            beacon_interval: 0.1,
            min_speed: 15.0,
            max_speed: 25.0,
            auto_feed: false,
        }
    }
}

/// Inserts `p.0 .. p.{n-1}` nose to tail.
#[derive(Debug, Clone)]
pub struct PlatoonScenario {
    config: PlatoonConfig,
    formation: Vec<String>,
}

impl PlatoonScenario {
    pub fn new(config: PlatoonConfig) -> Self {
        let formation = (0..config.vehicles).map(|i| format!("p.{i}")).collect();
        Self { config, formation }
    }

    pub fn config(&self) -> &PlatoonConfig {
        &self.config
    }

    /// Vehicle ids from leader to tail.
    pub fn formation(&self) -> &[String] {
        &self.formation
    }
}

impl Scenario<PlatoonSimulator> for PlatoonScenario {
    fn configure_initial_vehicles(
        &mut self,
        sim: &mut PlatoonSimulator,
    ) -> Result<(), SimulatorFault> {
        let c = &self.config;
        let leader = self.formation.first().cloned();
        for (i, id) in self.formation.iter().enumerate() {
            let position = c.leader_position - i as f64 * (c.distance + c.length);
            let controller = if i == 0 {
                ActiveController::Acc
            } else {
                ActiveController::Cacc
            };
            sim.add_vehicle(
                VehicleSpec::new(id.clone(), position, c.speed)
                    .with_length(c.length)
                    .with_controller(controller),
            )
            .map_err(|e| SimulatorFault(e.to_string()))?;
            if c.auto_feed
                && i > 0
                && let Some(leader) = &leader
            {
                sim.enable_auto_feed(id, leader, &self.formation[i - 1])
                    .map_err(|e| SimulatorFault(e.to_string()))?;
            }
        }
        info!(vehicles = self.formation.len(), "platoon inserted");
        Ok(())
    }

    fn vehicle_parameters(&self, sumo_id: &str) -> Option<String> {
        if !self.formation.iter().any(|id| id == sumo_id) {
            return None;
        }
        let parameters = serde_json::json!({
            "platoon_formation": self.formation,
            "beacon_interval": self.config.beacon_interval,
            "min_speed": self.config.min_speed,
            "max_speed": self.config.max_speed,
        });
        Some(parameters.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::road::RoadConfig;
    use colosseumo_core::simulator::Simulator;

    #[test]
    fn vehicles_are_spaced_nose_to_tail() {
        let mut sim = PlatoonSimulator::new(RoadConfig::default());
        let mut scenario = PlatoonScenario::new(PlatoonConfig::default());
        scenario.configure_initial_vehicles(&mut sim).unwrap();

        assert_eq!(sim.vehicle_ids(), vec!["p.0", "p.1", "p.2", "p.3"]);
        assert_eq!(sim.active_controller("p.0"), Some(ActiveController::Acc));
        assert_eq!(sim.active_controller("p.3"), Some(ActiveController::Cacc));
        for i in 1..4 {
            let gap = sim.gap_ahead(&format!("p.{i}")).unwrap();
            assert!((gap - 5.0).abs() < 1e-9);
        }
        assert!(sim.gap_ahead("p.0").is_none());
    }

    #[test]
    fn parameters_describe_the_formation() {
        let scenario = PlatoonScenario::new(PlatoonConfig {
            vehicles: 3,
            ..PlatoonConfig::default()
        });
        let params: serde_json::Value =
            serde_json::from_str(&scenario.vehicle_parameters("p.1").unwrap()).unwrap();
        assert_eq!(
            params["platoon_formation"],
            serde_json::json!(["p.0", "p.1", "p.2"])
        );
        assert_eq!(params["beacon_interval"], 0.1);
        assert_eq!(params["max_speed"], 25.0);
        assert!(scenario.vehicle_parameters("intruder").is_none());
    }

    #[test]
    fn config_reads_from_toml() {
        let config: PlatoonConfig = toml::from_str("vehicles = 6\nauto_feed = true").unwrap();
        assert_eq!(config.vehicles, 6);
        assert!(config.auto_feed);
        assert_eq!(config.distance, 5.0);
        assert!(toml::from_str::<PlatoonConfig>("lanes = 2").is_err());
    }
}
