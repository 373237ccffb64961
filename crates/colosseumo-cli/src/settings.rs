//! The `colosseumo` configuration file and command-line overrides.
//!
//! ```toml
//! [bridge]
//! node_pool_size = 32
//! max_time = 60.0
//!
//! [bridge.broker]
//! host = "127.0.0.1"
//! port = 12345
//!
//! [road]
//! step_length = 0.1
//!
//! [platoon]
//! vehicles = 4
//! ```

use clap::Args;
use colosseumo_core::config::{BridgeConfig, BrokerConfig, ConfigError};
use colosseumo_platoon::road::GeoReference;
use colosseumo_platoon::{PlatoonConfig, RoadConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub bridge: BridgeConfig,
    pub road: RoadConfig,
    pub platoon: PlatoonConfig,
    /// Projection published with positions when `bridge.geo_coordinates`
    /// is set.
    pub geo: Option<GeoReference>,
}

impl Settings {
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            file: origin.to_path_buf(),
            detail: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            file: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Defaults when `path` is `None`.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bridge.validate()?;
        if !(self.road.step_length.is_finite() && self.road.step_length > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "road.step_length must be positive, got {}",
                self.road.step_length
            )));
        }
        if self.platoon.vehicles == 0 {
            return Err(ConfigError::Invalid("platoon.vehicles must be at least 1".into()));
        }
        Ok(())
    }
}

/// Broker flags shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct BrokerArgs {
    /// Broker host
    #[arg(long)]
    pub host: Option<String>,

    /// Broker port
    #[arg(long)]
    pub port: Option<u16>,

    /// MQTT client id
    #[arg(long)]
    pub client_id: Option<String>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,
}

impl BrokerArgs {
    pub fn apply(&self, broker: &mut BrokerConfig) {
        if let Some(host) = &self.host {
            broker.host = host.clone();
        }
        if let Some(port) = self.port {
            broker.port = port;
        }
        if let Some(id) = &self.client_id {
            broker.client_id = id.clone();
        }
        if self.username.is_some() {
            broker.username = self.username.clone();
        }
        if self.password.is_some() {
            broker.password = self.password.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let settings = Settings::from_toml_str("", Path::new("empty.toml")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.bridge.broker.port, 12345);
        assert_eq!(settings.platoon.vehicles, 4);
    }

    #[test]
    fn sections_are_read() {
        let text = r#"
            [bridge]
            node_pool_size = 8
            realtime = true

            [bridge.broker]
            host = "10.0.0.2"

            [road]
            step_length = 0.01

            [platoon]
            vehicles = 6

            [geo]
            offset_x = 500000.0
            offset_y = 5000000.0
            crs = "EPSG:32632"
        "#;
        let settings = Settings::from_toml_str(text, Path::new("c.toml")).unwrap();
        assert_eq!(settings.bridge.node_pool_size, 8);
        assert!(settings.bridge.realtime);
        assert_eq!(settings.bridge.broker.host, "10.0.0.2");
        assert_eq!(settings.road.step_length, 0.01);
        assert_eq!(settings.platoon.vehicles, 6);
        assert_eq!(settings.geo.unwrap().crs, "EPSG:32632");
    }

    #[test]
    fn bad_values_are_refused() {
        let origin = Path::new("bad.toml");
        assert!(matches!(
            Settings::from_toml_str("[road]\nstep_length = 0.0", origin),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml_str("[platoon]\nvehicles = 0", origin),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            Settings::from_toml_str("[nonsense]", origin),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn broker_flags_override_file() {
        let mut broker = BrokerConfig::default();
        BrokerArgs {
            host: Some("broker".into()),
            port: Some(1883),
            ..BrokerArgs::default()
        }
        .apply(&mut broker);
        assert_eq!(broker.host, "broker");
        assert_eq!(broker.port, 1883);
        assert_eq!(broker.client_id, "sumo");
    }
}
