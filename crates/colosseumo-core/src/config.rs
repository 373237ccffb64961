//! Bridge configuration.
//!
//! Every field has a default, so an empty TOML file (or none at all) yields a
//! usable configuration. Command-line flags are applied on top by the binary.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ===========================================================================
// Errors
// ===========================================================================

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read {file}: {source}")]
    Io {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML for this schema.
    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// A value is out of range or inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ===========================================================================
// Broker
// ===========================================================================

/// Where and how to reach the MQTT broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 12345,
            client_id: "sumo".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 30,
        }
    }
}

// ===========================================================================
// Bridge
// ===========================================================================

/// Settings for one bridge run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    /// Number of testbed nodes vehicles can be mapped onto.
    pub node_pool_size: u32,
    /// Stop once simulation time exceeds this many seconds.
    pub max_time: f64,
    /// Run without waiting for the testbed's start signal.
    pub start_immediately: bool,
    /// Stop when no vehicles are live and none are scheduled.
    pub stop_when_empty: bool,
    /// Pace ticks to wall-clock time.
    pub realtime: bool,
    /// Publish geographic coordinates when the network has a geo reference.
    pub geo_coordinates: bool,
    /// Deadline for API calls issued by local applications, in seconds.
    pub rpc_timeout_secs: f64,
    /// How long a departing vehicle's application gets to stop before its
    /// worker is abandoned, in seconds.
    pub stop_timeout_secs: f64,
    /// How long one wait for inbound messages lasts while idle, in
    /// milliseconds.
    pub poll_interval_ms: u64,
    /// Application every node runs.
    pub application: String,
    /// JSON-encoded parameters handed to the scenario and applications.
    pub parameters: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            node_pool_size: 32,
            max_time: 60.0,
            start_immediately: false,
            stop_when_empty: false,
            realtime: false,
            geo_coordinates: false,
            rpc_timeout_secs: 5.0,
            stop_timeout_secs: 2.0,
            poll_interval_ms: 100,
            application: "application".to_string(),
            parameters: "{}".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML text. `origin` names the source in errors.
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse {
            file: origin.to_path_buf(),
            detail: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            file: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text, path)
    }

    /// Check ranges and that `parameters` is valid JSON.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.max_time.is_finite() && self.max_time >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "max_time must be a non-negative number, got {}",
                self.max_time
            )));
        }
        check_timeout("rpc_timeout_secs", self.rpc_timeout_secs)?;
        check_timeout("stop_timeout_secs", self.stop_timeout_secs)?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if self.broker.host.is_empty() {
            return Err(ConfigError::Invalid("broker host is empty".into()));
        }
        serde_json::from_str::<serde_json::Value>(&self.parameters)
            .map_err(|e| ConfigError::Invalid(format!("parameters are not valid JSON: {e}")))?;
        Ok(())
    }

    pub fn rpc_timeout(&self) -> Duration {
        seconds(self.rpc_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        seconds(self.stop_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// A timeout must be positive and representable as a [`Duration`].
fn check_timeout(name: &str, secs: f64) -> Result<(), ConfigError> {
    if secs.is_nan() || secs <= 0.0 || Duration::try_from_secs_f64(secs).is_err() {
        return Err(ConfigError::Invalid(format!(
            "{name} must be a positive number of seconds, got {secs}"
        )));
    }
    Ok(())
}

/// Seconds to a [`Duration`], saturating for values `validate` rejects.
fn seconds(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn origin() -> &'static Path {
        Path::new("test.toml")
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = BridgeConfig::from_toml_str("", origin()).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.node_pool_size, 32);
        assert_eq!(config.max_time, 60.0);
        assert_eq!(config.broker.port, 12345);
    }

    #[test]
    fn partial_file_overrides_fields() {
        let text = r#"
            node_pool_size = 4
            start_immediately = true
            parameters = '{"platoon_formation": {}}'

            [broker]
            host = "broker.local"
            port = 1883
        "#;
        let config = BridgeConfig::from_toml_str(text, origin()).unwrap();
        assert_eq!(config.node_pool_size, 4);
        assert!(config.start_immediately);
        assert_eq!(config.broker.host, "broker.local");
        assert_eq!(config.broker.port, 1883);
        assert_eq!(config.broker.client_id, "sumo");
        assert_eq!(config.max_time, 60.0);
    }

    #[test]
    fn unknown_field_rejected() {
        let err = BridgeConfig::from_toml_str("nodes = 3", origin()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn invalid_parameters_rejected() {
        let err = BridgeConfig::from_toml_str("parameters = '{not json'", origin()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn non_positive_timeout_rejected() {
        let err = BridgeConfig::from_toml_str("rpc_timeout_secs = 0.0", origin()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn oversized_timeouts_rejected() {
        for text in [
            "rpc_timeout_secs = 1e30",
            "stop_timeout_secs = 1e30",
            "stop_timeout_secs = -1.0",
        ] {
            let err = BridgeConfig::from_toml_str(text, origin()).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{text}");
        }
    }

    #[test]
    fn unvalidated_timeouts_saturate() {
        let config = BridgeConfig {
            rpc_timeout_secs: 1e30,
            stop_timeout_secs: f64::NAN,
            ..BridgeConfig::default()
        };
        assert_eq!(config.rpc_timeout(), Duration::MAX);
        assert_eq!(config.stop_timeout(), Duration::ZERO);
    }

    #[test]
    fn durations() {
        let config = BridgeConfig {
            rpc_timeout_secs: 1.5,
            poll_interval_ms: 20,
            ..BridgeConfig::default()
        };
        assert_eq!(config.rpc_timeout(), Duration::from_millis(1500));
        assert_eq!(config.stop_timeout(), Duration::from_secs(2));
        assert_eq!(config.poll_interval(), Duration::from_millis(20));
    }

    #[test]
    fn load_reads_file() {
        let dir = std::env::temp_dir().join(format!("colosseumo_config_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bridge.toml");
        fs::write(&path, "max_time = 12.5\n").unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.max_time, 12.5);

        let missing = BridgeConfig::load(&dir.join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
        let _ = fs::remove_dir_all(&dir);
    }
}
