use crate::bus::BusError;
use crate::config::ConfigError;
use crate::simulator::SimulatorFault;

/// Fatal errors that end a bridge run.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error(transparent)]
    Simulator(#[from] SimulatorFault),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("the step loop has already run")]
    AlreadyRun,
}
