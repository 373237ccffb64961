//! Colosseumo CLI
//!
//! Bridges the built-in platoon simulator to a Colosseum testbed over MQTT,
//! runs a single node's application, or sends control signals.
//!
//! # Example
//!
//! ```bash
//! # Bridge, waiting for the testbed's start signal
//! colosseumo run --config colosseumo.toml
//!
//! # Bridge with applications running locally, no testbed
//! colosseumo run --local-apps --start-immediately --realtime
//!
//! # One node's application
//! colosseumo node --sumo-id p.1 --node-id 1 --parameters '{...}'
//!
//! # Start or stop a waiting bridge
//! colosseumo start
//! colosseumo stop
//! ```

mod settings;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colosseumo_core::application::{ApplicationFactory, NodeInfo};
use colosseumo_core::bus::Bus;
use colosseumo_core::id::NodeId;
use colosseumo_core::message::Envelope;
use colosseumo_core::node::NodeRuntime;
use colosseumo_core::step_loop::StepLoop;
use colosseumo_core::topic;
use colosseumo_mqtt::MqttBus;
use colosseumo_platoon::{CaccFactory, PlatoonScenario, PlatoonSimulator};
use settings::{BrokerArgs, Settings};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How long to wait for the broker to accept a connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const CONTROL_CLIENT_ID: &str = "colosseumo-control";

#[derive(Parser, Debug)]
#[command(name = "colosseumo")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge with the built-in platoon simulator
    Run(RunArgs),
    /// Run one vehicle's application on a testbed node
    Node(NodeArgs),
    /// Tell a waiting bridge to start
    Start(ControlArgs),
    /// Tell a running bridge to stop
    Stop(ControlArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    broker: BrokerArgs,

    /// Stop once simulation time exceeds this many seconds
    #[arg(long)]
    max_time: Option<f64>,

    /// Number of testbed nodes
    #[arg(long)]
    nodes: Option<u32>,

    /// Number of platoon vehicles
    #[arg(long)]
    vehicles: Option<u32>,

    /// Application advertised to the testbed
    #[arg(long)]
    application: Option<String>,

    /// File holding the application parameters as JSON
    #[arg(long)]
    parameters_file: Option<PathBuf>,

    /// Do not wait for the start signal
    #[arg(long)]
    start_immediately: bool,

    /// Pace steps to wall-clock time
    #[arg(long)]
    realtime: bool,

    /// Run the CACC applications in this process instead of on the testbed
    #[arg(long)]
    local_apps: bool,
}

impl RunArgs {
    fn apply(&self, settings: &mut Settings) {
        self.broker.apply(&mut settings.bridge.broker);
        let bridge = &mut settings.bridge;
        if let Some(max_time) = self.max_time {
            bridge.max_time = max_time;
        }
        if let Some(nodes) = self.nodes {
            bridge.node_pool_size = nodes;
        }
        if let Some(application) = &self.application {
            bridge.application = application.clone();
        }
        bridge.start_immediately |= self.start_immediately;
        bridge.realtime |= self.realtime;
        if let Some(vehicles) = self.vehicles {
            settings.platoon.vehicles = vehicles;
        }
    }
}

#[derive(clap::Args, Debug)]
struct NodeArgs {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    broker: BrokerArgs,

    /// Simulator id of the vehicle this node represents
    #[arg(long)]
    sumo_id: String,

    /// Testbed node id
    #[arg(long)]
    node_id: u32,

    /// Application parameters as JSON
    #[arg(long)]
    parameters: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ControlArgs {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(flatten)]
    broker: BrokerArgs,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match cli.command {
        Command::Run(args) => run(args),
        Command::Node(args) => node(args),
        Command::Start(args) => control(args, Envelope::StartSimulation),
        Command::Stop(args) => control(args, Envelope::StopSimulation),
    }
}

fn run(args: RunArgs) -> Result<()> {
    let mut settings = Settings::load_or_default(args.config.as_deref())?;
    args.apply(&mut settings);
    if let Some(path) = &args.parameters_file {
        settings.bridge.parameters = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read parameters from {}", path.display()))?;
    }
    settings.validate()?;

    let bus = MqttBus::from_config(&settings.bridge.broker, None, CONNECT_TIMEOUT)
        .context("cannot reach the MQTT broker")?;

    let mut simulator = PlatoonSimulator::new(settings.road.clone());
    if let Some(geo) = settings.geo.clone() {
        simulator = simulator.with_geo_reference(geo);
    }
    let scenario = PlatoonScenario::new(settings.platoon.clone());

    info!(
        vehicles = settings.platoon.vehicles,
        nodes = settings.bridge.node_pool_size,
        max_time = settings.bridge.max_time,
        local_apps = args.local_apps,
        "starting bridge"
    );

    let mut step_loop = StepLoop::new(settings.bridge, simulator, scenario, Arc::new(bus));
    if args.local_apps {
        step_loop = step_loop.with_applications(Arc::new(CaccFactory));
    }
    let summary = step_loop.run()?;

    info!(
        ticks = summary.ticks,
        final_time = summary.final_time,
        reason = %summary.reason,
        "bridge finished"
    );
    Ok(())
}

fn node(args: NodeArgs) -> Result<()> {
    let mut settings = Settings::load_or_default(args.config.as_deref())?;
    args.broker.apply(&mut settings.bridge.broker);
    settings.validate()?;

    let client_id = args
        .broker
        .client_id
        .clone()
        .unwrap_or_else(|| format!("node-{}", args.node_id));
    let bus = MqttBus::from_config(
        &settings.bridge.broker,
        Some(client_id.as_str()),
        CONNECT_TIMEOUT,
    )
    .context("cannot reach the MQTT broker")?;

    let factory = CaccFactory;
    let info = NodeInfo {
        sumo_id: args.sumo_id,
        node_id: NodeId(args.node_id),
        application: factory.name().to_string(),
        parameters: args
            .parameters
            .unwrap_or_else(|| settings.bridge.parameters.clone()),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, shutdown.clone())
            .context("cannot install signal handler")?;
    }

    let runtime = NodeRuntime::start(info, &factory, Arc::new(bus), settings.bridge.rpc_timeout())?
        .with_poll_interval(settings.bridge.poll_interval())
        .with_stop_timeout(settings.bridge.stop_timeout());
    let exit = runtime.run(&shutdown);
    info!(?exit, "node finished");
    Ok(())
}

fn control(args: ControlArgs, signal: Envelope) -> Result<()> {
    let mut settings = Settings::load_or_default(args.config.as_deref())?;
    args.broker.apply(&mut settings.bridge.broker);

    let client_id = args
        .broker
        .client_id
        .as_deref()
        .unwrap_or(CONTROL_CLIENT_ID);
    let bus = MqttBus::from_config(&settings.bridge.broker, Some(client_id), CONNECT_TIMEOUT)
        .context("cannot reach the MQTT broker")?;
    bus.publish_envelope(topic::COLOSSEUM_UPDATE, &signal)?;
    bus.disconnect();
    info!(signal = ?signal.kind(), "control signal sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn run_flags_override_settings() {
        let cli = Cli::parse_from([
            "colosseumo",
            "run",
            "--port",
            "1883",
            "--max-time",
            "120",
            "--vehicles",
            "8",
            "--realtime",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let mut settings = Settings::default();
        args.apply(&mut settings);
        assert_eq!(settings.bridge.broker.port, 1883);
        assert_eq!(settings.bridge.max_time, 120.0);
        assert_eq!(settings.platoon.vehicles, 8);
        assert!(settings.bridge.realtime);
        assert!(!settings.bridge.start_immediately);
    }

    #[test]
    fn node_requires_identity() {
        assert!(Cli::try_parse_from(["colosseumo", "node", "--node-id", "1"]).is_err());
        let cli = Cli::parse_from(["colosseumo", "node", "--sumo-id", "p.1", "--node-id", "1"]);
        assert!(matches!(cli.command, Command::Node(_)));
    }
}
