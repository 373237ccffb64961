//! Live vehicles, their testbed nodes, and their applications.
//!
//! The registry is the step loop's view of which simulator vehicles exist and
//! which node each one occupies. [`VehicleRegistry::reconcile`] diffs the
//! simulator's live set against it once per tick. Departures are handled
//! before arrivals so nodes freed in a tick can be reused in the same tick.
//!
//! While a vehicle is registered the sumo id and node id map one-to-one.
//! A vehicle the allocator cannot place stays unregistered and is tried
//! again on every later tick while it remains live.
//!
//! While applications are held (before the testbed's start signal), vehicles
//! register without starting theirs. [`VehicleRegistry::start_applications`]
//! launches them all.

use crate::allocator::NodeAllocator;
use crate::application::{ApplicationFactory, ApplicationHost, NodeContext, NodeInfo};
use crate::bus::Bus;
use crate::id::{NodeId, SimTime, TransactionId};
use crate::message::VehicleData;
use crate::rpc::RpcGateway;
use crate::simulator::Kinematics;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Records and results
// ---------------------------------------------------------------------------

/// One live, placed vehicle.
#[derive(Debug)]
pub struct VehicleRecord {
    pub sumo_id: String,
    pub node_id: NodeId,
    pub registered_at: SimTime,
    /// JSON-encoded application parameters sent with `new_vehicle`.
    pub parameters: String,
    application: Option<ApplicationHost>,
    awaiting_start: bool,
}

impl VehicleRecord {
    pub fn has_application(&self) -> bool {
        self.application.is_some()
    }

    /// Registered while applications were held; launched on start.
    pub fn awaiting_start(&self) -> bool {
        self.awaiting_start
    }
}

/// A vehicle that entered and was given a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arrival {
    pub sumo_id: String,
    pub node_id: NodeId,
    pub parameters: String,
}

/// A vehicle that left; its node has been released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub sumo_id: String,
    pub node_id: NodeId,
}

/// Outcome of one reconciliation, each list in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub departures: Vec<Departure>,
    pub arrivals: Vec<Arrival>,
    /// Live vehicles left unplaced because every node is taken.
    pub skipped: Vec<String>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.departures.is_empty() && self.arrivals.is_empty() && self.skipped.is_empty()
    }
}

/// Everything needed to start local applications for arriving vehicles.
pub struct Launcher {
    pub factory: Arc<dyn ApplicationFactory>,
    pub gateway: Arc<RpcGateway>,
    pub bus: Arc<dyn Bus>,
    pub call_timeout: Duration,
    /// Grace period for an application to stop when its vehicle leaves.
    pub stop_timeout: Duration,
}

// ---------------------------------------------------------------------------
// VehicleRegistry
// ---------------------------------------------------------------------------

/// The live vehicle set and its node assignments.
pub struct VehicleRegistry {
    allocator: NodeAllocator,
    records: BTreeMap<NodeId, VehicleRecord>,
    by_sumo: HashMap<String, NodeId>,
    /// Unplaced vehicles already warned about.
    waiting: HashSet<String>,
    application: String,
    default_parameters: String,
    launcher: Option<Launcher>,
    holding: bool,
}

impl VehicleRegistry {
    /// A registry over a pool of `capacity` nodes. `application` and
    /// `default_parameters` describe what each node should run.
    pub fn new(
        capacity: u32,
        application: impl Into<String>,
        default_parameters: impl Into<String>,
    ) -> Self {
        Self {
            allocator: NodeAllocator::new(capacity),
            records: BTreeMap::new(),
            by_sumo: HashMap::new(),
            waiting: HashSet::new(),
            application: application.into(),
            default_parameters: default_parameters.into(),
            launcher: None,
            holding: false,
        }
    }

    /// Start a local application for every vehicle placed from now on.
    pub fn set_launcher(&mut self, launcher: Launcher) {
        self.application = launcher.factory.name().to_string();
        self.launcher = Some(launcher);
    }

    /// Register vehicles without starting their applications until
    /// [`VehicleRegistry::start_applications`].
    pub fn hold_applications(&mut self) {
        self.holding = true;
    }

    /// Launch the applications of vehicles registered while held. Returns
    /// how many were started.
    pub fn start_applications(&mut self) -> usize {
        self.holding = false;
        let held: Vec<(NodeId, String, String)> = self
            .records
            .values()
            .filter(|r| r.awaiting_start)
            .map(|r| (r.node_id, r.sumo_id.clone(), r.parameters.clone()))
            .collect();
        let mut started = 0;
        for (node_id, sumo_id, parameters) in held {
            let application = self.launch(&sumo_id, node_id, &parameters);
            started += usize::from(application.is_some());
            if let Some(record) = self.records.get_mut(&node_id) {
                record.awaiting_start = false;
                record.application = application;
            }
        }
        if started > 0 {
            info!(started, "applications started");
        }
        started
    }

    /// Application name advertised to the testbed.
    pub fn application(&self) -> &str {
        &self.application
    }

    /// Bring the registry in line with the simulator.
    ///
    /// `live` lists every vehicle now in the simulation, in insertion order.
    /// `reused` lists vehicles removed and re-inserted under the same id
    /// since the last call; they depart and arrive again. Per-vehicle
    /// parameters come from `parameters_for`, falling back to the defaults.
    pub fn reconcile(
        &mut self,
        live: &[String],
        reused: &[String],
        now: SimTime,
        parameters_for: impl Fn(&str) -> Option<String>,
    ) -> Reconciliation {
        let live_set: HashSet<&str> = live.iter().map(String::as_str).collect();
        let reused_set: HashSet<&str> = reused.iter().map(String::as_str).collect();
        let mut result = Reconciliation::default();

        let leaving: Vec<NodeId> = self
            .records
            .values()
            .filter(|r| {
                !live_set.contains(r.sumo_id.as_str()) || reused_set.contains(r.sumo_id.as_str())
            })
            .map(|r| r.node_id)
            .collect();
        for node_id in leaving {
            if let Some(departure) = self.remove(node_id) {
                result.departures.push(departure);
            }
        }

        self.waiting.retain(|id| live_set.contains(id.as_str()));

        for sumo_id in live {
            if self.by_sumo.contains_key(sumo_id) {
                continue;
            }
            match self.allocator.allocate() {
                Ok(node_id) => {
                    let parameters =
                        parameters_for(sumo_id).unwrap_or_else(|| self.default_parameters.clone());
                    self.insert(sumo_id, node_id, now, parameters.clone());
                    self.waiting.remove(sumo_id);
                    result.arrivals.push(Arrival {
                        sumo_id: sumo_id.clone(),
                        node_id,
                        parameters,
                    });
                }
                Err(exhausted) => {
                    if self.waiting.insert(sumo_id.clone()) {
                        warn!(%sumo_id, %exhausted, "vehicle left without a node");
                    } else {
                        debug!(%sumo_id, "still no free node");
                    }
                    result.skipped.push(sumo_id.clone());
                }
            }
        }
        result
    }

    fn insert(&mut self, sumo_id: &str, node_id: NodeId, now: SimTime, parameters: String) {
        let awaiting_start = self.holding && self.launcher.is_some();
        let application = if awaiting_start {
            None
        } else {
            self.launch(sumo_id, node_id, &parameters)
        };
        info!(%sumo_id, %node_id, "vehicle registered");
        self.by_sumo.insert(sumo_id.to_string(), node_id);
        self.records.insert(
            node_id,
            VehicleRecord {
                sumo_id: sumo_id.to_string(),
                node_id,
                registered_at: now,
                parameters,
                application,
                awaiting_start,
            },
        );
    }

    fn launch(&self, sumo_id: &str, node_id: NodeId, parameters: &str) -> Option<ApplicationHost> {
        let launcher = self.launcher.as_ref()?;
        let info = NodeInfo {
            sumo_id: sumo_id.to_string(),
            node_id,
            application: self.application.clone(),
            parameters: parameters.to_string(),
        };
        let app = match launcher.factory.create(&info) {
            Ok(app) => app,
            Err(fault) => {
                warn!(%sumo_id, %fault, "cannot create application");
                return None;
            }
        };
        let ctx = NodeContext::new(
            info,
            launcher.gateway.clone(),
            launcher.bus.clone(),
            launcher.call_timeout,
        );
        match ApplicationHost::spawn(app, ctx) {
            Ok(host) => Some(host.with_stop_timeout(launcher.stop_timeout)),
            Err(fault) => {
                warn!(%sumo_id, %fault, "cannot start application");
                None
            }
        }
    }

    fn remove(&mut self, node_id: NodeId) -> Option<Departure> {
        let mut record = self.records.remove(&node_id)?;
        self.by_sumo.remove(&record.sumo_id);
        if let Some(host) = record.application.take() {
            host.stop();
        }
        self.allocator.release(node_id);
        info!(sumo_id = %record.sumo_id, %node_id, "vehicle deregistered");
        Some(Departure {
            sumo_id: record.sumo_id,
            node_id,
        })
    }

    /// Deregister every vehicle, stopping their applications. Returns the
    /// departures in node order.
    pub fn teardown_all(&mut self) -> Vec<Departure> {
        let nodes: Vec<NodeId> = self.records.keys().copied().collect();
        nodes
            .into_iter()
            .filter_map(|node_id| self.remove(node_id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    pub fn node_of(&self, sumo_id: &str) -> Option<NodeId> {
        self.by_sumo.get(sumo_id).copied()
    }

    pub fn vehicle_of(&self, node_id: NodeId) -> Option<&str> {
        self.records.get(&node_id).map(|r| r.sumo_id.as_str())
    }

    pub fn get(&self, sumo_id: &str) -> Option<&VehicleRecord> {
        self.node_of(sumo_id).and_then(|id| self.records.get(&id))
    }

    pub fn contains(&self, sumo_id: &str) -> bool {
        self.by_sumo.contains_key(sumo_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in ascending node order.
    pub fn iter(&self) -> impl Iterator<Item = &VehicleRecord> {
        self.records.values()
    }

    pub fn allocator(&self) -> &NodeAllocator {
        &self.allocator
    }

    // -----------------------------------------------------------------------
    // Delivery
    // -----------------------------------------------------------------------

    /// Forward a step to the vehicle's application.
    pub fn deliver_step(&mut self, sumo_id: &str, state: Kinematics) -> bool {
        self.with_application(sumo_id, |host| host.step(state))
    }

    /// Forward a received packet to the vehicle's application.
    pub fn deliver_packet(&mut self, sumo_id: &str, packet: VehicleData) -> bool {
        self.with_application(sumo_id, |host| host.deliver(packet))
    }

    /// Forward an observed API reply to the vehicle's application.
    pub fn deliver_api_return(
        &mut self,
        sumo_id: &str,
        transaction_id: TransactionId,
        response: String,
    ) -> bool {
        self.with_application(sumo_id, |host| host.api_return(transaction_id, response))
    }

    /// Run `post` against the vehicle's application. An application that has
    /// died is detached, leaving the vehicle without one.
    fn with_application(
        &mut self,
        sumo_id: &str,
        post: impl FnOnce(&ApplicationHost) -> bool,
    ) -> bool {
        let Some(node_id) = self.node_of(sumo_id) else {
            return false;
        };
        let Some(record) = self.records.get_mut(&node_id) else {
            return false;
        };
        let Some(host) = record.application.as_ref() else {
            return false;
        };
        if post(host) {
            return true;
        }
        if let Some(host) = record.application.take() {
            warn!(%sumo_id, "application gone, vehicle continues without it");
            host.stop();
        }
        false
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::{ApplicationFault, FnFactory};
    use crate::bus::MemoryBroker;
    use crate::test_utils::{AppEvent, RecordingFactory, ids, kinematics_at};

    fn registry(capacity: u32) -> VehicleRegistry {
        VehicleRegistry::new(capacity, "app", "{}")
    }

    fn no_params(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn arrivals_get_smallest_nodes_in_order() {
        let mut reg = registry(2);
        let r = reg.reconcile(&ids(&["a", "b"]), &[], 0.1, no_params);
        assert_eq!(
            r.arrivals,
            vec![
                Arrival {
                    sumo_id: "a".into(),
                    node_id: NodeId(0),
                    parameters: "{}".into()
                },
                Arrival {
                    sumo_id: "b".into(),
                    node_id: NodeId(1),
                    parameters: "{}".into()
                },
            ]
        );
        assert!(r.departures.is_empty());
        assert_eq!(reg.node_of("b"), Some(NodeId(1)));
        assert_eq!(reg.vehicle_of(NodeId(0)), Some("a"));
    }

    #[test]
    fn exhausted_vehicle_is_skipped_then_placed() {
        let mut reg = registry(2);
        reg.reconcile(&ids(&["a", "b"]), &[], 0.1, no_params);

        let r = reg.reconcile(&ids(&["a", "b", "c"]), &[], 0.2, no_params);
        assert!(r.arrivals.is_empty());
        assert_eq!(r.skipped, vec!["c".to_string()]);
        assert!(!reg.contains("c"));

        // "a" leaves; its node goes to "c" in the same tick.
        let r = reg.reconcile(&ids(&["b", "c"]), &[], 0.3, no_params);
        assert_eq!(
            r.departures,
            vec![Departure {
                sumo_id: "a".into(),
                node_id: NodeId(0)
            }]
        );
        assert_eq!(r.arrivals[0].sumo_id, "c");
        assert_eq!(r.arrivals[0].node_id, NodeId(0));
        assert!(r.skipped.is_empty());
    }

    #[test]
    fn unchanged_set_is_a_no_op() {
        let mut reg = registry(4);
        reg.reconcile(&ids(&["a"]), &[], 0.1, no_params);
        assert!(reg.reconcile(&ids(&["a"]), &[], 0.2, no_params).is_empty());
        assert_eq!(reg.get("a").unwrap().registered_at, 0.1);
    }

    #[test]
    fn reused_id_departs_and_arrives() {
        let mut reg = registry(4);
        reg.reconcile(&ids(&["a", "b"]), &[], 0.1, no_params);
        let r = reg.reconcile(&ids(&["a", "b"]), &ids(&["a"]), 0.2, no_params);
        assert_eq!(r.departures.len(), 1);
        assert_eq!(r.departures[0].sumo_id, "a");
        assert_eq!(r.arrivals.len(), 1);
        assert_eq!(r.arrivals[0].node_id, NodeId(0));
        assert_eq!(reg.get("a").unwrap().registered_at, 0.2);
    }

    #[test]
    fn reused_but_unregistered_id_just_arrives() {
        let mut reg = registry(4);
        let r = reg.reconcile(&ids(&["a"]), &ids(&["a"]), 0.1, no_params);
        assert!(r.departures.is_empty());
        assert_eq!(r.arrivals.len(), 1);
    }

    #[test]
    fn scenario_parameters_override_defaults() {
        let mut reg = registry(4);
        let r = reg.reconcile(&ids(&["p.0", "x"]), &[], 0.0, |id| {
            (id == "p.0").then(|| r#"{"leader":true}"#.to_string())
        });
        assert_eq!(r.arrivals[0].parameters, r#"{"leader":true}"#);
        assert_eq!(r.arrivals[1].parameters, "{}");
        assert_eq!(reg.get("p.0").unwrap().parameters, r#"{"leader":true}"#);
    }

    #[test]
    fn teardown_releases_everything() {
        let mut reg = registry(3);
        reg.reconcile(&ids(&["a", "b", "c"]), &[], 0.0, no_params);
        let gone = reg.teardown_all();
        let nodes: Vec<NodeId> = gone.iter().map(|d| d.node_id).collect();
        assert_eq!(nodes, vec![NodeId(0), NodeId(1), NodeId(2)]);
        assert!(reg.is_empty());
        assert_eq!(reg.allocator().available(), 3);
    }

    // -----------------------------------------------------------------------
    // Applications
    // -----------------------------------------------------------------------

    fn with_recording_apps(reg: &mut VehicleRegistry, broker: &MemoryBroker) -> Arc<RecordingFactory> {
        let factory = Arc::new(RecordingFactory::new());
        let bus: Arc<dyn Bus> = Arc::new(broker.connect());
        reg.set_launcher(Launcher {
            factory: factory.clone(),
            gateway: Arc::new(RpcGateway::new(bus.clone())),
            bus,
            call_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(1),
        });
        factory
    }

    #[test]
    fn applications_follow_vehicle_lifetime() {
        let broker = MemoryBroker::new();
        let mut reg = registry(2);
        let factory = with_recording_apps(&mut reg, &broker);
        assert_eq!(reg.application(), "recording");

        reg.reconcile(&ids(&["a"]), &[], 0.0, no_params);
        assert!(reg.get("a").unwrap().has_application());
        assert!(reg.deliver_step("a", kinematics_at(0.1, 1.0)));
        reg.reconcile(&[], &[], 0.2, no_params);

        assert_eq!(
            factory.log_of("a").unwrap(),
            vec![AppEvent::Start, AppEvent::Step(0.1), AppEvent::Stop]
        );
    }

    #[test]
    fn held_applications_start_on_request() {
        let broker = MemoryBroker::new();
        let mut reg = registry(2);
        reg.hold_applications();
        let factory = with_recording_apps(&mut reg, &broker);

        reg.reconcile(&ids(&["a", "b"]), &[], 0.0, no_params);
        assert!(reg.get("a").unwrap().awaiting_start());
        assert!(!reg.get("a").unwrap().has_application());
        assert!(!reg.deliver_step("a", kinematics_at(0.0, 0.0)));
        assert!(factory.vehicles().is_empty());

        // "b" leaves before the start; only "a" is launched.
        reg.reconcile(&ids(&["a"]), &[], 0.0, no_params);
        assert_eq!(reg.start_applications(), 1);
        assert!(reg.get("a").unwrap().has_application());
        assert!(!reg.get("a").unwrap().awaiting_start());

        // Later arrivals start right away.
        reg.reconcile(&ids(&["a", "c"]), &[], 0.1, no_params);
        assert!(reg.get("c").unwrap().has_application());
        reg.teardown_all();
        assert_eq!(factory.log_of("a").unwrap(), vec![AppEvent::Start, AppEvent::Stop]);
        assert!(factory.log_of("b").is_none());
    }

    #[test]
    fn failed_creation_leaves_vehicle_unattached() {
        let broker = MemoryBroker::new();
        let mut reg = registry(2);
        let bus: Arc<dyn Bus> = Arc::new(broker.connect());
        reg.set_launcher(Launcher {
            factory: Arc::new(FnFactory::new("broken", |_: &NodeInfo| {
                Err(ApplicationFault::new("no such app"))
            })),
            gateway: Arc::new(RpcGateway::new(bus.clone())),
            bus,
            call_timeout: Duration::from_millis(100),
            stop_timeout: Duration::from_secs(1),
        });
        let r = reg.reconcile(&ids(&["a"]), &[], 0.0, no_params);
        assert_eq!(r.arrivals.len(), 1);
        assert!(!reg.get("a").unwrap().has_application());
        assert!(!reg.deliver_step("a", kinematics_at(0.0, 0.0)));
    }

    #[test]
    fn delivery_to_unknown_vehicle_is_refused() {
        let mut reg = registry(1);
        assert!(!reg.deliver_api_return("ghost", TransactionId(0), "1".into()));
    }
}
