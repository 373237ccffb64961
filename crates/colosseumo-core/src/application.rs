//! Per-vehicle node applications and the worker threads hosting them.
//!
//! An [`Application`] is user code bound to one vehicle. It reacts to
//! lifecycle events and reaches the simulator only through
//! [`NodeContext::call_api`], which blocks on the RPC gateway. Each instance
//! runs on its own worker thread behind an [`ApplicationHost`], so a hook
//! that blocks on a call never stalls the step loop.
//!
//! A hook that returns an [`ApplicationFault`] or panics ends its
//! application. The fault is logged and the vehicle carries on without one.
//! A worker that does not stop within its stop timeout is detached and left
//! to finish on its own.
//!
//! Step events coalesce: a worker still busy with an earlier step sees only
//! the newest state once it catches up. Packets and API replies are queued
//! in full.

use crate::bus::{Bus, BusError};
use crate::id::{NodeId, TransactionId};
use crate::message::{DecodeError, Envelope, VehicleData};
use crate::rpc::{CallError, RpcGateway};
use crate::simulator::Kinematics;
use crate::topic;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// How often [`ApplicationHost::stop`] re-aborts calls while waiting for the
/// worker to exit.
const STOP_POLL: Duration = Duration::from_millis(2);

/// Stop timeout of a host built without [`ApplicationHost::with_stop_timeout`].
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An application hook failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("application fault: {0}")]
pub struct ApplicationFault(pub String);

impl ApplicationFault {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<CallError> for ApplicationFault {
    fn from(err: CallError) -> Self {
        Self(err.to_string())
    }
}

impl From<BusError> for ApplicationFault {
    fn from(err: BusError) -> Self {
        Self(err.to_string())
    }
}

impl From<DecodeError> for ApplicationFault {
    fn from(err: DecodeError) -> Self {
        Self(err.to_string())
    }
}

impl From<serde_json::Error> for ApplicationFault {
    fn from(err: serde_json::Error) -> Self {
        Self(format!("bad JSON: {err}"))
    }
}

// ---------------------------------------------------------------------------
// Application traits
// ---------------------------------------------------------------------------

/// Identity of the vehicle and node an application is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub sumo_id: String,
    pub node_id: NodeId,
    /// Name of the application to run.
    pub application: String,
    /// JSON-encoded application parameters.
    pub parameters: String,
}

/// User code attached to one vehicle. Every hook has a no-op default.
pub trait Application: Send {
    /// Called once on the worker thread before any other hook.
    fn on_start(&mut self, ctx: &NodeContext) -> Result<(), ApplicationFault> {
        let _ = ctx;
        Ok(())
    }

    /// Called after each simulation step with the vehicle's fresh state.
    fn on_step(&mut self, ctx: &NodeContext, state: &Kinematics) -> Result<(), ApplicationFault> {
        let _ = (ctx, state);
        Ok(())
    }

    /// A packet from another vehicle arrived.
    fn on_receive(
        &mut self,
        ctx: &NodeContext,
        packet: &VehicleData,
    ) -> Result<(), ApplicationFault> {
        let _ = (ctx, packet);
        Ok(())
    }

    /// An API reply for this vehicle was observed on the bus. Blocking
    /// callers already got the value from [`NodeContext::call_api`]; this is
    /// a notification.
    fn on_api_return(
        &mut self,
        ctx: &NodeContext,
        transaction_id: TransactionId,
        response: &str,
    ) -> Result<(), ApplicationFault> {
        let _ = (ctx, transaction_id, response);
        Ok(())
    }

    /// Called once when the vehicle leaves or the simulation ends.
    fn on_stop(&mut self, ctx: &NodeContext) -> Result<(), ApplicationFault> {
        let _ = ctx;
        Ok(())
    }
}

/// Builds application instances by name.
pub trait ApplicationFactory: Send + Sync {
    /// Name advertised in `new_vehicle` messages.
    fn name(&self) -> &str;

    fn create(&self, info: &NodeInfo) -> Result<Box<dyn Application>, ApplicationFault>;
}

/// An [`ApplicationFactory`] backed by a closure.
pub struct FnFactory<F> {
    name: String,
    build: F,
}

impl<F> FnFactory<F>
where
    F: Fn(&NodeInfo) -> Result<Box<dyn Application>, ApplicationFault> + Send + Sync,
{
    pub fn new(name: impl Into<String>, build: F) -> Self {
        Self {
            name: name.into(),
            build,
        }
    }
}

impl<F> ApplicationFactory for FnFactory<F>
where
    F: Fn(&NodeInfo) -> Result<Box<dyn Application>, ApplicationFault> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn create(&self, info: &NodeInfo) -> Result<Box<dyn Application>, ApplicationFault> {
        (self.build)(info)
    }
}

// ---------------------------------------------------------------------------
// NodeContext
// ---------------------------------------------------------------------------

/// What an application can reach: its identity, the simulator API, and the
/// direct-communication channel to other vehicles.
pub struct NodeContext {
    info: NodeInfo,
    gateway: Arc<RpcGateway>,
    bus: Arc<dyn Bus>,
    call_timeout: Duration,
}

impl NodeContext {
    pub fn new(
        info: NodeInfo,
        gateway: Arc<RpcGateway>,
        bus: Arc<dyn Bus>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            info,
            gateway,
            bus,
            call_timeout,
        }
    }

    pub fn info(&self) -> &NodeInfo {
        &self.info
    }

    pub fn sumo_id(&self) -> &str {
        &self.info.sumo_id
    }

    pub fn node_id(&self) -> NodeId {
        self.info.node_id
    }

    pub fn parameters(&self) -> &str {
        &self.info.parameters
    }

    /// Invoke a simulator API for this vehicle and wait for the answer.
    pub fn call_api(&self, api_code: &str, parameters: &str) -> Result<String, CallError> {
        self.gateway
            .call(&self.info.sumo_id, api_code, parameters, self.call_timeout)
    }

    /// Send `packet` to vehicle `recipient` over the direct-communication
    /// topic. Sender and recipient fields are filled in.
    pub fn transmit(&self, recipient: &str, mut packet: VehicleData) -> Result<(), BusError> {
        packet.sender = Some(self.info.sumo_id.clone());
        packet.recipient = Some(recipient.to_string());
        debug!(from = %self.info.sumo_id, to = recipient, "transmitting packet");
        self.bus
            .publish_envelope(&topic::direct_comm(recipient), &Envelope::VehicleData(packet))
    }
}

// ---------------------------------------------------------------------------
// ApplicationHost
// ---------------------------------------------------------------------------

enum HostEvent {
    /// The newest state is waiting in the host's step slot.
    Step,
    Receive(VehicleData),
    ApiReturn(TransactionId, String),
    Stop,
}

/// Runs one application on a dedicated worker thread.
pub struct ApplicationHost {
    sumo_id: String,
    events: Sender<HostEvent>,
    latest_step: Arc<Mutex<Option<Kinematics>>>,
    gateway: Arc<RpcGateway>,
    running: Arc<AtomicBool>,
    stop_timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ApplicationHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationHost")
            .field("sumo_id", &self.sumo_id)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ApplicationHost {
    /// Start `app` on a new thread. `on_start` runs first, on that thread.
    pub fn spawn(app: Box<dyn Application>, ctx: NodeContext) -> Result<Self, ApplicationFault> {
        let (events, inbox) = channel::unbounded();
        let running = Arc::new(AtomicBool::new(true));
        let sumo_id = ctx.sumo_id().to_string();
        let gateway = ctx.gateway.clone();
        let latest_step = Arc::new(Mutex::new(None));

        let worker = {
            let running = running.clone();
            let latest_step = latest_step.clone();
            thread::Builder::new()
                .name(format!("app-{}", ctx.node_id()))
                .spawn(move || {
                    run_worker(app, &ctx, &inbox, &latest_step);
                    running.store(false, Ordering::Release);
                })
                .map_err(|e| ApplicationFault(format!("cannot spawn worker: {e}")))?
        };

        Ok(Self {
            sumo_id,
            events,
            latest_step,
            gateway,
            running,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            worker: Some(worker),
        })
    }

    /// How long [`ApplicationHost::stop`] waits for the worker to exit.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn sumo_id(&self) -> &str {
        &self.sumo_id
    }

    /// Whether the application is still alive. Goes false after a fault.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Post a step event, replacing one the worker has not picked up yet.
    /// Returns false if the application is gone.
    pub fn step(&self, state: Kinematics) -> bool {
        if !self.is_running() {
            return false;
        }
        let superseded = self.latest_step.lock().replace(state).is_some();
        superseded || self.post(HostEvent::Step)
    }

    /// Post a received packet. Returns false if the application is gone.
    pub fn deliver(&self, packet: VehicleData) -> bool {
        self.post(HostEvent::Receive(packet))
    }

    /// Post an observed API reply. Returns false if the application is gone.
    pub fn api_return(&self, transaction_id: TransactionId, response: String) -> bool {
        self.post(HostEvent::ApiReturn(transaction_id, response))
    }

    fn post(&self, event: HostEvent) -> bool {
        self.is_running() && self.events.send(event).is_ok()
    }

    /// Run `on_stop` and wait up to the stop timeout for the worker to
    /// exit. Calls the application is blocked on are aborted so the worker
    /// can reach the stop event. A worker still busy at the deadline is
    /// detached.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.events.send(HostEvent::Stop);
        let deadline = Instant::now().checked_add(self.stop_timeout);
        while !worker.is_finished() {
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                warn!(
                    sumo_id = %self.sumo_id,
                    timeout = ?self.stop_timeout,
                    "application did not stop in time, detaching it"
                );
                self.running.store(false, Ordering::Release);
                return;
            }
            self.gateway.abort_vehicle(&self.sumo_id);
            thread::sleep(STOP_POLL);
        }
        if worker.join().is_err() {
            warn!(sumo_id = %self.sumo_id, "application worker panicked");
        }
        debug!(sumo_id = %self.sumo_id, "application stopped");
    }
}

impl Drop for ApplicationHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

enum HookOutcome {
    Ok,
    Faulted,
    Panicked,
}

fn guarded(
    ctx: &NodeContext,
    hook: &'static str,
    run: impl FnOnce() -> Result<(), ApplicationFault>,
) -> HookOutcome {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) => HookOutcome::Ok,
        Ok(Err(fault)) => {
            error!(sumo_id = %ctx.sumo_id(), hook, %fault, "application hook failed");
            HookOutcome::Faulted
        }
        Err(_) => {
            error!(sumo_id = %ctx.sumo_id(), hook, "application hook panicked");
            HookOutcome::Panicked
        }
    }
}

fn run_worker(
    mut app: Box<dyn Application>,
    ctx: &NodeContext,
    inbox: &Receiver<HostEvent>,
    latest_step: &Mutex<Option<Kinematics>>,
) {
    let mut outcome = guarded(ctx, "on_start", || app.on_start(ctx));
    while matches!(outcome, HookOutcome::Ok) {
        // A closed channel means the host is gone; treat it as a stop.
        let event = inbox.recv().unwrap_or(HostEvent::Stop);
        outcome = match event {
            HostEvent::Step => {
                let state = latest_step.lock().take();
                match state {
                    Some(state) => guarded(ctx, "on_step", || app.on_step(ctx, &state)),
                    None => HookOutcome::Ok,
                }
            }
            HostEvent::Receive(packet) => {
                guarded(ctx, "on_receive", || app.on_receive(ctx, &packet))
            }
            HostEvent::ApiReturn(id, response) => guarded(ctx, "on_api_return", || {
                app.on_api_return(ctx, id, &response)
            }),
            HostEvent::Stop => break,
        };
    }
    // No stop hook after a panic: the instance may be half-updated.
    if !matches!(outcome, HookOutcome::Panicked) {
        guarded(ctx, "on_stop", || app.on_stop(ctx));
    }
}

// ===========================================================================
// Tests
// ===========================================================================
