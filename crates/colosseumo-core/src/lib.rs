//! Colosseumo Core -- the bridge between a traffic simulator and a testbed.
//!
//! This crate couples a stepped road-traffic simulator to a network of
//! radio-capable testbed nodes over a publish/subscribe bus. Simulated
//! vehicles are mapped onto node identifiers, their state is published every
//! step, and node applications reach the simulator through synchronous API
//! calls carried over the asynchronous bus.
//!
//! # Per-Tick Pipeline
//!
//! Each [`step_loop::StepLoop::tick`]:
//!
//! 1. **Advance** -- Step the simulator and run the scenario hook.
//! 2. **Reconcile** -- Diff live vehicles against the registry; departures
//!    release nodes before arrivals claim them.
//! 3. **Report** -- Query kinematics for every vehicle in node order.
//! 4. **Publish** -- Send `[time, deletes, news, positions]` as one batch.
//! 5. **Serve** -- Expire overdue calls, then drain inbound control, API and
//!    packet traffic.
//!
//! # Key Types
//!
//! - [`step_loop::StepLoop`] -- Lifecycle and tick orchestration.
//! - [`registry::VehicleRegistry`] -- Live vehicles and their nodes.
//! - [`allocator::NodeAllocator`] -- Smallest-first node id pool.
//! - [`rpc::RpcGateway`] -- Blocking API calls over the bus.
//! - [`message::Envelope`] -- Typed wire messages and their codec.
//! - [`bus::Bus`] -- Transport seam; [`bus::MemoryBroker`] for in-process use.
//! - [`application::Application`] -- Per-vehicle user code.
//! - [`node::NodeRuntime`] -- Hosts one application on a testbed node.

pub mod allocator;
pub mod application;
pub mod bus;
pub mod config;
pub mod error;
pub mod id;
pub mod message;
pub mod node;
pub mod registry;
pub mod rpc;
pub mod simulator;
pub mod step_loop;
pub mod topic;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
