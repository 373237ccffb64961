//! Synchronous API calls over the asynchronous bus.
//!
//! A node application calls [`RpcGateway::call`] and blocks. The gateway
//! allocates a transaction id, records a pending call, publishes an
//! `api_call` envelope and waits on a one-slot channel. Whoever observes the
//! matching `api_return` (the step loop, or a node runtime's pump) hands it
//! to [`RpcGateway::resolve`], which fills the slot and wakes the caller.
//!
//! ```text
//! ISSUED --publish--> AWAITING --api_return--> RESOLVED
//!                        |------deadline-----> TIMED_OUT
//!                        `------shutdown-----> ABORTED
//! ```
//!
//! Every pending call carries a deadline. The caller's own timed wait and the
//! per-tick [`RpcGateway::expire`] sweep both enforce it, so a call resolves
//! even if one of the two never runs.
//!
//! The transaction table is the only state shared across threads. All
//! inserts, lookups and removals happen under its single mutex, and a slot is
//! filled while that mutex is held, so a caller that times out can tell
//! whether an answer raced in.
//!
//! [`serve_api_call`] is the other half: it runs on the step loop thread and
//! turns an `api_call` into a simulator invocation and an `api_return`.

use crate::bus::Bus;
use crate::id::TransactionId;
use crate::message::{ApiCall, ApiReturn, Envelope};
use crate::simulator::{ApiError, Simulator, SimulatorFault};
use crate::topic;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Response published when the simulator rejects a call.
pub const REJECTED_RESPONSE: &str = "null";

// ---------------------------------------------------------------------------
// Error and outcome types
// ---------------------------------------------------------------------------

/// Why an API call produced no result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CallError {
    #[error("API call timed out")]
    Timeout,
    #[error("API call aborted by shutdown")]
    Aborted,
    #[error("cannot publish API call: {0}")]
    Publish(String),
}

/// What [`RpcGateway::resolve`] did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The pending call was completed and its caller woken.
    Resolved,
    /// No call is pending under that id: a duplicate delivery, or a reply
    /// that arrived after the call timed out or was aborted.
    Unmatched,
    /// A call is pending under that id but for another vehicle. The reply is
    /// ignored and the call keeps waiting.
    WrongVehicle,
}

// ---------------------------------------------------------------------------
// Transaction table
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingCall {
    sumo_id: String,
    api_code: String,
    deadline: Instant,
    slot: Sender<Result<String, CallError>>,
}

impl PendingCall {
    fn complete(self, outcome: Result<String, CallError>) {
        // The slot has capacity one and receives exactly one value.
        let _ = self.slot.try_send(outcome);
    }
}

#[derive(Debug, Default)]
struct CallTable {
    next_id: TransactionId,
    pending: HashMap<TransactionId, PendingCall>,
    closed: bool,
}

impl CallTable {
    /// Next id not currently outstanding. Ids only repeat after the 64-bit
    /// space wraps.
    fn allocate_id(&mut self) -> TransactionId {
        loop {
            let id = self.next_id;
            self.next_id = id.next();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    fn drain_where(&mut self, mut pred: impl FnMut(&PendingCall) -> bool) -> Vec<PendingCall> {
        let ids: Vec<TransactionId> = self
            .pending
            .iter()
            .filter(|(_, call)| pred(call))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// RpcGateway
// ---------------------------------------------------------------------------

/// Turns blocking API calls into `api_call` / `api_return` bus traffic.
pub struct RpcGateway {
    bus: Arc<dyn Bus>,
    table: Mutex<CallTable>,
}

impl std::fmt::Debug for RpcGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcGateway")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

/// Deadlines of calls whose timeout overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `now + timeout`, saturating instead of overflowing.
fn deadline_after(now: Instant, timeout: Duration) -> Instant {
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

impl RpcGateway {
    /// Create a gateway publishing calls on `bus`.
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self {
            bus,
            table: Mutex::new(CallTable::default()),
        }
    }

    /// Invoke `api_code` for `sumo_id` and block until the answer arrives,
    /// the deadline passes, or the gateway shuts down.
    pub fn call(
        &self,
        sumo_id: &str,
        api_code: &str,
        parameters: &str,
        timeout: Duration,
    ) -> Result<String, CallError> {
        let (slot, answer) = channel::bounded(1);
        let deadline = deadline_after(Instant::now(), timeout);

        let transaction_id = {
            let mut table = self.table.lock();
            if table.closed {
                return Err(CallError::Aborted);
            }
            let id = table.allocate_id();
            table.pending.insert(
                id,
                PendingCall {
                    sumo_id: sumo_id.to_string(),
                    api_code: api_code.to_string(),
                    deadline,
                    slot,
                },
            );
            id
        };

        let envelope = Envelope::ApiCall(ApiCall {
            sumo_id: sumo_id.to_string(),
            api_code: api_code.to_string(),
            transaction_id,
            parameters: parameters.to_string(),
        });
        debug!(sumo_id, api_code, %transaction_id, "issuing API call");
        if let Err(e) = self.bus.publish_envelope(&topic::api_call(sumo_id), &envelope) {
            self.table.lock().pending.remove(&transaction_id);
            return Err(CallError::Publish(e.to_string()));
        }

        match answer.recv_deadline(deadline) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                let still_pending = self.table.lock().pending.remove(&transaction_id).is_some();
                if !still_pending {
                    // Completed under the lock before we got it back.
                    if let Ok(outcome) = answer.try_recv() {
                        return outcome;
                    }
                }
                debug!(sumo_id, api_code, %transaction_id, "API call timed out");
                Err(CallError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(CallError::Aborted),
        }
    }

    /// Deliver a reply. The first reply for a transaction wins; later
    /// duplicates are logged and dropped.
    pub fn resolve(&self, reply: &ApiReturn) -> Resolution {
        let mut table = self.table.lock();
        let matches_vehicle = match table.pending.get(&reply.transaction_id) {
            None => {
                debug!(
                    sumo_id = %reply.sumo_id,
                    transaction_id = %reply.transaction_id,
                    "discarding reply with no pending call"
                );
                return Resolution::Unmatched;
            }
            Some(call) => call.sumo_id == reply.sumo_id,
        };
        if !matches_vehicle {
            warn!(
                sumo_id = %reply.sumo_id,
                transaction_id = %reply.transaction_id,
                "reply addressed to another vehicle's transaction"
            );
            return Resolution::WrongVehicle;
        }
        if let Some(call) = table.pending.remove(&reply.transaction_id) {
            if call.api_code != reply.api_code {
                warn!(
                    expected = %call.api_code,
                    got = %reply.api_code,
                    transaction_id = %reply.transaction_id,
                    "reply carries a different API code"
                );
            }
            call.complete(Ok(reply.response.clone()));
        }
        Resolution::Resolved
    }

    /// Time out every call whose deadline is at or before `now`. Returns the
    /// number of calls expired.
    pub fn expire(&self, now: Instant) -> usize {
        let mut table = self.table.lock();
        let expired = table.drain_where(|call| call.deadline <= now);
        let count = expired.len();
        for call in expired {
            debug!(sumo_id = %call.sumo_id, api_code = %call.api_code, "API call expired");
            call.complete(Err(CallError::Timeout));
        }
        count
    }

    /// Abort every call pending for `sumo_id`, e.g. when its vehicle leaves.
    pub fn abort_vehicle(&self, sumo_id: &str) -> usize {
        let mut table = self.table.lock();
        let aborted = table.drain_where(|call| call.sumo_id == sumo_id);
        let count = aborted.len();
        for call in aborted {
            call.complete(Err(CallError::Aborted));
        }
        count
    }

    /// Abort every pending call and refuse new ones.
    pub fn abort_all(&self) -> usize {
        let mut table = self.table.lock();
        table.closed = true;
        let aborted = table.drain_where(|_| true);
        let count = aborted.len();
        for call in aborted {
            call.complete(Err(CallError::Aborted));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.table.lock().closed
    }
}

// ---------------------------------------------------------------------------
// Serving calls
// ---------------------------------------------------------------------------

/// Run `call` against the simulator and build the reply. A rejected call is
/// answered with [`REJECTED_RESPONSE`] so its caller does not wait for the
/// deadline; only a simulator fault is an error.
pub fn serve_api_call<S: Simulator + ?Sized>(
    simulator: &mut S,
    call: &ApiCall,
) -> Result<ApiReturn, SimulatorFault> {
    let response = match simulator.invoke_api(&call.sumo_id, &call.api_code, &call.parameters) {
        Ok(response) => response,
        Err(ApiError::Rejected(reason)) => {
            warn!(
                sumo_id = %call.sumo_id,
                api_code = %call.api_code,
                %reason,
                "simulator rejected API call"
            );
            REJECTED_RESPONSE.to_string()
        }
        Err(ApiError::Fault(fault)) => return Err(fault),
    };
    Ok(ApiReturn {
        sumo_id: call.sumo_id.clone(),
        api_code: call.api_code.clone(),
        transaction_id: call.transaction_id,
        response,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
