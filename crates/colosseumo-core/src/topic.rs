//! Bus topic names and MQTT-style topic filter matching.
//!
//! The bridge publishes per-tick batches on [`SUMO_UPDATE`] and listens for
//! testbed control on [`COLOSSEUM_UPDATE`]. API calls and replies use one
//! topic per vehicle so a node only receives traffic addressed to it.

/// Per-tick batches of envelopes, bridge to testbed.
pub const SUMO_UPDATE: &str = "sumo/update";

/// Control messages (start/stop, data requests), testbed to bridge.
pub const COLOSSEUM_UPDATE: &str = "colosseum/update";

/// Prefix of the per-vehicle API call topics.
pub const API_CALL_PREFIX: &str = "apicall";

/// Prefix of the per-vehicle API response topics.
pub const API_RESPONSE_PREFIX: &str = "apiresponse";

/// Prefix of the per-vehicle direct communication topics.
pub const DIRECT_COMM_PREFIX: &str = "directcomm";

/// Topic on which `sumo_id` issues API calls.
pub fn api_call(sumo_id: &str) -> String {
    format!("{API_CALL_PREFIX}/{sumo_id}")
}

/// Topic on which `sumo_id` receives API responses.
pub fn api_response(sumo_id: &str) -> String {
    format!("{API_RESPONSE_PREFIX}/{sumo_id}")
}

/// Topic on which `sumo_id` receives packets from other vehicles.
pub fn direct_comm(sumo_id: &str) -> String {
    format!("{DIRECT_COMM_PREFIX}/{sumo_id}")
}

/// Filter matching every vehicle's topic under `prefix`.
pub fn all_under(prefix: &str) -> String {
    format!("{prefix}/+")
}

/// If `topic` is `<prefix>/<id>`, return `<id>`.
pub fn vehicle_suffix<'a>(topic: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest)
    }
}

/// Match a topic against an MQTT filter. `+` matches exactly one level,
/// `#` (only valid as the last level) matches the remaining levels,
/// including none.
pub fn matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
