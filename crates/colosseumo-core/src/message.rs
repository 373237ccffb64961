//! Typed message envelopes and their JSON wire format.
//!
//! Every unit exchanged on the bus is an envelope of the form
//! `{"type": <kind>, "content": {...}}`. Per-tick updates are published as a
//! JSON array of envelopes (a [`Batch`]); control and API traffic travels as
//! single envelopes.
//!
//! Decoding is strict about the payload schema: the `type` must be one of
//! [`MessageType`], and `content` must carry every required field with the
//! right scalar kind. Integer fields reject floats and strings; float fields
//! accept integers. Unknown extra fields are ignored. A failed decode yields a
//! [`DecodeError`] carrying the raw payload, never a partial envelope.

use crate::id::{NodeId, SimTime, TransactionId};
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

// ---------------------------------------------------------------------------
// Message types
// ---------------------------------------------------------------------------

/// Discriminant of an envelope, as carried in its `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Time,
    NewVehicle,
    DeleteVehicle,
    UpdatePosition,
    VehicleData,
    StartSimulation,
    StopSimulation,
    ApiCall,
    ApiReturn,
}

impl MessageType {
    /// Every message type, in protocol table order.
    pub const ALL: [MessageType; 9] = [
        MessageType::Time,
        MessageType::NewVehicle,
        MessageType::DeleteVehicle,
        MessageType::UpdatePosition,
        MessageType::VehicleData,
        MessageType::StartSimulation,
        MessageType::StopSimulation,
        MessageType::ApiCall,
        MessageType::ApiReturn,
    ];

    /// The wire name of this type.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Time => "time",
            MessageType::NewVehicle => "new_vehicle",
            MessageType::DeleteVehicle => "delete_vehicle",
            MessageType::UpdatePosition => "update_position",
            MessageType::VehicleData => "vehicle_data",
            MessageType::StartSimulation => "start_simulation",
            MessageType::StopSimulation => "stop_simulation",
            MessageType::ApiCall => "api_call",
            MessageType::ApiReturn => "api_return",
        }
    }

    /// Parse a wire name. Returns `None` for unknown types.
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Current simulation time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrentTime {
    pub time: SimTime,
}

/// A vehicle entered the simulation and was mapped onto a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewVehicle {
    pub sumo_id: String,
    pub colosseum_id: NodeId,
    /// Application the node should run.
    pub application: String,
    /// JSON-encoded application parameters.
    pub parameters: String,
}

/// A vehicle left the simulation; its node is released.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteVehicle {
    pub sumo_id: String,
    pub colosseum_id: NodeId,
}

/// Position of the vehicle hosted on a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionUpdate {
    pub colosseum_id: NodeId,
    pub x: f64,
    pub y: f64,
    /// Coordinate reference system, present only for geo coordinates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crs: Option<String>,
}

/// Kinematic snapshot of a vehicle.
///
/// Outbound it answers a data request. With `sender` set it is a packet one
/// vehicle transmitted to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleData {
    pub sumo_id: String,
    pub controller_acceleration: f64,
    pub acceleration: f64,
    pub speed: f64,
    pub time: SimTime,
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// Beacon sequence number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seqn: Option<u64>,
    /// Wall-clock transmit timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
}

impl VehicleData {
    /// Whether this is a packet relayed between vehicles rather than a data
    /// request or answer.
    pub fn is_packet(&self) -> bool {
        self.sender.is_some()
    }
}

/// A node application invokes a simulator API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCall {
    pub sumo_id: String,
    pub api_code: String,
    pub transaction_id: TransactionId,
    /// JSON-encoded call parameters.
    pub parameters: String,
}

/// The simulator's answer to an [`ApiCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiReturn {
    pub sumo_id: String,
    pub api_code: String,
    pub transaction_id: TransactionId,
    /// JSON-encoded result.
    pub response: String,
}

#[derive(Serialize)]
struct EmptyContent {}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One typed protocol message. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Time(CurrentTime),
    NewVehicle(NewVehicle),
    DeleteVehicle(DeleteVehicle),
    UpdatePosition(PositionUpdate),
    VehicleData(VehicleData),
    StartSimulation,
    StopSimulation,
    ApiCall(ApiCall),
    ApiReturn(ApiReturn),
}

impl Envelope {
    /// Shorthand for a `time` envelope.
    pub fn time(time: SimTime) -> Self {
        Envelope::Time(CurrentTime { time })
    }

    /// The discriminant of this envelope.
    pub fn kind(&self) -> MessageType {
        match self {
            Envelope::Time(_) => MessageType::Time,
            Envelope::NewVehicle(_) => MessageType::NewVehicle,
            Envelope::DeleteVehicle(_) => MessageType::DeleteVehicle,
            Envelope::UpdatePosition(_) => MessageType::UpdatePosition,
            Envelope::VehicleData(_) => MessageType::VehicleData,
            Envelope::StartSimulation => MessageType::StartSimulation,
            Envelope::StopSimulation => MessageType::StopSimulation,
            Envelope::ApiCall(_) => MessageType::ApiCall,
            Envelope::ApiReturn(_) => MessageType::ApiReturn,
        }
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Envelope", 2)?;
        state.serialize_field("type", self.kind().as_str())?;
        match self {
            Envelope::Time(c) => state.serialize_field("content", c)?,
            Envelope::NewVehicle(c) => state.serialize_field("content", c)?,
            Envelope::DeleteVehicle(c) => state.serialize_field("content", c)?,
            Envelope::UpdatePosition(c) => state.serialize_field("content", c)?,
            Envelope::VehicleData(c) => state.serialize_field("content", c)?,
            Envelope::StartSimulation | Envelope::StopSimulation => {
                state.serialize_field("content", &EmptyContent {})?
            }
            Envelope::ApiCall(c) => state.serialize_field("content", c)?,
            Envelope::ApiReturn(c) => state.serialize_field("content", c)?,
        }
        state.end()
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can occur while encoding.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeReason {
    #[error("malformed JSON: {0}")]
    Malformed(String),
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("missing content for {0}")]
    MissingContent(MessageType),
    #[error("invalid {kind} content: {detail}")]
    InvalidContent { kind: MessageType, detail: String },
    #[error("expected {expected}, got {found}")]
    UnexpectedType {
        expected: MessageType,
        found: MessageType,
    },
}

/// A payload that failed to decode, with the raw bytes (lossily decoded as
/// UTF-8) kept for logging.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot decode {raw:?}: {reason}")]
pub struct DecodeError {
    pub raw: String,
    pub reason: DecodeReason,
}

impl DecodeError {
    fn new(raw: &[u8], reason: DecodeReason) -> Self {
        Self {
            raw: String::from_utf8_lossy(raw).into_owned(),
            reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a single envelope.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Encode an ordered sequence of envelopes as one JSON array.
pub fn encode_batch(envelopes: &[Envelope]) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelopes)?)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<serde_json::Value>,
}

fn content_of<T: DeserializeOwned>(
    kind: MessageType,
    content: Option<serde_json::Value>,
) -> Result<T, DecodeReason> {
    let value = content.ok_or(DecodeReason::MissingContent(kind))?;
    serde_json::from_value(value).map_err(|e| DecodeReason::InvalidContent {
        kind,
        detail: e.to_string(),
    })
}

fn from_raw(raw: RawEnvelope) -> Result<Envelope, DecodeReason> {
    let kind = MessageType::from_wire(&raw.kind).ok_or(DecodeReason::UnknownType(raw.kind))?;
    let content = raw.content;
    Ok(match kind {
        MessageType::Time => Envelope::Time(content_of(kind, content)?),
        MessageType::NewVehicle => Envelope::NewVehicle(content_of(kind, content)?),
        MessageType::DeleteVehicle => Envelope::DeleteVehicle(content_of(kind, content)?),
        MessageType::UpdatePosition => Envelope::UpdatePosition(content_of(kind, content)?),
        MessageType::VehicleData => Envelope::VehicleData(content_of(kind, content)?),
        MessageType::StartSimulation => Envelope::StartSimulation,
        MessageType::StopSimulation => Envelope::StopSimulation,
        MessageType::ApiCall => Envelope::ApiCall(content_of(kind, content)?),
        MessageType::ApiReturn => Envelope::ApiReturn(content_of(kind, content)?),
    })
}

/// Decode a single envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::new(bytes, DecodeReason::Malformed(e.to_string())))?;
    from_raw(raw).map_err(|reason| DecodeError::new(bytes, reason))
}

/// Decode a JSON array of envelopes. Any bad element fails the whole batch.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Envelope>, DecodeError> {
    let raws: Vec<RawEnvelope> = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::new(bytes, DecodeReason::Malformed(e.to_string())))?;
    raws.into_iter()
        .map(from_raw)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|reason| DecodeError::new(bytes, reason))
}

/// Decode a JSON-encoded [`VehicleData`] envelope, as carried inside API
/// call parameters and responses.
pub fn decode_vehicle_data(bytes: &[u8]) -> Result<VehicleData, DecodeError> {
    match decode(bytes)? {
        Envelope::VehicleData(data) => Ok(data),
        other => Err(DecodeError::new(
            bytes,
            DecodeReason::UnexpectedType {
                expected: MessageType::VehicleData,
                found: other.kind(),
            },
        )),
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Ordered envelopes collected during one tick and published together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    envelopes: Vec<Envelope>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope, preserving emission order.
    pub fn push(&mut self, envelope: Envelope) {
        self.envelopes.push(envelope);
    }

    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    pub fn envelopes(&self) -> &[Envelope] {
        &self.envelopes
    }

    /// Encode as a JSON array.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        encode_batch(&self.envelopes)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
