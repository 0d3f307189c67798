//! Event envelopes exchanged between services.
//!
//! An envelope is metadata (id, type tag, schema version, content type) plus
//! an opaque JSON body. The type tag travels next to the body, never inside
//! it, so a payload is exactly what its schema describes.

pub mod payload;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::EventId;

pub use payload::{TaskAssigned, TaskCompleted, TaskCreated, UserCreated};

/// Version of every schema currently in use. No negotiation.
pub const SCHEMA_VERSION: u32 = 1;

/// Content type tag carried on every message.
pub const CONTENT_TYPE: &str = "text/plain";

/// The closed set of event types in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    UserCreated,
    TaskCreated,
    TaskAssigned,
    TaskCompleted,
}

impl EventType {
    pub const ALL: [EventType; 4] = [
        EventType::UserCreated,
        EventType::TaskCreated,
        EventType::TaskAssigned,
        EventType::TaskCompleted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EventType::UserCreated => "user_created",
            EventType::TaskCreated => "task_created",
            EventType::TaskAssigned => "task_assigned",
            EventType::TaskCompleted => "task_completed",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownEventType(s.to_string()))
    }
}

/// A typed payload bound to exactly one event type.
pub trait EventPayload: Serialize + DeserializeOwned {
    const EVENT_TYPE: EventType;
}

/// Tagged, versioned message unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Absent only for messages from producers that do not stamp ids.
    pub event_id: Option<EventId>,
    pub event_type: EventType,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,
    /// JSON text.
    pub payload: Vec<u8>,
}

/// Wire form of an envelope as stored in a queue.
#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    event_id: Option<EventId>,
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default = "default_version")]
    schema_version: u32,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default = "Utc::now")]
    occurred_at: DateTime<Utc>,
    body: String,
}

fn default_version() -> u32 {
    SCHEMA_VERSION
}

impl Envelope {
    /// Serialize a typed payload into a fresh envelope with a new event id.
    pub fn new<P: EventPayload>(payload: &P) -> Result<Self> {
        Ok(Self {
            event_id: Some(EventId::new()),
            event_type: P::EVENT_TYPE,
            schema_version: SCHEMA_VERSION,
            occurred_at: Utc::now(),
            payload: serde_json::to_vec(payload)?,
        })
    }

    /// Wrap raw JSON bytes. Used when the payload comes from outside, e.g. an
    /// operator publishing by hand; the bytes are not checked here.
    pub fn from_raw(event_type: EventType, payload: Vec<u8>) -> Self {
        Self {
            event_id: Some(EventId::new()),
            event_type,
            schema_version: SCHEMA_VERSION,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Decode the body as `P`, rejecting a type-tag mismatch and unknown or
    /// missing fields.
    pub fn decode<P: EventPayload>(&self) -> Result<P> {
        if self.event_type != P::EVENT_TYPE {
            return Err(Error::contract(
                self.event_type.as_str(),
                format!("expected {} payload", P::EVENT_TYPE),
            ));
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| Error::contract(self.event_type.as_str(), e.to_string()))
    }

    /// Encode for the broker.
    pub fn to_message(&self) -> Result<serde_json::Value> {
        let body = String::from_utf8(self.payload.clone())
            .map_err(|e| Error::contract(self.event_type.as_str(), format!("body is not utf-8: {e}")))?;
        let wire = WireMessage {
            event_id: self.event_id,
            event_type: self.event_type.as_str().to_string(),
            schema_version: self.schema_version,
            content_type: Some(CONTENT_TYPE.to_string()),
            occurred_at: self.occurred_at,
            body,
        };
        Ok(serde_json::to_value(wire)?)
    }

    /// Decode a broker message. Fails on a malformed frame, an unknown type
    /// tag, or a schema version this build does not speak.
    pub fn from_message(message: &serde_json::Value) -> Result<Self> {
        let wire: WireMessage = serde_json::from_value(message.clone())?;
        let event_type: EventType = wire.event_type.parse()?;
        if wire.schema_version != SCHEMA_VERSION {
            return Err(Error::contract(
                event_type.as_str(),
                format!("unsupported schema version {}", wire.schema_version),
            ));
        }
        Ok(Self {
            event_id: wire.event_id,
            event_type,
            schema_version: wire.schema_version,
            occurred_at: wire.occurred_at,
            payload: wire.body.into_bytes(),
        })
    }
}
