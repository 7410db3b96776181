//! Wire message envelope and event type tags.
//!
//! Every message exchanged over the socket is a JSON text frame of the shape
//! `{"type": string, "payload": any, "timestamp": ISO-8601, "id"?: string}`.
//! The payload is carried opaquely; only the `type` tag is interpreted by
//! the client (for dispatch and for the reserved control types).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::Result;

/// Discriminant tag of a wire message.
///
/// Reserved tags cover the client's own control traffic; everything else
/// (job progress, membership changes, content updates, ...) passes through
/// as [`EventType::Event`] with the server's tag string preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    /// Server rejected the bearer token. Forces a client disconnect.
    AuthError,
    /// Server reply to a keepalive ping. Logged only.
    Pong,
    /// Client keepalive, sent on a fixed interval while connected.
    Ping,
    /// Client request to start receiving events for a topic.
    GroupJoin,
    /// Client request to stop receiving events for a topic.
    GroupLeave,
    /// Any other tag, preserved as-is (domain events such as
    /// `JOB_PROGRESS` or `MEMBER_JOINED`).
    Event(String),
}

impl EventType {
    /// The wire spelling of this tag.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::AuthError => "AUTH_ERROR",
            EventType::Pong => "PONG",
            EventType::Ping => "PING",
            EventType::GroupJoin => "GROUP_JOIN",
            EventType::GroupLeave => "GROUP_LEAVE",
            EventType::Event(tag) => tag,
        }
    }
}

impl From<String> for EventType {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "AUTH_ERROR" => EventType::AuthError,
            "PONG" => EventType::Pong,
            "PING" => EventType::Ping,
            "GROUP_JOIN" => EventType::GroupJoin,
            "GROUP_LEAVE" => EventType::GroupLeave,
            _ => EventType::Event(tag),
        }
    }
}

impl From<&str> for EventType {
    fn from(tag: &str) -> Self {
        EventType::from(tag.to_string())
    }
}

impl From<EventType> for String {
    fn from(t: EventType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The typed wrapper around every message exchanged over the socket.
///
/// Immutable once created: inbound envelopes are produced by
/// [`Envelope::decode`], outbound envelopes by [`Envelope::new`] at the
/// moment of sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Message discriminant, used for dispatch.
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Opaque message body, forwarded to handlers without interpretation.
    #[serde(default)]
    pub payload: JsonValue,

    /// Creation instant, ISO-8601 on the wire.
    pub timestamp: DateTime<Utc>,

    /// Optional correlation token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Envelope {
    /// Create an outbound envelope stamped with the current time.
    pub fn new(event_type: EventType, payload: JsonValue) -> Self {
        Self {
            event_type,
            payload,
            timestamp: Utc::now(),
            id: None,
        }
    }

    /// Attach a correlation id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Serialize to the JSON text-frame representation.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse an inbound text frame.
    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
