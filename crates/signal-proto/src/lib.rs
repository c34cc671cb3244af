//! Wire model for everything two call participants exchange over the relay.
//! Kept in its own crate so relay servers and test harnesses can speak the
//! format without pulling in the media stack.
//!
//! Messages are JSON objects routed by their `type` field:
//!
//! ```json
//! {"type": "offer", "data": {"type": "offer", "sdp": "v=0..."}, "session_id": "..."}
//! {"type": "answer", "data": {"type": "answer", "sdp": "v=0..."}}
//! {"type": "ice_candidate", "data": {"candidate": "candidate:...", "sdpMid": "0"}}
//! {"type": "chat_message", "sender": "alice", "message": "hi"}
//! {"type": "chat_history", "messages": [{"sender": "alice", "message": "hi"}]}
//! ```

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Tags this crate knows how to route.
pub const KNOWN_TAGS: [&str; 5] = [
    "chat_message",
    "chat_history",
    "offer",
    "answer",
    "ice_candidate",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown signaling message type `{0}`")]
    UnknownTag(String),
    #[error("malformed signaling payload: {0}")]
    MalformedPayload(String),
}

#[derive(Debug, Error)]
#[error("failed to encode signaling message: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Identifies one side of one call. Compared lexicographically when both
/// sides offer at the same time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque session description. Whatever the media stack produced is carried
/// verbatim; only the requirement that it is a JSON object is enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionDescription(Map<String, Value>);

impl SessionDescription {
    /// Builds the `{type, sdp}` shape browsers and webrtc-rs both use.
    pub fn new(kind: &str, sdp: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("type".into(), Value::String(kind.to_string()));
        map.insert("sdp".into(), Value::String(sdp.into()));
        Self(map)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for SessionDescription {
    type Error = DecodeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DecodeError::MalformedPayload(format!(
                "session description must be an object, got {other}"
            ))),
        }
    }
}

/// Opaque connectivity candidate, one possible network path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectivityCandidate(Map<String, Value>);

impl ConnectivityCandidate {
    /// Builds a candidate carrying only the SDP `candidate:` line.
    pub fn from_line(line: impl Into<String>) -> Self {
        let mut map = Map::new();
        map.insert("candidate".into(), Value::String(line.into()));
        Self(map)
    }

    /// The `candidate:` line, when present. Used for logging only.
    pub fn line(&self) -> Option<&str> {
        self.0.get("candidate").and_then(Value::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for ConnectivityCandidate {
    type Error = DecodeError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(DecodeError::MalformedPayload(format!(
                "candidate must be an object, got {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatEntry {
    #[serde(default)]
    pub sender: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    ChatMessage {
        #[serde(default)]
        sender: String,
        #[serde(rename = "message")]
        body: String,
    },
    ChatHistory {
        messages: Vec<ChatEntry>,
    },
    Offer {
        #[serde(rename = "data")]
        description: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },
    Answer {
        #[serde(rename = "data")]
        description: SessionDescription,
    },
    IceCandidate {
        #[serde(rename = "data")]
        candidate: ConnectivityCandidate,
    },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::ChatMessage { .. } => "chat_message",
            SignalingMessage::ChatHistory { .. } => "chat_history",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice_candidate",
        }
    }
}

pub fn encode(message: &SignalingMessage) -> Result<Bytes, EncodeError> {
    Ok(Bytes::from(serde_json::to_vec(message)?))
}

pub fn decode(bytes: &[u8]) -> Result<SignalingMessage, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|err| DecodeError::MalformedPayload(err.to_string()))?;
    let Some(tag) = value.get("type").and_then(Value::as_str) else {
        return Err(DecodeError::MalformedPayload(
            "missing string `type` field".into(),
        ));
    };
    if !KNOWN_TAGS.contains(&tag) {
        return Err(DecodeError::UnknownTag(tag.to_string()));
    }
    serde_json::from_value(value).map_err(|err| DecodeError::MalformedPayload(err.to_string()))
}
