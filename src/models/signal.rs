//! Signaling records exchanged through the call document.
//!
//! One document per call is overwritten in place for offer, answer and
//! hangup; candidates are appended to a sub-collection. The `type` field is
//! the discriminant, so the record is modelled as a tagged union and
//! validated on the way in.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A document body as stored in the document store.
pub type Document = Map<String, Value>;

/// Wire discriminant of a signaling record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    Offer,
    Answer,
    Hangup,
    IceCandidate,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Offer => "offer",
            MessageType::Answer => "answer",
            MessageType::Hangup => "hangup",
            MessageType::IceCandidate => "ice-candidate",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "offer" => Some(MessageType::Offer),
            "answer" => Some(MessageType::Answer),
            "hangup" => Some(MessageType::Hangup),
            "ice-candidate" => Some(MessageType::IceCandidate),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity candidate, opaque beyond its three required fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u32,
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
}

/// Type-specific part of a signaling record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    Hangup,
    IceCandidate(IceCandidate),
}

impl SignalPayload {
    pub fn message_type(&self) -> MessageType {
        match self {
            SignalPayload::Offer { .. } => MessageType::Offer,
            SignalPayload::Answer { .. } => MessageType::Answer,
            SignalPayload::Hangup => MessageType::Hangup,
            SignalPayload::IceCandidate(_) => MessageType::IceCandidate,
        }
    }
}

/// Reasons a stored record is rejected as malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("record is not a JSON object")]
    NotAnObject,

    #[error("unknown record type: {0}")]
    UnknownType(String),

    #[error("missing required field `{field}` for {kind} record")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("malformed record: {0}")]
    Malformed(String),
}

/// A validated signaling record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireRecord", into = "WireRecord")]
pub struct SignalingMessage {
    pub from: String,
    pub to: String,
    pub timestamp: i64,
    pub payload: SignalPayload,
}

impl SignalingMessage {
    pub fn offer(from: &str, to: &str, sdp: &str, timestamp: i64) -> Self {
        Self::new(from, to, timestamp, SignalPayload::Offer { sdp: sdp.to_string() })
    }

    pub fn answer(from: &str, to: &str, sdp: &str, timestamp: i64) -> Self {
        Self::new(from, to, timestamp, SignalPayload::Answer { sdp: sdp.to_string() })
    }

    pub fn hangup(from: &str, to: &str, timestamp: i64) -> Self {
        Self::new(from, to, timestamp, SignalPayload::Hangup)
    }

    pub fn candidate(from: &str, to: &str, candidate: IceCandidate, timestamp: i64) -> Self {
        Self::new(from, to, timestamp, SignalPayload::IceCandidate(candidate))
    }

    fn new(from: &str, to: &str, timestamp: i64, payload: SignalPayload) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            timestamp,
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.payload.message_type()
    }

    /// Session description carried by offer and answer records.
    pub fn sdp(&self) -> Option<&str> {
        match &self.payload {
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => Some(sdp),
            _ => None,
        }
    }

    /// Whether this record was written by `identity` (a self-echo for that party).
    pub fn is_from(&self, identity: &str) -> bool {
        self.from == identity
    }

    /// Serialize into a store document.
    pub fn to_map(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("type".into(), Value::from(self.message_type().as_str()));
        doc.insert("from".into(), Value::from(self.from.as_str()));
        doc.insert("to".into(), Value::from(self.to.as_str()));
        match &self.payload {
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => {
                doc.insert("sdp".into(), Value::from(sdp.as_str()));
            }
            SignalPayload::Hangup => {}
            SignalPayload::IceCandidate(c) => {
                doc.insert("candidate".into(), Value::from(c.candidate.as_str()));
                doc.insert("sdpMLineIndex".into(), Value::from(c.sdp_m_line_index));
                doc.insert("sdpMid".into(), Value::from(c.sdp_mid.as_str()));
            }
        }
        doc.insert("timestamp".into(), Value::from(self.timestamp));
        doc
    }

    /// Rebuild and validate a record from a store document.
    pub fn from_map(doc: &Document) -> Result<Self, ProtocolError> {
        let wire: WireRecord = serde_json::from_value(Value::Object(doc.clone()))
            .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
        Self::try_from(wire)
    }

    /// Same as [`from_map`](Self::from_map) for an arbitrary JSON value.
    pub fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        match value {
            Value::Object(doc) => Self::from_map(doc),
            _ => Err(ProtocolError::NotAnObject),
        }
    }
}

/// Flat on-the-wire shape. Every field is optional here; validation
/// happens in the `TryFrom` conversion so a bad record yields a
/// `ProtocolError` naming the missing field.
#[derive(Debug, Default, Serialize, Deserialize)]
struct WireRecord {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    sdp_m_line_index: Option<u32>,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    sdp_mid: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
}

impl TryFrom<WireRecord> for SignalingMessage {
    type Error = ProtocolError;

    fn try_from(wire: WireRecord) -> Result<Self, Self::Error> {
        let kind_str = wire.kind.ok_or(ProtocolError::MissingField {
            kind: "signaling",
            field: "type",
        })?;
        let kind =
            MessageType::parse(&kind_str).ok_or(ProtocolError::UnknownType(kind_str.clone()))?;
        let kind_name = kind.as_str();

        let from = wire.from.ok_or(ProtocolError::MissingField {
            kind: kind_name,
            field: "from",
        })?;
        if from.is_empty() {
            return Err(ProtocolError::EmptyField("from"));
        }
        let to = wire.to.ok_or(ProtocolError::MissingField {
            kind: kind_name,
            field: "to",
        })?;

        let required_sdp = |sdp: Option<String>| -> Result<String, ProtocolError> {
            let sdp = sdp.ok_or(ProtocolError::MissingField {
                kind: kind_name,
                field: "sdp",
            })?;
            if sdp.is_empty() {
                return Err(ProtocolError::EmptyField("sdp"));
            }
            Ok(sdp)
        };

        let payload = match kind {
            MessageType::Offer => SignalPayload::Offer {
                sdp: required_sdp(wire.sdp)?,
            },
            MessageType::Answer => SignalPayload::Answer {
                sdp: required_sdp(wire.sdp)?,
            },
            MessageType::Hangup => SignalPayload::Hangup,
            MessageType::IceCandidate => {
                let candidate = wire.candidate.ok_or(ProtocolError::MissingField {
                    kind: kind_name,
                    field: "candidate",
                })?;
                if candidate.is_empty() {
                    return Err(ProtocolError::EmptyField("candidate"));
                }
                let sdp_m_line_index = wire.sdp_m_line_index.ok_or(ProtocolError::MissingField {
                    kind: kind_name,
                    field: "sdpMLineIndex",
                })?;
                let sdp_mid = wire.sdp_mid.ok_or(ProtocolError::MissingField {
                    kind: kind_name,
                    field: "sdpMid",
                })?;
                SignalPayload::IceCandidate(IceCandidate {
                    candidate,
                    sdp_m_line_index,
                    sdp_mid,
                })
            }
        };

        Ok(SignalingMessage {
            from,
            to,
            timestamp: wire.timestamp.unwrap_or_default(),
            payload,
        })
    }
}

impl From<SignalingMessage> for WireRecord {
    fn from(msg: SignalingMessage) -> Self {
        let mut wire = WireRecord {
            kind: Some(msg.message_type().as_str().to_string()),
            from: Some(msg.from),
            to: Some(msg.to),
            timestamp: Some(msg.timestamp),
            ..Default::default()
        };
        match msg.payload {
            SignalPayload::Offer { sdp } | SignalPayload::Answer { sdp } => wire.sdp = Some(sdp),
            SignalPayload::Hangup => {}
            SignalPayload::IceCandidate(c) => {
                wire.candidate = Some(c.candidate);
                wire.sdp_m_line_index = Some(c.sdp_m_line_index);
                wire.sdp_mid = Some(c.sdp_mid);
            }
        }
        wire
    }
}
