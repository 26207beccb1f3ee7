//! Call session models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one call, also the id of its signaling document.
///
/// Format: `call_{epochMillis}_{initiatorId}`. Unique per initiator without
/// any coordination between parties.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id for a call placed by `initiator` at `epoch_millis`.
    pub fn generate(initiator: &str, epoch_millis: i64) -> Self {
        Self(format!("call_{}_{}", epoch_millis, initiator))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of the current call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    #[default]
    Idle,
    /// Outgoing: preparing the local offer.
    Initiating,
    /// Outgoing: offer published, waiting for an answer.
    Calling,
    /// Incoming: offer received, waiting for the local user.
    Ringing,
    /// Incoming: accepted, preparing and publishing the answer.
    Answering,
    Connected,
    Ended,
    Missed,
    Failed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Idle => "idle",
            CallStatus::Initiating => "initiating",
            CallStatus::Calling => "calling",
            CallStatus::Ringing => "ringing",
            CallStatus::Answering => "answering",
            CallStatus::Connected => "connected",
            CallStatus::Ended => "ended",
            CallStatus::Missed => "missed",
            CallStatus::Failed => "failed",
        }
    }

    /// Terminal for a given call id.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Ended | CallStatus::Missed | CallStatus::Failed)
    }

    /// A call exists and has not reached a terminal status.
    pub fn is_in_call(&self) -> bool {
        !matches!(self, CallStatus::Idle) && !self.is_terminal()
    }
}

impl std::fmt::Display for CallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a call relative to the local party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// The single current call owned by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: CallId,
    pub caller_id: String,
    pub callee_id: String,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new_outgoing(call_id: CallId, local_id: &str, peer_id: &str) -> Self {
        Self {
            call_id,
            caller_id: local_id.to_string(),
            callee_id: peer_id.to_string(),
            direction: CallDirection::Outgoing,
            status: CallStatus::Calling,
            start_time: None,
            end_time: None,
        }
    }

    pub fn new_incoming(call_id: CallId, caller_id: &str, local_id: &str) -> Self {
        Self {
            call_id,
            caller_id: caller_id.to_string(),
            callee_id: local_id.to_string(),
            direction: CallDirection::Incoming,
            status: CallStatus::Ringing,
            start_time: None,
            end_time: None,
        }
    }

    /// The other party of the call.
    pub fn peer_id(&self) -> &str {
        match self.direction {
            CallDirection::Outgoing => &self.callee_id,
            CallDirection::Incoming => &self.caller_id,
        }
    }

    /// Time spent connected, measured up to `end_time` or `now`.
    pub fn duration_at(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or(now);
        Some(end.signed_duration_since(start))
    }
}
