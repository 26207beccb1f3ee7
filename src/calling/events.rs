//! Typed signaling events and the filters that produce them.
//!
//! Every listener callback is translated into a `SignalEvent` and pushed on
//! one ordered queue to the orchestrator. The filters here are the protocol
//! rules: records written by the local party are dropped (the store echoes a
//! writer's own writes back to it), malformed records are dropped, and
//! unknown types are ignored.

use crate::models::{CallId, IceCandidate, MessageType, SignalPayload, SignalingMessage};
use crate::store::{DocumentSnapshot, StoreError};

/// Which listener raised a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    IncomingOffers,
    CallDocument,
    Candidates,
}

impl std::fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ListenerKind::IncomingOffers => "incoming-offers",
            ListenerKind::CallDocument => "call-document",
            ListenerKind::Candidates => "candidates",
        })
    }
}

/// Event raised by the signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// A new offer addressed to us, not yet processed on this device.
    IncomingOffer {
        call_id: CallId,
        message: SignalingMessage,
    },
    /// The call document carries an offer from the peer.
    RemoteOffer { call_id: CallId, sdp: String },
    RemoteAnswer { call_id: CallId, sdp: String },
    RemoteHangup { call_id: CallId },
    RemoteCandidate {
        call_id: CallId,
        candidate: IceCandidate,
    },
    /// A listener reported a store failure. Listeners stay attached.
    TransportError {
        source: ListenerKind,
        error: StoreError,
    },
}

impl SignalEvent {
    /// Call the event belongs to, if any.
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            SignalEvent::IncomingOffer { call_id, .. }
            | SignalEvent::RemoteOffer { call_id, .. }
            | SignalEvent::RemoteAnswer { call_id, .. }
            | SignalEvent::RemoteHangup { call_id }
            | SignalEvent::RemoteCandidate { call_id, .. } => Some(call_id),
            SignalEvent::TransportError { .. } => None,
        }
    }
}

/// Validate a snapshot and drop it if it was written by `local_id`.
fn parse_foreign(local_id: &str, snapshot: &DocumentSnapshot) -> Option<SignalingMessage> {
    let data = snapshot.data.as_ref()?;
    let message = match SignalingMessage::from_map(data) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!("Dropping record {}: {}", snapshot.path, e);
            return None;
        }
    };
    if message.is_from(local_id) {
        tracing::debug!(
            "Dropping self-echo of {} on {}",
            message.message_type(),
            snapshot.path
        );
        return None;
    }
    Some(message)
}

/// Classify a snapshot of the call document `calls/{call_id}`.
pub fn classify_call_update(
    call_id: &CallId,
    local_id: &str,
    snapshot: &DocumentSnapshot,
) -> Option<SignalEvent> {
    let message = parse_foreign(local_id, snapshot)?;
    let call_id = call_id.clone();
    match message.payload {
        SignalPayload::Offer { sdp } => Some(SignalEvent::RemoteOffer { call_id, sdp }),
        SignalPayload::Answer { sdp } => Some(SignalEvent::RemoteAnswer { call_id, sdp }),
        SignalPayload::Hangup => Some(SignalEvent::RemoteHangup { call_id }),
        SignalPayload::IceCandidate(_) => {
            tracing::debug!("Ignoring candidate record on call document {}", call_id);
            None
        }
    }
}

/// Classify a record of the candidates sub-collection of `call_id`.
pub fn classify_candidate(
    call_id: &CallId,
    local_id: &str,
    snapshot: &DocumentSnapshot,
) -> Option<SignalEvent> {
    let message = parse_foreign(local_id, snapshot)?;
    match message.payload {
        SignalPayload::IceCandidate(candidate) => Some(SignalEvent::RemoteCandidate {
            call_id: call_id.clone(),
            candidate,
        }),
        _ => {
            tracing::debug!("Ignoring non-candidate record {}", snapshot.path);
            None
        }
    }
}

/// Extract an offer addressed to `local_id` from an incoming-offers snapshot.
pub fn classify_incoming_offer(
    local_id: &str,
    snapshot: &DocumentSnapshot,
) -> Option<(CallId, SignalingMessage)> {
    let message = parse_foreign(local_id, snapshot)?;
    if message.message_type() != MessageType::Offer || message.to != local_id {
        return None;
    }
    Some((CallId::new(snapshot.id.clone()), message))
}
