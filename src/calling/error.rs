//! Orchestrator errors.

use thiserror::Error;

use super::media::MediaError;
use super::signaling::SignalingError;
use super::state::InvalidTransition;
use crate::models::CallId;

/// Outcome of a rejected or failed call operation. Policy rejections leave
/// the state untouched; the rest reset the call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    #[error("cannot call yourself")]
    SelfCall,

    #[error("no peer to call")]
    EmptyPeer,

    #[error("identity must not be empty")]
    EmptyIdentity,

    #[error("already in call {0}")]
    Busy(CallId),

    #[error("no incoming call is ringing")]
    NotRinging,

    #[error("incoming call has no offer")]
    MissingOffer,

    #[error("call {0} was already handled")]
    DuplicateCall(CallId),

    #[error("microphone permission denied")]
    PermissionDenied,

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("call service stopped")]
    Closed,
}

impl CallError {
    /// Rejected by a guard rule, nothing changed.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            CallError::SelfCall
                | CallError::EmptyPeer
                | CallError::EmptyIdentity
                | CallError::Busy(_)
                | CallError::NotRinging
                | CallError::DuplicateCall(_)
        )
    }
}
