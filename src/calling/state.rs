//! Call lifecycle state machine.
//!
//! Pure transition table; side effects live in the orchestrator.

use thiserror::Error;

use crate::models::CallStatus;

/// Inputs that move the call status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTransition {
    /// Local user starts an outgoing call.
    Dial,
    OfferPublished,
    OfferReceived,
    RemoteAnswered,
    /// Local user accepts the ringing call.
    Accept,
    /// Remote description bound and answer published.
    MediaBound,
    Reject,
    /// Local end-call or remote hangup.
    Hangup,
    RingTimeout,
    Fail,
    /// Leave a terminal status.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid call transition {transition:?} from {from}")]
pub struct InvalidTransition {
    pub from: CallStatus,
    pub transition: CallTransition,
}

/// Holds the current status and validates transitions.
#[derive(Debug, Default)]
pub struct CallStateMachine {
    status: CallStatus,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> CallStatus {
        self.status
    }

    /// Target status of `transition` from `from`, if allowed.
    pub fn next(from: CallStatus, transition: CallTransition) -> Option<CallStatus> {
        use crate::models::CallStatus::*;
        use CallTransition::*;

        match (from, transition) {
            (Idle, Dial) => Some(Initiating),
            (Initiating, OfferPublished) => Some(Calling),
            (Idle, OfferReceived) => Some(Ringing),
            (Calling, RemoteAnswered) => Some(Connected),
            (Ringing, Accept) => Some(Answering),
            (Answering, MediaBound) => Some(Connected),
            (Ringing, Reject) => Some(Idle),
            (Initiating | Calling | Ringing | Answering | Connected, Hangup) => Some(Ended),
            (Calling | Ringing, RingTimeout) => Some(Missed),
            (Initiating | Calling | Ringing | Answering | Connected, Fail) => Some(Failed),
            (Ended | Missed | Failed, Reset) => Some(Idle),
            _ => None,
        }
    }

    /// Apply `transition`, leaving the status untouched when it is invalid.
    pub fn apply(&mut self, transition: CallTransition) -> Result<CallStatus, InvalidTransition> {
        match Self::next(self.status, transition) {
            Some(next) => {
                self.status = next;
                Ok(next)
            }
            None => Err(InvalidTransition {
                from: self.status,
                transition,
            }),
        }
    }

    /// Back to idle from any status, for resets after a rejected transition.
    pub fn force_idle(&mut self) {
        self.status = CallStatus::Idle;
    }
}
