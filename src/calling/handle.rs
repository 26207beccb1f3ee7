//! Command handle for a running orchestrator.
//!
//! The orchestrator runs as one tokio task. Callers send `CallCommand`s over
//! an unbounded channel and get replies on oneshot channels; state changes
//! arrive on a broadcast stream.

use tokio::sync::{broadcast, mpsc, oneshot};

use super::dedup::{RegistryExt, SharedRegistry};
use super::error::CallError;
use super::notifier::NotificationAction;
use super::orchestrator::{CallEvent, CallSnapshot};
use crate::models::CallId;

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

/// Commands processed by the orchestrator task, in order.
pub enum CallCommand {
    StartCall { peer: String, reply: Reply<CallId> },
    Accept { reply: Reply<()> },
    Reject { reply: Reply<()> },
    End { reply: Reply<()> },
    SetMuted { muted: bool, reply: Reply<()> },
    ToggleMute { reply: Reply<bool> },
    SetSpeaker { on: bool, reply: Reply<()> },
    Notification {
        action: NotificationAction,
        reply: Reply<()>,
    },
    ChangeIdentity { identity: String, reply: Reply<()> },
    Snapshot { reply: oneshot::Sender<CallSnapshot> },
    /// End any call and stop the task.
    Shutdown,
}

/// Cloneable handle to the orchestrator task.
#[derive(Clone)]
pub struct CallHandle {
    cmd_tx: mpsc::UnboundedSender<CallCommand>,
    events: broadcast::Sender<CallEvent>,
    processed: SharedRegistry,
}

impl CallHandle {
    pub(crate) fn new(
        cmd_tx: mpsc::UnboundedSender<CallCommand>,
        events: broadcast::Sender<CallEvent>,
        processed: SharedRegistry,
    ) -> Self {
        Self {
            cmd_tx,
            events,
            processed,
        }
    }

    /// Subscribe to state changes and notices.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> CallCommand,
    ) -> Result<T, CallError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }

    pub async fn start_call(&self, peer: &str) -> Result<CallId, CallError> {
        let peer = peer.to_string();
        self.request(|reply| CallCommand::StartCall { peer, reply })
            .await
    }

    pub async fn accept_call(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Accept { reply }).await
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Reject { reply }).await
    }

    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| CallCommand::End { reply }).await
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SetMuted { muted, reply })
            .await
    }

    /// Flip mute. Returns the new value.
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| CallCommand::ToggleMute { reply }).await
    }

    pub async fn set_speaker(&self, on: bool) -> Result<(), CallError> {
        self.request(|reply| CallCommand::SetSpeaker { on, reply })
            .await
    }

    /// Feed a notification action back into the orchestrator.
    pub async fn notification(&self, action: NotificationAction) -> Result<(), CallError> {
        self.request(|reply| CallCommand::Notification { action, reply })
            .await
    }

    pub async fn change_identity(&self, identity: &str) -> Result<(), CallError> {
        let identity = identity.to_string();
        self.request(|reply| CallCommand::ChangeIdentity { identity, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot, CallError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(CallCommand::Snapshot { reply: tx })
            .map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)
    }

    /// Whether `call_id` was already terminally handled on this device.
    pub fn was_processed(&self, call_id: &CallId) -> bool {
        self.processed.is_processed(call_id)
    }

    pub fn shutdown(&self) {
        if self.cmd_tx.send(CallCommand::Shutdown).is_err() {
            tracing::debug!("Call task already stopped");
        }
    }
}
