//! Incoming-call notification hand-off.

use crate::models::CallId;

/// Presents incoming calls to the user. Actions come back to the
/// orchestrator as `NotificationAction`s.
pub trait CallNotifier: Send + Sync {
    fn show_incoming_call(&self, call_id: &CallId, caller_id: &str, title: &str, body: &str);
    fn cancel_incoming_call(&self, call_id: &CallId);
}

/// User action on an incoming-call notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    Accept(CallId),
    Reject(CallId),
    /// Notification body tapped: bring the call screen forward.
    Tap { call_id: CallId, caller_id: String },
}

impl NotificationAction {
    pub fn call_id(&self) -> &CallId {
        match self {
            NotificationAction::Accept(id) | NotificationAction::Reject(id) => id,
            NotificationAction::Tap { call_id, .. } => call_id,
        }
    }
}

/// Notifier that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl CallNotifier for LogNotifier {
    fn show_incoming_call(&self, call_id: &CallId, caller_id: &str, title: &str, body: &str) {
        tracing::info!("[{}] {}: {} ({})", call_id, title, body, caller_id);
    }

    fn cancel_incoming_call(&self, call_id: &CallId) {
        tracing::debug!("[{}] incoming-call notification cancelled", call_id);
    }
}
