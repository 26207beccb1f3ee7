//! Call module: signaling over the document store and call lifecycle.
//!
//! Media is out of scope here; the orchestrator drives whatever
//! `MediaEngine` it is given.

pub mod dedup;
pub mod error;
pub mod events;
pub mod handle;
pub mod media;
pub mod notifier;
pub mod orchestrator;
pub mod permission;
pub mod signaling;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use dedup::DeduplicationRegistry;
pub use error::CallError;
pub use events::SignalEvent;
pub use handle::CallHandle;
pub use media::{MediaEngine, SyntheticMediaEngine};
pub use notifier::{CallNotifier, LogNotifier, NotificationAction};
pub use orchestrator::{CallEvent, CallOptions, CallSnapshot, Collaborators, Orchestrator};
pub use permission::{MicrophonePermission, StaticPermission};
pub use signaling::SignalingChannel;
pub use state::{CallStateMachine, CallTransition};
