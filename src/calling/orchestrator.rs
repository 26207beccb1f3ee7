//! Call orchestrator.
//!
//! Owns the single current call session, validates every status change
//! against the state machine, drives the media engine and publishes each
//! change on a broadcast stream. Commands and signaling events are handled
//! one at a time, each to completion, on a single task (see `run`), so no
//! handler ever observes another one half-way through.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use super::dedup::{DeduplicationRegistry, RegistryExt, SharedRegistry, DEFAULT_CAPACITY};
use super::error::CallError;
use super::events::SignalEvent;
use super::handle::{CallCommand, CallHandle};
use super::media::{MediaEngine, SdpType};
use super::notifier::{CallNotifier, NotificationAction};
use super::permission::{self, MicrophonePermission};
use super::signaling::{system_clock, Clock, SignalingChannel, SignalingError};
use super::state::{CallStateMachine, CallTransition};
use crate::models::{CallId, CallSession, CallStatus, IceCandidate, SignalingMessage};
use crate::store::DocumentStore;

const EVENT_STREAM_CAPACITY: usize = 64;

/// External parties the orchestrator talks to.
pub struct Collaborators {
    pub store: Arc<dyn DocumentStore>,
    pub media: Arc<dyn MediaEngine>,
    pub permission: Arc<dyn MicrophonePermission>,
    pub notifier: Arc<dyn CallNotifier>,
}

/// Tunables.
#[derive(Clone)]
pub struct CallOptions {
    pub dedup_capacity: usize,
    /// End unanswered calls after this long. `None` waits forever.
    pub ring_timeout: Option<Duration>,
    pub clock: Clock,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            dedup_capacity: DEFAULT_CAPACITY,
            ring_timeout: None,
            clock: system_clock(),
        }
    }
}

/// Observable call state.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub status: CallStatus,
    pub session: Option<CallSession>,
    pub muted: bool,
    pub speaker: bool,
}

/// Item of the state stream.
#[derive(Debug, Clone)]
pub enum CallEvent {
    State(CallSnapshot),
    /// An operation was refused or failed.
    Notice(CallError),
    /// The store reported a failure; the call goes on.
    TransportError(String),
}

struct Inbox {
    events: mpsc::UnboundedReceiver<SignalEvent>,
    candidates: mpsc::UnboundedReceiver<IceCandidate>,
}

pub struct Orchestrator {
    local_id: String,
    store: Arc<dyn DocumentStore>,
    media: Arc<dyn MediaEngine>,
    permission: Arc<dyn MicrophonePermission>,
    notifier: Arc<dyn CallNotifier>,
    channel: SignalingChannel,
    processed: SharedRegistry,
    clock: Clock,

    machine: CallStateMachine,
    session: Option<CallSession>,
    /// Remote offer of the ringing call.
    pending_offer: Option<String>,
    /// Remote candidates received before the remote description was bound.
    pending_candidates: Vec<IceCandidate>,
    remote_bound: bool,
    media_open: bool,
    muted: bool,
    speaker: bool,
    ring_timeout: Option<Duration>,
    ring_deadline: Option<Instant>,

    events_tx: mpsc::UnboundedSender<SignalEvent>,
    inbox: Option<Inbox>,
    state_tx: broadcast::Sender<CallEvent>,
}

impl Orchestrator {
    /// Build an orchestrator for `identity` and start listening for offers.
    /// Must be called inside a tokio runtime.
    pub fn new(identity: &str, parts: Collaborators, options: CallOptions) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (candidates_tx, candidates_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = broadcast::channel(EVENT_STREAM_CAPACITY);

        parts.media.set_candidate_sink(candidates_tx);
        let processed = DeduplicationRegistry::shared(options.dedup_capacity);
        let channel = SignalingChannel::new(
            Arc::clone(&parts.store),
            identity,
            processed.clone(),
            events_tx.clone(),
            options.clock.clone(),
        );
        channel.subscribe_incoming_offers();

        Self {
            local_id: identity.to_string(),
            store: parts.store,
            media: parts.media,
            permission: parts.permission,
            notifier: parts.notifier,
            channel,
            processed,
            clock: options.clock,
            machine: CallStateMachine::new(),
            session: None,
            pending_offer: None,
            pending_candidates: Vec::new(),
            remote_bound: false,
            media_open: false,
            muted: false,
            speaker: false,
            ring_timeout: options.ring_timeout,
            ring_deadline: None,
            events_tx,
            inbox: Some(Inbox {
                events: events_rx,
                candidates: candidates_rx,
            }),
            state_tx,
        }
    }

    /// Run on a new task and return a handle to it.
    pub fn spawn(self) -> (CallHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = CallHandle::new(cmd_tx, self.state_tx.clone(), self.processed.clone());
        let task = tokio::spawn(self.run(cmd_rx));
        (handle, task)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.state_tx.subscribe()
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn status(&self) -> CallStatus {
        self.machine.status()
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.session.as_ref()
    }

    pub fn is_processed(&self, call_id: &CallId) -> bool {
        self.processed.is_processed(call_id)
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            status: self.machine.status(),
            session: self.session.clone(),
            muted: self.muted,
            speaker: self.speaker,
        }
    }

    fn emit_state(&self) {
        let _ = self.state_tx.send(CallEvent::State(self.snapshot()));
    }

    fn notice(&self, error: CallError) -> CallError {
        tracing::info!("Call request refused: {}", error);
        let _ = self.state_tx.send(CallEvent::Notice(error.clone()));
        error
    }

    fn current_call(&self) -> Option<CallId> {
        self.session.as_ref().map(|s| s.call_id.clone())
    }

    fn is_current(&self, call_id: &CallId) -> bool {
        self.session.as_ref().map(|s| &s.call_id) == Some(call_id)
    }

    fn transition(&mut self, t: CallTransition) -> Result<CallStatus, CallError> {
        let status = self.machine.apply(t)?;
        if let Some(session) = self.session.as_mut() {
            session.status = status;
            if status == CallStatus::Connected && session.start_time.is_none() {
                session.start_time = Some(Utc::now());
            }
            if status.is_terminal() && session.end_time.is_none() {
                session.end_time = Some(Utc::now());
            }
            tracing::info!("Call {} -> {}", session.call_id, status);
        } else {
            tracing::info!("Call -> {}", status);
        }
        self.emit_state();
        Ok(status)
    }

    fn clear_call(&mut self) {
        self.session = None;
        self.pending_offer = None;
        self.pending_candidates.clear();
        self.remote_bound = false;
        self.media_open = false;
        self.ring_deadline = None;
    }

    /// Leave a terminal status (or abandon whatever is in progress) and
    /// drop every per-call field.
    fn reset_to_idle(&mut self) {
        if self.machine.status().is_terminal() {
            let _ = self.machine.apply(CallTransition::Reset);
        } else {
            self.machine.force_idle();
        }
        self.clear_call();
        tracing::info!("Call -> idle");
        self.emit_state();
    }

    fn arm_ring_timer(&mut self) {
        self.ring_deadline = self.ring_timeout.map(|d| Instant::now() + d);
    }

    async fn reset_speaker(&mut self) {
        if let Err(e) = self.media.set_audio_route(false).await {
            tracing::warn!("Failed to reset audio route: {}", e);
        }
        self.speaker = false;
    }

    async fn close_media(&mut self) {
        if self.media_open {
            self.media.close().await;
            self.media_open = false;
        }
    }

    /// Publish a hangup for the current call. The channel may be bound to
    /// an offer the actor has not handled yet; that call is left alone.
    async fn hangup_quietly(&mut self) {
        let bound = self.channel.active_call();
        if bound.is_none() || bound != self.current_call() {
            return;
        }
        if let Err(e) = self.channel.publish_hangup().await {
            let _ = self
                .state_tx
                .send(CallEvent::TransportError(e.to_string()));
        }
    }

    /// Abort the current call: tell the peer, close media, pass through
    /// `failed` and return to idle.
    async fn fail(&mut self, error: CallError) -> CallError {
        tracing::warn!("Call failed: {}", error);
        if let Some(call_id) = self.current_call() {
            self.processed.mark_processed(&call_id);
            if self.machine.status() == CallStatus::Ringing {
                self.notifier.cancel_incoming_call(&call_id);
            }
        }
        self.ring_deadline = None;
        self.hangup_quietly().await;
        self.close_media().await;
        if let Err(e) = self.transition(CallTransition::Fail) {
            tracing::debug!("{}", e);
        }
        let _ = self.state_tx.send(CallEvent::Notice(error.clone()));
        self.reset_to_idle();
        error
    }

    async fn bind_remote(&mut self) {
        self.remote_bound = true;
        for candidate in std::mem::take(&mut self.pending_candidates) {
            if let Err(e) = self.media.add_ice_candidate(&candidate).await {
                tracing::warn!("Failed to apply buffered candidate: {}", e);
            }
        }
    }

    /// Place a call to `peer`.
    pub async fn start_call(&mut self, peer: &str) -> Result<CallId, CallError> {
        let peer = peer.trim();
        if peer.is_empty() {
            return Err(self.notice(CallError::EmptyPeer));
        }
        if peer == self.local_id {
            return Err(self.notice(CallError::SelfCall));
        }
        // An offer the channel has bound but the actor has not handled yet
        // counts as the current call.
        if let Some(call_id) = self.current_call().or_else(|| self.channel.active_call()) {
            return Err(self.notice(CallError::Busy(call_id)));
        }
        if !permission::ensure_microphone(self.permission.as_ref()).await {
            return Err(self.notice(CallError::PermissionDenied));
        }

        self.transition(CallTransition::Dial)?;
        self.reset_speaker().await;
        self.media_open = true;

        let sdp = match self.media.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        let call_id = match self.channel.publish_offer(peer, &sdp).await {
            Ok(id) => id,
            Err(e) => return Err(self.fail(e.into()).await),
        };

        self.session = Some(CallSession::new_outgoing(
            call_id.clone(),
            &self.local_id,
            peer,
        ));
        self.transition(CallTransition::OfferPublished)?;
        self.arm_ring_timer();
        Ok(call_id)
    }

    /// Accept the ringing call.
    pub async fn accept_call(&mut self) -> Result<(), CallError> {
        let call_id = match self.session.as_ref() {
            Some(s) if s.status == CallStatus::Ringing => s.call_id.clone(),
            _ => return Err(self.notice(CallError::NotRinging)),
        };
        if self.channel.active_call().as_ref() != Some(&call_id) {
            tracing::warn!("Channel no longer bound to {}", call_id);
            return Err(self.fail(SignalingError::NoActiveCall.into()).await);
        }
        let Some(offer) = self.pending_offer.clone() else {
            return Err(self.fail(CallError::MissingOffer).await);
        };

        self.processed.mark_processed(&call_id);
        self.ring_deadline = None;
        self.notifier.cancel_incoming_call(&call_id);

        if !permission::ensure_microphone(self.permission.as_ref()).await {
            return Err(self.fail(CallError::PermissionDenied).await);
        }

        self.transition(CallTransition::Accept)?;
        self.reset_speaker().await;
        self.media_open = true;

        if let Err(e) = self
            .media
            .set_remote_description(&offer, SdpType::Offer)
            .await
        {
            return Err(self.fail(e.into()).await);
        }
        self.bind_remote().await;

        let answer = match self.media.create_answer().await {
            Ok(sdp) => sdp,
            Err(e) => return Err(self.fail(e.into()).await),
        };
        if let Err(e) = self.channel.publish_answer(&answer).await {
            return Err(self.fail(e.into()).await);
        }

        self.transition(CallTransition::MediaBound)?;
        self.reset_speaker().await;
        Ok(())
    }

    /// Decline the ringing call.
    pub async fn reject_call(&mut self) -> Result<(), CallError> {
        let call_id = match self.session.as_ref() {
            Some(s) if s.status == CallStatus::Ringing => s.call_id.clone(),
            _ => return Err(self.notice(CallError::NotRinging)),
        };

        self.processed.mark_processed(&call_id);
        self.ring_deadline = None;
        self.notifier.cancel_incoming_call(&call_id);
        self.hangup_quietly().await;

        self.clear_call();
        tracing::info!("Call {} rejected", call_id);
        self.transition(CallTransition::Reject)?;
        Ok(())
    }

    /// End the current call. Commands run one at a time, so a repeated end
    /// finds no session and does nothing.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        let Some(call_id) = self.current_call() else {
            tracing::debug!("No call to end");
            return Ok(());
        };

        self.processed.mark_processed(&call_id);
        self.ring_deadline = None;
        if self.machine.status() == CallStatus::Ringing {
            self.notifier.cancel_incoming_call(&call_id);
        }

        self.hangup_quietly().await;
        self.close_media().await;
        if let Err(e) = self.transition(CallTransition::Hangup) {
            tracing::debug!("{}", e);
        }
        self.reset_to_idle();
        Ok(())
    }

    pub async fn set_muted(&mut self, muted: bool) -> Result<(), CallError> {
        self.media.set_muted(muted).await?;
        self.muted = muted;
        self.emit_state();
        Ok(())
    }

    pub async fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let muted = !self.muted;
        self.set_muted(muted).await?;
        Ok(muted)
    }

    pub async fn set_speaker(&mut self, on: bool) -> Result<(), CallError> {
        self.media.set_audio_route(on).await?;
        self.speaker = on;
        self.emit_state();
        Ok(())
    }

    /// Handle a user action on the incoming-call notification.
    pub async fn on_notification(&mut self, action: NotificationAction) -> Result<(), CallError> {
        if !self.is_current(action.call_id()) {
            let call_id = action.call_id().clone();
            if self.processed.is_processed(&call_id) {
                return Err(self.notice(CallError::DuplicateCall(call_id)));
            }
            tracing::debug!("Notification action for unknown call {}", call_id);
            return Err(self.notice(CallError::NotRinging));
        }
        match action {
            NotificationAction::Accept(_) => self.accept_call().await,
            NotificationAction::Reject(_) => self.reject_call().await,
            NotificationAction::Tap { caller_id, .. } => {
                tracing::info!("Showing call from {}", caller_id);
                self.emit_state();
                Ok(())
            }
        }
    }

    /// Switch to a new local identity. Ends any call and moves the offer
    /// listener to the new identity.
    pub async fn change_identity(&mut self, identity: &str) -> Result<(), CallError> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(self.notice(CallError::EmptyIdentity));
        }
        if identity == self.local_id {
            return Ok(());
        }
        self.end_call().await?;

        self.channel.shutdown();
        self.channel = SignalingChannel::new(
            Arc::clone(&self.store),
            identity,
            self.processed.clone(),
            self.events_tx.clone(),
            self.clock.clone(),
        );
        self.channel.subscribe_incoming_offers();
        tracing::info!("Identity changed: {} -> {}", self.local_id, identity);
        self.local_id = identity.to_string();
        self.emit_state();
        Ok(())
    }

    /// Apply one signaling event.
    pub async fn handle_event(&mut self, event: SignalEvent) {
        match event {
            SignalEvent::IncomingOffer { call_id, message } => {
                self.on_incoming_offer(call_id, message);
            }
            SignalEvent::RemoteOffer { call_id, sdp } => {
                if self.is_current(&call_id) && self.machine.status() == CallStatus::Ringing {
                    self.pending_offer = Some(sdp);
                } else {
                    tracing::debug!("Ignoring offer snapshot for {}", call_id);
                }
            }
            SignalEvent::RemoteAnswer { call_id, sdp } => self.on_remote_answer(call_id, sdp).await,
            SignalEvent::RemoteHangup { call_id } => self.on_remote_hangup(call_id).await,
            SignalEvent::RemoteCandidate { call_id, candidate } => {
                if !self.is_current(&call_id) {
                    tracing::debug!("Dropping candidate for stale call {}", call_id);
                } else if self.remote_bound {
                    if let Err(e) = self.media.add_ice_candidate(&candidate).await {
                        tracing::warn!("Failed to apply candidate: {}", e);
                    }
                } else {
                    self.pending_candidates.push(candidate);
                }
            }
            SignalEvent::TransportError { source, error } => {
                tracing::warn!("Signaling transport error on {}: {}", source, error);
                let _ = self
                    .state_tx
                    .send(CallEvent::TransportError(format!("{}: {}", source, error)));
            }
        }
    }

    fn on_incoming_offer(&mut self, call_id: CallId, message: SignalingMessage) {
        if message.to != self.local_id {
            tracing::debug!("Offer {} is for {} -- ignored", call_id, message.to);
            return;
        }
        if self.processed.is_processed(&call_id) {
            tracing::debug!("Offer {} already processed -- ignored", call_id);
            self.channel.release_call(&call_id);
            return;
        }
        if let Some(current) = self.current_call() {
            if current == call_id {
                tracing::debug!("Duplicate offer {} -- ignored", call_id);
            } else {
                tracing::info!("Offer {} ignored while in call {}", call_id, current);
            }
            return;
        }
        if self.channel.active_call().as_ref() != Some(&call_id) {
            tracing::debug!("Offer {} no longer bound on the channel -- ignored", call_id);
            return;
        }
        let Some(sdp) = message.sdp().map(|s| s.to_string()) else {
            return;
        };

        self.session = Some(CallSession::new_incoming(
            call_id.clone(),
            &message.from,
            &self.local_id,
        ));
        self.pending_offer = Some(sdp);
        if let Err(e) = self.transition(CallTransition::OfferReceived) {
            tracing::warn!("Cannot ring for {}: {}", call_id, e);
            self.clear_call();
            self.channel.release_call(&call_id);
            return;
        }

        self.notifier.show_incoming_call(
            &call_id,
            &message.from,
            "Incoming call",
            &format!("{} is calling", message.from),
        );
        self.arm_ring_timer();
    }

    async fn on_remote_answer(&mut self, call_id: CallId, sdp: String) {
        if !self.is_current(&call_id) || self.machine.status() != CallStatus::Calling {
            tracing::debug!("Ignoring answer for {} in {}", call_id, self.machine.status());
            return;
        }
        if let Err(e) = self
            .media
            .set_remote_description(&sdp, SdpType::Answer)
            .await
        {
            self.fail(e.into()).await;
            return;
        }
        self.bind_remote().await;
        self.ring_deadline = None;
        if self.transition(CallTransition::RemoteAnswered).is_ok() {
            self.reset_speaker().await;
        }
    }

    async fn on_remote_hangup(&mut self, call_id: CallId) {
        if !self.is_current(&call_id) {
            tracing::debug!("Ignoring hangup for {}", call_id);
            return;
        }
        self.processed.mark_processed(&call_id);
        self.ring_deadline = None;
        if self.machine.status() == CallStatus::Ringing {
            self.notifier.cancel_incoming_call(&call_id);
        }
        self.channel.release_call(&call_id);
        self.close_media().await;
        if let Err(e) = self.transition(CallTransition::Hangup) {
            tracing::debug!("{}", e);
        }
        self.reset_to_idle();
    }

    async fn on_ring_timeout(&mut self) {
        self.ring_deadline = None;
        let Some(call_id) = self.current_call() else {
            return;
        };
        let status = self.machine.status();
        if !matches!(status, CallStatus::Calling | CallStatus::Ringing) {
            return;
        }
        tracing::info!("Call {} unanswered -- giving up", call_id);

        self.processed.mark_processed(&call_id);
        if status == CallStatus::Ringing {
            self.notifier.cancel_incoming_call(&call_id);
        }
        self.hangup_quietly().await;
        self.close_media().await;
        if let Err(e) = self.transition(CallTransition::RingTimeout) {
            tracing::debug!("{}", e);
        }
        self.reset_to_idle();
    }

    fn on_local_candidate(&self, candidate: IceCandidate) {
        if self.session.is_none() {
            tracing::debug!("No call -- local candidate dropped");
            return;
        }
        self.channel.publish_candidate(candidate);
    }

    async fn handle_command(&mut self, cmd: CallCommand) {
        match cmd {
            CallCommand::StartCall { peer, reply } => {
                let _ = reply.send(self.start_call(&peer).await);
            }
            CallCommand::Accept { reply } => {
                let _ = reply.send(self.accept_call().await);
            }
            CallCommand::Reject { reply } => {
                let _ = reply.send(self.reject_call().await);
            }
            CallCommand::End { reply } => {
                let _ = reply.send(self.end_call().await);
            }
            CallCommand::SetMuted { muted, reply } => {
                let _ = reply.send(self.set_muted(muted).await);
            }
            CallCommand::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute().await);
            }
            CallCommand::SetSpeaker { on, reply } => {
                let _ = reply.send(self.set_speaker(on).await);
            }
            CallCommand::Notification { action, reply } => {
                let _ = reply.send(self.on_notification(action).await);
            }
            CallCommand::ChangeIdentity { identity, reply } => {
                let _ = reply.send(self.change_identity(&identity).await);
            }
            CallCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            CallCommand::Shutdown => {}
        }
    }

    /// Serve commands and signaling events until shutdown.
    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<CallCommand>) {
        let Some(mut inbox) = self.inbox.take() else {
            tracing::error!("Orchestrator already ran");
            return;
        };
        tracing::info!("Call service running as {}", self.local_id);

        loop {
            let deadline = self.ring_deadline;
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(CallCommand::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd).await,
                },
                Some(event) = inbox.events.recv() => self.handle_event(event).await,
                Some(candidate) = inbox.candidates.recv() => self.on_local_candidate(candidate),
                _ = ring_timer(deadline) => self.on_ring_timeout().await,
            }
        }

        if let Err(e) = self.end_call().await {
            tracing::debug!("{}", e);
        }
        self.channel.shutdown();
        tracing::info!("Call service stopped");
    }
}

async fn ring_timer(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calling::signaling::{call_path, candidates_path};
    use crate::calling::test_support::{
        eventually, party, party_with, standalone, MediaCall, TestParty,
    };
    use crate::models::MessageType;
    use crate::store::{ListenTarget, MemoryStore, StoreError};
    use tokio_test::{assert_err, assert_ok};

    fn store() -> Arc<MemoryStore> {
        Arc::new(MemoryStore::new())
    }

    /// A calls B; B rings; returns the call id.
    async fn ring(a: &mut TestParty, b: &mut TestParty) -> CallId {
        let call_id = assert_ok!(a.handle.start_call("B").await);
        b.wait_for(CallStatus::Ringing).await;
        call_id
    }

    async fn connect(a: &mut TestParty, b: &mut TestParty) -> CallId {
        let call_id = ring(a, b).await;
        assert_ok!(b.handle.accept_call().await);
        a.wait_for(CallStatus::Connected).await;
        b.wait_for(CallStatus::Connected).await;
        call_id
    }

    #[tokio::test]
    async fn test_scenario_a_both_sides_connect() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);

        let call_id = assert_ok!(a.handle.start_call("B").await);
        assert_eq!(call_id.as_str(), "call_1000_A");

        let ringing = b.wait_for(CallStatus::Ringing).await;
        let session = ringing.session.unwrap();
        assert_eq!(session.call_id, call_id);
        assert_eq!(session.caller_id, "A");
        assert_eq!(b.notifier.shown(), vec![call_id.clone()]);

        assert_ok!(b.handle.accept_call().await);
        let a_states = a.statuses_until(CallStatus::Connected).await;
        assert_eq!(
            a_states,
            vec![
                CallStatus::Initiating,
                CallStatus::Calling,
                CallStatus::Connected
            ]
        );
        let b_connected = b.wait_for(CallStatus::Connected).await;
        assert!(b_connected.session.unwrap().start_time.is_some());

        assert!(a
            .media
            .calls()
            .contains(&MediaCall::SetRemote(SdpType::Answer, "v=0 answer B".into())));
        assert!(b
            .media
            .calls()
            .contains(&MediaCall::SetRemote(SdpType::Offer, "v=0...A".into())));

        // Each side eventually applies the other's host candidate.
        let (am, bm) = (a.media.clone(), b.media.clone());
        eventually(|| am.candidates_added() >= 1 && bm.candidates_added() >= 1).await;
        assert!(b.handle.was_processed(&call_id));
    }

    #[tokio::test]
    async fn test_connected_once_and_start_time_set_once() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);
        let call_id = connect(&mut a, &mut b).await;

        let first = assert_ok!(a.handle.snapshot().await);
        let started = first.session.unwrap().start_time.unwrap();

        // Redelivered answer snapshot does not reconnect.
        assert!(store.redeliver(&call_path(&call_id)));
        a.assert_no_status(CallStatus::Connected).await;

        let again = assert_ok!(a.handle.snapshot().await);
        assert_eq!(again.status, CallStatus::Connected);
        assert_eq!(again.session.unwrap().start_time, Some(started));
    }

    #[tokio::test]
    async fn test_scenario_b_caller_hangs_up_while_ringing() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);
        let call_id = ring(&mut a, &mut b).await;

        assert_ok!(a.handle.end_call().await);

        let ended = b.wait_for(CallStatus::Ended).await;
        assert!(ended.session.unwrap().end_time.is_some());
        let idle = b.wait_for(CallStatus::Idle).await;
        assert!(idle.session.is_none());

        assert!(b.handle.was_processed(&call_id));
        assert_eq!(b.notifier.cancelled(), vec![call_id.clone()]);
        // Media was never opened on the callee.
        assert_eq!(b.media.closes(), 0);
        assert_eq!(a.media.closes(), 1);
    }

    #[tokio::test]
    async fn test_scenario_c_redelivered_offer_rings_once() {
        let store = store();
        let mut a = party(&store, "A", 2000);
        let mut b = party(&store, "B", 2000);
        let call_id = ring(&mut a, &mut b).await;
        assert_eq!(call_id.as_str(), "call_2000_A");

        assert!(store.redeliver(&call_path(&call_id)));
        assert!(store.redeliver(&call_path(&call_id)));
        b.assert_no_status(CallStatus::Ringing).await;

        assert_eq!(b.notifier.shown().len(), 1);
        let snap = assert_ok!(b.handle.snapshot().await);
        assert_eq!(snap.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_processed_offer_never_rings_again() {
        let store = store();
        let mut a = party(&store, "A", 2000);
        let mut b = party(&store, "B", 2000);
        let call_id = ring(&mut a, &mut b).await;
        assert_ok!(b.handle.reject_call().await);
        b.wait_for(CallStatus::Idle).await;

        // Put the offer back, as a stale replica would.
        let offer = SignalingMessage::offer("A", "B", "v=0...A", 2000);
        assert_ok!(store.set(&call_path(&call_id), offer.to_map()).await);
        b.assert_no_status(CallStatus::Ringing).await;
        assert_eq!(b.notifier.shown().len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_d_mute_round_trip() {
        let store = store();
        let a = party(&store, "A", 1000);

        assert_ok!(a.handle.set_muted(true).await);
        assert_ok!(a.handle.set_muted(false).await);

        assert_eq!(a.media.mute_calls(), vec![true, false]);
        let snap = assert_ok!(a.handle.snapshot().await);
        assert!(!snap.muted);
    }

    #[tokio::test]
    async fn test_toggle_mute_and_speaker() {
        let store = store();
        let a = party(&store, "A", 1000);
        assert!(assert_ok!(a.handle.toggle_mute().await));
        assert!(!assert_ok!(a.handle.toggle_mute().await));

        assert_ok!(a.handle.set_speaker(true).await);
        assert!(assert_ok!(a.handle.snapshot().await).speaker);
    }

    #[tokio::test]
    async fn test_speaker_reset_on_new_call_and_connect() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);

        assert_ok!(a.handle.set_speaker(true).await);
        assert_ok!(b.handle.set_speaker(true).await);
        connect(&mut a, &mut b).await;

        for p in [&a, &b] {
            let snap = assert_ok!(p.handle.snapshot().await);
            assert!(!snap.speaker);
            assert_eq!(p.media.audio_routes().last(), Some(&false));
        }
    }

    #[tokio::test]
    async fn test_end_call_twice_sends_one_hangup() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);
        let call_id = connect(&mut a, &mut b).await;

        let mut watch = store.listen(ListenTarget::Document(call_path(&call_id)));
        let _current = watch.recv().await;

        let (first, second) = tokio::join!(a.handle.end_call(), a.handle.end_call());
        assert_ok!(first);
        assert_ok!(second);
        b.wait_for(CallStatus::Idle).await;

        let mut hangups = 0;
        while let Ok(Some(batch)) =
            tokio::time::timeout(Duration::from_millis(50), watch.recv()).await
        {
            for snap in batch.unwrap() {
                let data = snap.data.unwrap();
                if data["type"] == MessageType::Hangup.as_str() && data["from"] == "A" {
                    hangups += 1;
                }
            }
        }
        assert_eq!(hangups, 1);
        assert_eq!(a.media.closes(), 1);
        assert_eq!(b.media.closes(), 1);
    }

    #[tokio::test]
    async fn test_policy_rejections_leave_state() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let _b = party(&store, "B", 1000);

        assert_eq!(a.handle.start_call("A").await, Err(CallError::SelfCall));
        assert_eq!(a.handle.start_call("  ").await, Err(CallError::EmptyPeer));
        assert_eq!(a.handle.accept_call().await, Err(CallError::NotRinging));
        assert_eq!(a.handle.reject_call().await, Err(CallError::NotRinging));
        assert!(matches!(a.next_notice().await, CallError::SelfCall));

        let call_id = assert_ok!(a.handle.start_call("B").await);
        let err = assert_err!(a.handle.start_call("C").await);
        assert_eq!(err, CallError::Busy(call_id));
        assert_eq!(store.list("calls").len(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_on_start() {
        let store = store();
        let a = party_with(&store, "A", false, CallOptions::default());
        assert_eq!(
            a.handle.start_call("B").await,
            Err(CallError::PermissionDenied)
        );
        let snap = assert_ok!(a.handle.snapshot().await);
        assert_eq!(snap.status, CallStatus::Idle);
        assert_eq!(store.write_count(), 0);
        assert!(a.media.calls().is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_on_accept_hangs_up() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party_with(&store, "B", false, CallOptions::default());
        let call_id = ring(&mut a, &mut b).await;

        assert_eq!(
            b.handle.accept_call().await,
            Err(CallError::PermissionDenied)
        );
        b.wait_for(CallStatus::Failed).await;
        b.wait_for(CallStatus::Idle).await;
        assert!(b.handle.was_processed(&call_id));

        a.wait_for(CallStatus::Ended).await;
        a.wait_for(CallStatus::Idle).await;
    }

    #[tokio::test]
    async fn test_reject_notifies_caller() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);
        let call_id = ring(&mut a, &mut b).await;

        assert_ok!(b.handle.reject_call().await);
        let idle = b.wait_for(CallStatus::Idle).await;
        assert!(idle.session.is_none());
        assert!(b.handle.was_processed(&call_id));
        assert_eq!(b.notifier.cancelled(), vec![call_id]);

        a.wait_for(CallStatus::Ended).await;
        a.wait_for(CallStatus::Idle).await;
    }

    #[tokio::test]
    async fn test_notification_actions() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);
        let call_id = ring(&mut a, &mut b).await;

        assert_ok!(
            b.handle
                .notification(NotificationAction::Tap {
                    call_id: call_id.clone(),
                    caller_id: "A".into(),
                })
                .await
        );
        assert_ok!(
            b.handle
                .notification(NotificationAction::Accept(call_id.clone()))
                .await
        );
        b.wait_for(CallStatus::Connected).await;

        assert_eq!(
            b.handle
                .notification(NotificationAction::Reject(CallId::new("call_1_X")))
                .await,
            Err(CallError::NotRinging)
        );

        // A late action for a call that is over is a duplicate.
        assert_ok!(b.handle.end_call().await);
        assert_eq!(
            b.handle
                .notification(NotificationAction::Accept(call_id.clone()))
                .await,
            Err(CallError::DuplicateCall(call_id))
        );
    }

    #[tokio::test]
    async fn test_candidates_buffered_until_answer() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);
        let call_id = ring(&mut a, &mut b).await;

        let early = SignalingMessage::candidate(
            "B",
            "A",
            IceCandidate {
                candidate: "candidate:9 1 UDP 1 10.9.9.9 9 typ host".into(),
                sdp_m_line_index: 0,
                sdp_mid: "0".into(),
            },
            1001,
        );
        assert_ok!(store.add(&candidates_path(&call_id), early.to_map()).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(a.media.candidates_added(), 0);

        assert_ok!(b.handle.accept_call().await);
        a.wait_for(CallStatus::Connected).await;

        let calls = a.media.calls();
        let bound = calls
            .iter()
            .position(|c| matches!(c, MediaCall::SetRemote(SdpType::Answer, _)))
            .unwrap();
        let applied = calls
            .iter()
            .position(|c| matches!(c, MediaCall::AddCandidate(s) if s.contains("10.9.9.9")))
            .unwrap();
        assert!(bound < applied);
    }

    #[tokio::test]
    async fn test_ring_timeout_marks_missed() {
        let store = store();
        let options = CallOptions {
            ring_timeout: Some(Duration::from_millis(50)),
            clock: Arc::new(|| 1000),
            ..CallOptions::default()
        };
        let mut a = party_with(&store, "A", true, options);

        let call_id = assert_ok!(a.handle.start_call("B").await);
        a.wait_for(CallStatus::Missed).await;
        a.wait_for(CallStatus::Idle).await;

        let doc = store.get(&call_path(&call_id)).unwrap();
        assert_eq!(doc["type"], "hangup");
        assert!(a.handle.was_processed(&call_id));
        assert_eq!(a.media.closes(), 1);
    }

    #[tokio::test]
    async fn test_change_identity_moves_offer_listener() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let c = party(&store, "C", 1000);

        assert_ok!(a.handle.change_identity("A2").await);
        assert_eq!(
            a.handle.change_identity(" ").await,
            Err(CallError::EmptyIdentity)
        );

        assert_ok!(c.handle.start_call("A").await);
        a.assert_no_status(CallStatus::Ringing).await;
        assert_ok!(c.handle.end_call().await);

        assert_ok!(c.handle.start_call("A2").await);
        let ringing = a.wait_for(CallStatus::Ringing).await;
        assert_eq!(ringing.session.unwrap().callee_id, "A2");
    }

    #[tokio::test]
    async fn test_transport_error_keeps_session() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        let mut b = party(&store, "B", 1000);
        ring(&mut a, &mut b).await;

        store.inject_error(StoreError::Unavailable("offline".into()));
        let msg = b.next_transport_error().await;
        assert!(msg.contains("offline"));

        let snap = assert_ok!(b.handle.snapshot().await);
        assert_eq!(snap.status, CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_failed_offer_write_resets_to_idle() {
        let store = store();
        let mut a = party(&store, "A", 1000);
        store.fail_next_writes(1);

        let err = assert_err!(a.handle.start_call("B").await);
        assert!(matches!(err, CallError::Signaling(_)));
        a.wait_for(CallStatus::Failed).await;
        a.wait_for(CallStatus::Idle).await;
        assert_eq!(a.media.closes(), 1);

        // The caller may retry.
        assert_ok!(a.handle.start_call("B").await);
    }

    /// C's offer to B is bound on B's channel but its event is still queued.
    async fn queue_offer_from_c(store: &Arc<MemoryStore>, b: &Orchestrator) -> CallId {
        let call_id = CallId::generate("C", 500);
        let offer = SignalingMessage::offer("C", "B", "v=0 C", 500);
        assert_ok!(store.set(&call_path(&call_id), offer.to_map()).await);
        eventually(|| b.channel.active_call().is_some()).await;
        assert_eq!(b.channel.active_call(), Some(call_id.clone()));
        call_id
    }

    async fn next_incoming_offer(inbox: &mut Inbox) -> SignalEvent {
        let event = tokio::time::timeout(Duration::from_secs(1), inbox.events.recv())
            .await
            .expect("timed out waiting for the offer")
            .expect("event queue closed");
        assert!(matches!(event, SignalEvent::IncomingOffer { .. }));
        event
    }

    #[tokio::test]
    async fn test_start_call_with_queued_offer_keeps_incoming_call() {
        let store = store();
        let (mut b, media) = standalone(&store, "B", 1000);
        let mut inbox = b.inbox.take().unwrap();
        let incoming = queue_offer_from_c(&store, &b).await;

        // The local command is served before the queued offer.
        assert_eq!(
            b.start_call("A").await,
            Err(CallError::Busy(incoming.clone()))
        );
        assert_eq!(b.status(), CallStatus::Idle);
        assert!(media.calls().is_empty());
        assert_eq!(store.get(&call_path(&incoming)).unwrap()["type"], "offer");
        assert!(store.get(&call_path(&CallId::generate("B", 1000))).is_none());

        let event = next_incoming_offer(&mut inbox).await;
        b.handle_event(event).await;
        assert_eq!(b.status(), CallStatus::Ringing);
        assert_eq!(b.channel.active_call(), Some(incoming.clone()));

        assert_ok!(b.accept_call().await);
        assert_eq!(b.status(), CallStatus::Connected);
        let doc = store.get(&call_path(&incoming)).unwrap();
        assert_eq!(doc["type"], "answer");
        assert_eq!(doc["from"], "B");
    }

    #[tokio::test]
    async fn test_failed_start_does_not_hang_up_queued_offer() {
        let store = store();
        let (mut b, _media) = standalone(&store, "B", 1000);
        let mut inbox = b.inbox.take().unwrap();
        let incoming = queue_offer_from_c(&store, &b).await;

        // An outgoing attempt that fails before it owns a session.
        b.fail(CallError::MissingOffer).await;
        assert_eq!(store.get(&call_path(&incoming)).unwrap()["type"], "offer");
        assert_eq!(b.channel.active_call(), Some(incoming.clone()));
        assert!(!b.is_processed(&incoming));

        let event = next_incoming_offer(&mut inbox).await;
        b.handle_event(event).await;
        assert_eq!(b.status(), CallStatus::Ringing);
    }

    #[tokio::test]
    async fn test_offer_released_before_handling_does_not_ring() {
        let store = store();
        let (mut b, _media) = standalone(&store, "B", 1000);
        let mut inbox = b.inbox.take().unwrap();
        let incoming = queue_offer_from_c(&store, &b).await;

        assert!(b.channel.release_call(&incoming));
        let event = next_incoming_offer(&mut inbox).await;
        b.handle_event(event).await;
        assert_eq!(b.status(), CallStatus::Idle);
        assert!(b.session().is_none());
    }

    #[tokio::test]
    async fn test_accept_fails_when_channel_not_bound() {
        let store = store();
        let (mut b, media) = standalone(&store, "B", 1000);
        let mut inbox = b.inbox.take().unwrap();
        let incoming = queue_offer_from_c(&store, &b).await;
        let event = next_incoming_offer(&mut inbox).await;
        b.handle_event(event).await;
        assert_eq!(b.status(), CallStatus::Ringing);

        assert!(b.channel.release_call(&incoming));
        assert_eq!(
            b.accept_call().await,
            Err(CallError::Signaling(SignalingError::NoActiveCall))
        );
        assert_eq!(b.status(), CallStatus::Idle);
        assert!(b.is_processed(&incoming));
        assert!(!media.calls().contains(&MediaCall::CreateAnswer));
        assert_eq!(store.get(&call_path(&incoming)).unwrap()["type"], "offer");
    }

    #[tokio::test]
    async fn test_second_end_call_is_noop() {
        let store = store();
        let (mut a, media) = standalone(&store, "A", 1000);
        let call_id = assert_ok!(a.start_call("B").await);

        assert_ok!(a.end_call().await);
        assert_eq!(store.get(&call_path(&call_id)).unwrap()["type"], "hangup");
        let writes = store.write_count();

        assert_ok!(a.end_call().await);
        assert_eq!(a.status(), CallStatus::Idle);
        assert_eq!(store.write_count(), writes);
        assert_eq!(media.closes(), 1);
    }
}
