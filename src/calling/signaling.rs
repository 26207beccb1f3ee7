//! Signaling channel on top of the document store.
//!
//! Publishes offer/answer/hangup records to `calls/{callId}` (overwritten in
//! place) and candidates to `calls/{callId}/candidates` (appended), and runs
//! three kinds of listeners: incoming offers addressed to the local identity,
//! the current call document, and the current call's candidates. Listener
//! output is filtered and forwarded as `SignalEvent`s on one ordered queue.
//!
//! The channel tracks at most one active call. The incoming-offer listener
//! outlives calls; the per-call listeners are cancelled on hangup.

use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::dedup::{RegistryExt, SharedRegistry};
use super::events::{self, ListenerKind, SignalEvent};
use crate::models::{CallId, IceCandidate, SignalingMessage};
use crate::store::{DocumentSnapshot, DocumentStore, FieldFilter, ListenTarget, StoreError};

/// Root collection holding one document per call.
pub const CALLS_COLLECTION: &str = "calls";

/// Source of epoch-millisecond timestamps (call ids and record timestamps).
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Wall clock.
pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// Path of the call document.
pub fn call_path(call_id: &CallId) -> String {
    format!("{}/{}", CALLS_COLLECTION, call_id)
}

/// Path of the call's candidates sub-collection.
pub fn candidates_path(call_id: &CallId) -> String {
    format!("{}/{}/candidates", CALLS_COLLECTION, call_id)
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalingError {
    #[error("a call is already active: {0}")]
    Busy(CallId),

    #[error("no active call")]
    NoActiveCall,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct ActiveCall {
    call_id: CallId,
    peer_id: String,
    document: Option<JoinHandle<()>>,
    candidates: Option<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(call_id: CallId, peer_id: &str) -> Self {
        Self {
            call_id,
            peer_id: peer_id.to_string(),
            document: None,
            candidates: None,
        }
    }

    fn stop(self) {
        for handle in [self.document, self.candidates].into_iter().flatten() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct ChannelState {
    active: Option<ActiveCall>,
    offer_listener: Option<JoinHandle<()>>,
}

struct ChannelInner {
    store: Arc<dyn DocumentStore>,
    local_id: String,
    events: mpsc::UnboundedSender<SignalEvent>,
    processed: SharedRegistry,
    clock: Clock,
    state: Mutex<ChannelState>,
}

impl ChannelInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SignalEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Signal event queue closed -- event dropped");
        }
    }
}

/// Signaling channel for one local identity.
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

impl SignalingChannel {
    /// Create a channel. Must be called inside a tokio runtime; listeners are
    /// spawned tasks.
    pub fn new(
        store: Arc<dyn DocumentStore>,
        local_id: &str,
        processed: SharedRegistry,
        events: mpsc::UnboundedSender<SignalEvent>,
        clock: Clock,
    ) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                store,
                local_id: local_id.to_string(),
                events,
                processed,
                clock,
                state: Mutex::new(ChannelState::default()),
            }),
        }
    }

    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Id of the call the channel is currently bound to.
    pub fn active_call(&self) -> Option<CallId> {
        self.inner.lock().active.as_ref().map(|a| a.call_id.clone())
    }

    /// Start a call to `to`: generate the id, attach the call listeners and
    /// write the offer. On write failure the call is released again and the
    /// caller may retry.
    pub async fn publish_offer(&self, to: &str, sdp: &str) -> Result<CallId, SignalingError> {
        let now = (self.inner.clock)();
        let call_id = CallId::generate(&self.inner.local_id, now);
        {
            let mut state = self.inner.lock();
            if let Some(ref active) = state.active {
                return Err(SignalingError::Busy(active.call_id.clone()));
            }
            let mut active = ActiveCall::new(call_id.clone(), to);
            active.candidates = Some(spawn_candidate_listener(&self.inner, &call_id));
            active.document = Some(spawn_document_listener(&self.inner, &call_id));
            state.active = Some(active);
        }

        let message = SignalingMessage::offer(&self.inner.local_id, to, sdp, now);
        if let Err(e) = self.inner.store.set(&call_path(&call_id), message.to_map()).await {
            tracing::warn!("Failed to publish offer {}: {}", call_id, e);
            self.release_call(&call_id);
            return Err(e.into());
        }
        tracing::info!("Published offer {} to {}", call_id, to);
        Ok(call_id)
    }

    /// Overwrite the active call document with an answer. The callee's
    /// candidate listener starts here.
    ///
    /// Without an active call nothing is written and `NoActiveCall` is
    /// returned.
    pub async fn publish_answer(&self, sdp: &str) -> Result<(), SignalingError> {
        let (call_id, peer_id) = {
            let mut state = self.inner.lock();
            let Some(active) = state.active.as_mut() else {
                tracing::warn!("publish_answer without an active call -- ignored");
                return Err(SignalingError::NoActiveCall);
            };
            if active.candidates.is_none() {
                active.candidates = Some(spawn_candidate_listener(&self.inner, &active.call_id));
            }
            (active.call_id.clone(), active.peer_id.clone())
        };

        let now = (self.inner.clock)();
        let message = SignalingMessage::answer(&self.inner.local_id, &peer_id, sdp, now);
        self.inner
            .store
            .set(&call_path(&call_id), message.to_map())
            .await?;
        tracing::info!("Published answer for {}", call_id);
        Ok(())
    }

    /// Append a local candidate to the active call. Fire-and-forget.
    pub fn publish_candidate(&self, candidate: IceCandidate) {
        let (call_id, peer_id) = match self.inner.lock().active.as_ref() {
            Some(a) => (a.call_id.clone(), a.peer_id.clone()),
            None => {
                tracing::debug!("No active call -- local candidate dropped");
                return;
            }
        };

        let now = (self.inner.clock)();
        let message = SignalingMessage::candidate(&self.inner.local_id, &peer_id, candidate, now);
        let store = Arc::clone(&self.inner.store);
        tokio::spawn(async move {
            if let Err(e) = store.add(&candidates_path(&call_id), message.to_map()).await {
                tracing::debug!("Failed to publish candidate for {}: {}", call_id, e);
            }
        });
    }

    /// Overwrite the active call document with a hangup, then stop the
    /// call listeners. The incoming-offer listener keeps running.
    ///
    /// The call is released even if the write fails.
    pub async fn publish_hangup(&self) -> Result<(), SignalingError> {
        let Some((call_id, peer_id)) = self
            .inner
            .lock()
            .active
            .as_ref()
            .map(|a| (a.call_id.clone(), a.peer_id.clone()))
        else {
            tracing::warn!("publish_hangup without an active call -- ignored");
            return Ok(());
        };

        let now = (self.inner.clock)();
        let message = SignalingMessage::hangup(&self.inner.local_id, &peer_id, now);
        let result = self
            .inner
            .store
            .set(&call_path(&call_id), message.to_map())
            .await;
        self.release_call(&call_id);

        match result {
            Ok(()) => {
                tracing::info!("Published hangup for {}", call_id);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Failed to publish hangup for {}: {}", call_id, e);
                Err(e.into())
            }
        }
    }

    /// (Re)start the standing listener for offers addressed to us.
    pub fn subscribe_incoming_offers(&self) {
        let target = ListenTarget::Query {
            collection: CALLS_COLLECTION.to_string(),
            filters: vec![
                FieldFilter::eq("type", "offer"),
                FieldFilter::eq("to", self.inner.local_id.as_str()),
            ],
        };
        let sub = self.inner.store.listen(target);
        let weak = Arc::downgrade(&self.inner);
        let handle = spawn_forwarder(sub, weak, ListenerKind::IncomingOffers, |inner, snap| {
            surface_offer(inner, snap);
        });

        if let Some(old) = self.inner.lock().offer_listener.replace(handle) {
            old.abort();
        }
        tracing::debug!("Listening for offers to {}", self.inner.local_id);
    }

    /// Attach the call-document listener for `call_id` if it is the active
    /// call and not listened to yet. Returns whether a listener is attached.
    pub fn subscribe_call_updates(&self, call_id: &CallId) -> bool {
        let mut state = self.inner.lock();
        match state.active.as_mut() {
            Some(active) if &active.call_id == call_id => {
                if active.document.is_none() {
                    active.document = Some(spawn_document_listener(&self.inner, call_id));
                }
                true
            }
            _ => false,
        }
    }

    /// Stop the call listeners of `call_id` without writing anything.
    pub fn release_call(&self, call_id: &CallId) -> bool {
        let mut state = self.inner.lock();
        match state.active.take() {
            Some(active) if &active.call_id == call_id => {
                active.stop();
                tracing::debug!("Released call {}", call_id);
                true
            }
            other => {
                state.active = other;
                false
            }
        }
    }

    /// Stop every listener.
    pub fn shutdown(&self) {
        let mut state = self.inner.lock();
        if let Some(active) = state.active.take() {
            active.stop();
        }
        if let Some(handle) = state.offer_listener.take() {
            handle.abort();
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Decide whether an incoming offer is surfaced, binding the channel to it
/// if so.
fn surface_offer(inner: &ChannelInner, snapshot: &DocumentSnapshot) {
    let Some((call_id, message)) = events::classify_incoming_offer(&inner.local_id, snapshot)
    else {
        return;
    };

    if inner.processed.is_processed(&call_id) {
        tracing::debug!("Offer {} already processed -- suppressed", call_id);
        return;
    }

    {
        let mut state = inner.lock();
        if let Some(ref active) = state.active {
            if active.call_id == call_id {
                tracing::debug!("Duplicate offer {} -- suppressed", call_id);
            } else {
                tracing::info!(
                    "Offer {} from {} ignored while {} is active",
                    call_id,
                    message.from,
                    active.call_id
                );
            }
            return;
        }
        let mut active = ActiveCall::new(call_id.clone(), &message.from);
        active.document = Some(spawn_document_listener(inner, &call_id));
        state.active = Some(active);
    }

    tracing::info!("Incoming offer {} from {}", call_id, message.from);
    inner.emit(SignalEvent::IncomingOffer { call_id, message });
}

fn spawn_document_listener(inner: &ChannelInner, call_id: &CallId) -> JoinHandle<()> {
    let sub = inner.store.listen(ListenTarget::Document(call_path(call_id)));
    let call_id = call_id.clone();
    let local_id = inner.local_id.clone();
    let events = inner.events.clone();
    spawn_listener_task(sub, events, ListenerKind::CallDocument, move |snap| {
        events::classify_call_update(&call_id, &local_id, snap)
    })
}

fn spawn_candidate_listener(inner: &ChannelInner, call_id: &CallId) -> JoinHandle<()> {
    let sub = inner
        .store
        .listen(ListenTarget::Collection(candidates_path(call_id)));
    let call_id = call_id.clone();
    let local_id = inner.local_id.clone();
    let events = inner.events.clone();
    spawn_listener_task(sub, events, ListenerKind::Candidates, move |snap| {
        events::classify_candidate(&call_id, &local_id, snap)
    })
}

/// Forward a per-call subscription through a classifier.
fn spawn_listener_task<F>(
    mut sub: crate::store::Subscription,
    events: mpsc::UnboundedSender<SignalEvent>,
    kind: ListenerKind,
    classify: F,
) -> JoinHandle<()>
where
    F: Fn(&DocumentSnapshot) -> Option<SignalEvent> + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(batch) = sub.recv().await {
            match batch {
                Ok(snapshots) => {
                    for snap in &snapshots {
                        if let Some(event) = classify(snap) {
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!("{} listener error: {}", kind, error);
                    if events
                        .send(SignalEvent::TransportError {
                            source: kind,
                            error,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    })
}

/// Forward a channel-wide subscription, holding the channel weakly.
fn spawn_forwarder<F>(
    mut sub: crate::store::Subscription,
    inner: Weak<ChannelInner>,
    kind: ListenerKind,
    on_snapshot: F,
) -> JoinHandle<()>
where
    F: Fn(&ChannelInner, &DocumentSnapshot) + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(batch) = sub.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            match batch {
                Ok(snapshots) => {
                    for snap in &snapshots {
                        on_snapshot(&*inner, snap);
                    }
                }
                Err(error) => {
                    tracing::warn!("{} listener error: {}", kind, error);
                    inner.emit(SignalEvent::TransportError {
                        source: kind,
                        error,
                    });
                }
            }
        }
    })
}
