//! Recording fakes and helpers for call tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::error::CallError;
use super::handle::CallHandle;
use super::media::{MediaEngine, MediaError, SdpType};
use super::notifier::CallNotifier;
use super::orchestrator::{CallEvent, CallOptions, CallSnapshot, Collaborators, Orchestrator};
use super::permission::StaticPermission;
use crate::models::{CallId, CallStatus, IceCandidate};
use crate::store::{DocumentStore, MemoryStore};

const WAIT: Duration = Duration::from_secs(2);
const SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaCall {
    CreateOffer,
    SetRemote(SdpType, String),
    CreateAnswer,
    AddCandidate(String),
    SetMuted(bool),
    SetAudioRoute(bool),
    Close,
}

/// Media engine that records every call. Offers are `v=0...{label}`,
/// answers `v=0 answer {label}`; each emits one host candidate.
pub struct RecordingMedia {
    label: String,
    calls: Mutex<Vec<MediaCall>>,
    sink: Mutex<Option<mpsc::UnboundedSender<IceCandidate>>>,
}

impl RecordingMedia {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            calls: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
        }
    }

    fn record(&self, call: MediaCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn emit_candidate(&self) {
        if let Some(ref tx) = *self.sink.lock().unwrap() {
            let _ = tx.send(IceCandidate {
                candidate: format!("candidate:1 1 UDP 2130706431 host-{} 9 typ host", self.label),
                sdp_m_line_index: 0,
                sdp_mid: "0".into(),
            });
        }
    }

    pub fn calls(&self) -> Vec<MediaCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn mute_calls(&self) -> Vec<bool> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MediaCall::SetMuted(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn audio_routes(&self) -> Vec<bool> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MediaCall::SetAudioRoute(s) => Some(s),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| **c == MediaCall::Close)
            .count()
    }

    pub fn candidates_added(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MediaCall::AddCandidate(_)))
            .count()
    }
}

#[async_trait]
impl MediaEngine for RecordingMedia {
    fn set_candidate_sink(&self, sink: mpsc::UnboundedSender<IceCandidate>) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        self.record(MediaCall::CreateOffer);
        self.emit_candidate();
        Ok(format!("v=0...{}", self.label))
    }

    async fn set_remote_description(&self, sdp: &str, kind: SdpType) -> Result<(), MediaError> {
        self.record(MediaCall::SetRemote(kind, sdp.to_string()));
        Ok(())
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        self.record(MediaCall::CreateAnswer);
        self.emit_candidate();
        Ok(format!("v=0 answer {}", self.label))
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        self.record(MediaCall::AddCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.record(MediaCall::SetMuted(muted));
        Ok(())
    }

    async fn set_audio_route(&self, speaker: bool) -> Result<(), MediaError> {
        self.record(MediaCall::SetAudioRoute(speaker));
        Ok(())
    }

    async fn close(&self) {
        self.record(MediaCall::Close);
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    shown: Mutex<Vec<CallId>>,
    cancelled: Mutex<Vec<CallId>>,
}

impl RecordingNotifier {
    pub fn shown(&self) -> Vec<CallId> {
        self.shown.lock().unwrap().clone()
    }

    /// Distinct cancelled ids, in order.
    pub fn cancelled(&self) -> Vec<CallId> {
        let mut out: Vec<CallId> = Vec::new();
        for id in self.cancelled.lock().unwrap().iter() {
            if !out.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }
}

impl CallNotifier for RecordingNotifier {
    fn show_incoming_call(&self, call_id: &CallId, _caller_id: &str, _title: &str, _body: &str) {
        self.shown.lock().unwrap().push(call_id.clone());
    }

    fn cancel_incoming_call(&self, call_id: &CallId) {
        self.cancelled.lock().unwrap().push(call_id.clone());
    }
}

/// One running orchestrator with its fakes.
pub struct TestParty {
    pub handle: CallHandle,
    pub events: broadcast::Receiver<CallEvent>,
    pub media: Arc<RecordingMedia>,
    pub notifier: Arc<RecordingNotifier>,
    _task: JoinHandle<()>,
}

impl TestParty {
    /// Next state snapshot with `status`.
    pub async fn wait_for(&mut self, status: CallStatus) -> CallSnapshot {
        let events = &mut self.events;
        timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(CallEvent::State(s)) if s.status == status => return s,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", status))
    }

    /// Every state status up to and including `status`.
    pub async fn statuses_until(&mut self, status: CallStatus) -> Vec<CallStatus> {
        let events = &mut self.events;
        timeout(WAIT, async {
            let mut seen = Vec::new();
            loop {
                if let Ok(CallEvent::State(s)) = events.recv().await {
                    seen.push(s.status);
                    if s.status == status {
                        return seen;
                    }
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", status))
    }

    /// Assert no snapshot with `status` shows up for a while.
    pub async fn assert_no_status(&mut self, status: CallStatus) {
        let events = &mut self.events;
        let _ = timeout(SETTLE, async {
            loop {
                if let Ok(CallEvent::State(s)) = events.recv().await {
                    assert_ne!(s.status, status, "unexpected {} snapshot", status);
                }
            }
        })
        .await;
    }

    pub async fn next_notice(&mut self) -> CallError {
        let events = &mut self.events;
        timeout(WAIT, async {
            loop {
                if let Ok(CallEvent::Notice(e)) = events.recv().await {
                    return e;
                }
            }
        })
        .await
        .expect("timed out waiting for a notice")
    }

    pub async fn next_transport_error(&mut self) -> String {
        let events = &mut self.events;
        timeout(WAIT, async {
            loop {
                if let Ok(CallEvent::TransportError(msg)) = events.recv().await {
                    return msg;
                }
            }
        })
        .await
        .expect("timed out waiting for a transport error")
    }
}

/// Party with a granted microphone and a clock frozen at `now`.
pub fn party(store: &Arc<MemoryStore>, id: &str, now: i64) -> TestParty {
    let options = CallOptions {
        clock: Arc::new(move || now),
        ..CallOptions::default()
    };
    party_with(store, id, true, options)
}

pub fn party_with(
    store: &Arc<MemoryStore>,
    id: &str,
    microphone: bool,
    options: CallOptions,
) -> TestParty {
    let media = Arc::new(RecordingMedia::new(id));
    let notifier = Arc::new(RecordingNotifier::default());
    let store: Arc<dyn DocumentStore> = store.clone();
    let orchestrator = Orchestrator::new(
        id,
        Collaborators {
            store,
            media: media.clone(),
            permission: Arc::new(StaticPermission::new(microphone)),
            notifier: notifier.clone(),
        },
        options,
    );
    let events = orchestrator.subscribe();
    let (handle, task) = orchestrator.spawn();
    TestParty {
        handle,
        events,
        media,
        notifier,
        _task: task,
    }
}

/// Orchestrator that is not spawned, for driving commands and events by
/// hand in a chosen order.
pub fn standalone(
    store: &Arc<MemoryStore>,
    id: &str,
    now: i64,
) -> (Orchestrator, Arc<RecordingMedia>) {
    let media = Arc::new(RecordingMedia::new(id));
    let store: Arc<dyn DocumentStore> = store.clone();
    let orchestrator = Orchestrator::new(
        id,
        Collaborators {
            store,
            media: media.clone(),
            permission: Arc::new(StaticPermission::new(true)),
            notifier: Arc::new(RecordingNotifier::default()),
        },
        CallOptions {
            clock: Arc::new(move || now),
            ..CallOptions::default()
        },
    );
    (orchestrator, media)
}

/// Poll `cond` until it holds.
pub async fn eventually(cond: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
