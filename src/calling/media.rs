//! Media engine seam.
//!
//! The orchestrator only hands the engine opaque session descriptions and
//! candidates; negotiation and audio I/O happen behind this trait.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::IceCandidate;

/// Kind of a remote session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media engine error: {0}")]
    Engine(String),

    #[error("no {0} set")]
    MissingDescription(&'static str),

    #[error("media engine closed")]
    Closed,
}

/// Peer connection as seen from the call core.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Where the engine reports locally gathered candidates.
    fn set_candidate_sink(&self, sink: mpsc::UnboundedSender<IceCandidate>);

    async fn create_offer(&self) -> Result<String, MediaError>;

    async fn set_remote_description(&self, sdp: &str, kind: SdpType) -> Result<(), MediaError>;

    async fn create_answer(&self) -> Result<String, MediaError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError>;

    async fn set_muted(&self, muted: bool) -> Result<(), MediaError>;

    /// `true` routes audio to the loudspeaker, `false` to the earpiece.
    async fn set_audio_route(&self, speaker: bool) -> Result<(), MediaError>;

    /// Tear the connection down. Safe to call on an idle engine.
    async fn close(&self);
}

/// Engine that negotiates nothing: it produces well-formed audio-only SDP
/// and one host candidate per description, and logs everything else.
/// Lets the signaling path run end to end without audio devices.
pub struct SyntheticMediaEngine {
    label: String,
    port: u16,
    session: AtomicU32,
    remote: Mutex<Option<String>>,
    sink: Mutex<Option<mpsc::UnboundedSender<IceCandidate>>>,
    muted: AtomicBool,
}

impl SyntheticMediaEngine {
    pub fn new(label: &str, port: u16) -> Self {
        Self {
            label: label.to_string(),
            port,
            session: AtomicU32::new(0),
            remote: Mutex::new(None),
            sink: Mutex::new(None),
            muted: AtomicBool::new(false),
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    fn describe(&self) -> String {
        let version = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        let mut sdp = String::new();
        sdp.push_str("v=0\r\n");
        sdp.push_str(&format!("o=- {} {} IN IP4 127.0.0.1\r\n", self.port, version));
        sdp.push_str(&format!("s={}\r\n", self.label));
        sdp.push_str("c=IN IP4 127.0.0.1\r\n");
        sdp.push_str("t=0 0\r\n");
        sdp.push_str(&format!("m=audio {} UDP/TLS/RTP/SAVPF 111\r\n", self.port));
        sdp.push_str("a=rtpmap:111 opus/48000/2\r\n");
        sdp.push_str("a=sendrecv\r\n");
        sdp.push_str("a=rtcp-mux\r\n");
        sdp.push_str("a=mid:0\r\n");
        sdp
    }

    fn emit_host_candidate(&self) {
        let sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(ref tx) = *sink {
            let candidate = IceCandidate {
                candidate: format!(
                    "candidate:1 1 UDP 2130706431 127.0.0.1 {} typ host",
                    self.port
                ),
                sdp_m_line_index: 0,
                sdp_mid: "0".to_string(),
            };
            let _ = tx.send(candidate);
        }
    }
}

#[async_trait]
impl MediaEngine for SyntheticMediaEngine {
    fn set_candidate_sink(&self, sink: mpsc::UnboundedSender<IceCandidate>) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    async fn create_offer(&self) -> Result<String, MediaError> {
        let sdp = self.describe();
        self.emit_host_candidate();
        Ok(sdp)
    }

    async fn set_remote_description(&self, sdp: &str, kind: SdpType) -> Result<(), MediaError> {
        if !sdp.starts_with("v=0") {
            return Err(MediaError::Engine(format!("unparseable {:?} description", kind)));
        }
        tracing::debug!("[{}] remote {:?} bound ({} bytes)", self.label, kind, sdp.len());
        *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = Some(sdp.to_string());
        Ok(())
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        if self.remote.lock().unwrap_or_else(|e| e.into_inner()).is_none() {
            return Err(MediaError::MissingDescription("remote offer"));
        }
        let sdp = self.describe();
        self.emit_host_candidate();
        Ok(sdp)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), MediaError> {
        tracing::debug!("[{}] remote candidate {}", self.label, candidate.candidate);
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> Result<(), MediaError> {
        self.muted.store(muted, Ordering::SeqCst);
        tracing::debug!("[{}] muted={}", self.label, muted);
        Ok(())
    }

    async fn set_audio_route(&self, speaker: bool) -> Result<(), MediaError> {
        tracing::debug!(
            "[{}] audio route -> {}",
            self.label,
            if speaker { "speaker" } else { "earpiece" }
        );
        Ok(())
    }

    async fn close(&self) {
        *self.remote.lock().unwrap_or_else(|e| e.into_inner()) = None;
        tracing::debug!("[{}] media closed", self.label);
    }
}
