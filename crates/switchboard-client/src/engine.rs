//! Seam between the negotiation controller and the platform's real-time
//! transport stack.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use switchboard_core::{NetworkCandidate, SdpKind, SignalDescription};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Media devices or transport capability were not granted.
    #[error("local capability unavailable: {0}")]
    CapabilityDenied(String),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("invalid network candidate: {0}")]
    InvalidCandidate(String),
}

/// Remote media track announced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub kind: String,
}

/// Pushed asynchronously by the engine. Handlers must not block the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    LocalCandidate(NetworkCandidate),
    RemoteTrack(TrackInfo),
}

#[async_trait]
pub trait TransportEngine: Send + Sync {
    async fn acquire_local_media(&self) -> Result<(), EngineError>;
    async fn create_local_description(&self, role: SdpKind)
        -> Result<SignalDescription, EngineError>;
    async fn set_local_description(&self, description: SignalDescription)
        -> Result<(), EngineError>;
    async fn set_remote_description(
        &self,
        description: SignalDescription,
    ) -> Result<(), EngineError>;
    async fn add_remote_candidate(&self, candidate: NetworkCandidate) -> Result<(), EngineError>;
    /// Tear down the current session. The engine is reused for the next call.
    async fn close(&self);
}

/// In-memory engine for tests and signaling smoke checks. It keeps a log of
/// everything applied to it and, like real engines, rejects candidates that
/// arrive before a remote description.
#[derive(Clone)]
pub struct RecordingEngine {
    inner: Arc<Mutex<RecordingState>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    label: String,
}

#[derive(Default)]
struct RecordingState {
    deny_media: bool,
    fail_descriptions: bool,
    generation: u64,
    local: Option<SignalDescription>,
    remote: Option<SignalDescription>,
    candidates: Vec<NetworkCandidate>,
    sessions_closed: usize,
}

impl RecordingEngine {
    pub fn new(label: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(Mutex::new(RecordingState::default())),
                events,
                label: label.into(),
            },
            rx,
        )
    }

    pub fn deny_media(&self) {
        self.inner.lock().deny_media = true;
    }

    /// Makes every subsequent `create_local_description` fail.
    pub fn fail_descriptions(&self) {
        self.inner.lock().fail_descriptions = true;
    }

    /// Simulate the engine discovering a local candidate.
    pub fn discover_candidate(&self, candidate: NetworkCandidate) {
        let _ = self.events.send(EngineEvent::LocalCandidate(candidate));
    }

    pub fn announce_track(&self, track: TrackInfo) {
        let _ = self.events.send(EngineEvent::RemoteTrack(track));
    }

    pub fn local_description(&self) -> Option<SignalDescription> {
        self.inner.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SignalDescription> {
        self.inner.lock().remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<NetworkCandidate> {
        self.inner.lock().candidates.clone()
    }

    /// Number of times the controller tore a session down.
    pub fn sessions_closed(&self) -> usize {
        self.inner.lock().sessions_closed
    }
}

#[async_trait]
impl TransportEngine for RecordingEngine {
    async fn acquire_local_media(&self) -> Result<(), EngineError> {
        if self.inner.lock().deny_media {
            return Err(EngineError::CapabilityDenied(format!(
                "{}: media permission denied",
                self.label
            )));
        }
        Ok(())
    }

    async fn create_local_description(
        &self,
        role: SdpKind,
    ) -> Result<SignalDescription, EngineError> {
        let mut state = self.inner.lock();
        if state.fail_descriptions {
            return Err(EngineError::CapabilityDenied(format!(
                "{}: cannot create {role}",
                self.label
            )));
        }
        if role == SdpKind::Answer && state.remote.is_none() {
            return Err(EngineError::InvalidDescription(
                "answer requested without a remote offer".into(),
            ));
        }
        state.generation += 1;
        let sdp = format!(
            "v=0\r\no={} {} 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n",
            self.label, state.generation
        );
        Ok(SignalDescription { kind: role, sdp })
    }

    async fn set_local_description(
        &self,
        description: SignalDescription,
    ) -> Result<(), EngineError> {
        self.inner.lock().local = Some(description);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SignalDescription,
    ) -> Result<(), EngineError> {
        if !description.sdp.starts_with("v=0") {
            return Err(EngineError::InvalidDescription(format!(
                "{} sdp does not start with a version line",
                description.kind
            )));
        }
        self.inner.lock().remote = Some(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: NetworkCandidate) -> Result<(), EngineError> {
        let mut state = self.inner.lock();
        if state.remote.is_none() {
            return Err(EngineError::InvalidCandidate(
                "candidate added before remote description".into(),
            ));
        }
        if candidate.candidate.trim().is_empty() {
            return Err(EngineError::InvalidCandidate("empty candidate line".into()));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.inner.lock();
        state.local = None;
        state.remote = None;
        state.sessions_closed += 1;
    }
}
