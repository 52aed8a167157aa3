//! In-memory collaborators for exercising call sessions without a network

use crate::webrtc::{
    IceCandidate, LocalTrack, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventHandler,
    PeerState, SignalingChannel, SignalingMessage, TransportPolicy, WebRTCError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::Duration;
use webrtc::api::media_engine::MIME_TYPE_OPUS;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

#[derive(Default)]
struct Liveness {
    live: usize,
    max_live: usize,
    opened: usize,
}

impl Liveness {
    fn open(&mut self) {
        self.live += 1;
        self.opened += 1;
        self.max_live = self.max_live.max(self.live);
    }
}

/// Factory handing out `MockPeer`s and recording how many are open
#[derive(Default)]
pub(crate) struct MockNetwork {
    liveness: Arc<Mutex<Liveness>>,
    created: Mutex<Vec<Arc<MockPeer>>>,
    failing_creates: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn track(id: &str) -> LocalTrack {
        Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            "local-stream".to_owned(),
        ))
    }

    /// The call's initial peer-to-peer connection
    pub fn open_initial(&self) -> Arc<MockPeer> {
        self.liveness.lock().open();
        Arc::new(MockPeer::new(TransportPolicy::All, self.liveness.clone()))
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Connections created through the factory
    pub fn created(&self) -> Vec<Arc<MockPeer>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<MockPeer>> {
        self.created.lock().last().cloned()
    }

    pub fn live(&self) -> usize {
        self.liveness.lock().live
    }

    pub fn max_live(&self) -> usize {
        self.liveness.lock().max_live
    }
}

#[async_trait]
impl PeerConnectionFactory for MockNetwork {
    async fn create(&self, policy: TransportPolicy) -> Result<Arc<dyn PeerConnection>, WebRTCError> {
        let failing = self.failing_creates.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_creates.store(failing - 1, Ordering::SeqCst);
            return Err(WebRTCError::ConnectionFailed("no relay available".into()));
        }

        self.liveness.lock().open();
        let peer = Arc::new(MockPeer::new(policy, self.liveness.clone()));
        self.created.lock().push(peer.clone());
        Ok(peer)
    }
}

/// Scriptable peer connection
pub(crate) struct MockPeer {
    policy: TransportPolicy,
    liveness: Arc<Mutex<Liveness>>,
    state: Mutex<PeerState>,
    handler: Mutex<Option<PeerEventHandler>>,
    /// Last handler ever subscribed, kept to simulate events already in flight
    retained: Mutex<Option<PeerEventHandler>>,
    closed: AtomicBool,
    tracks: AtomicUsize,
    answers: Mutex<Vec<String>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    fail_answer: AtomicBool,
    close_delay: Mutex<Option<Duration>>,
}

impl MockPeer {
    fn new(policy: TransportPolicy, liveness: Arc<Mutex<Liveness>>) -> Self {
        Self {
            policy,
            liveness,
            state: Mutex::new(PeerState::New),
            handler: Mutex::new(None),
            retained: Mutex::new(None),
            closed: AtomicBool::new(false),
            tracks: AtomicUsize::new(0),
            answers: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            fail_answer: AtomicBool::new(false),
            close_delay: Mutex::new(None),
        }
    }

    /// Change state and notify the subscribed handler
    pub fn emit(&self, state: PeerState) {
        *self.state.lock() = state;
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(PeerEvent::StateChanged(state));
        }
    }

    /// Deliver a state change even if the handler was since unsubscribed
    pub fn emit_late(&self, state: PeerState) {
        let handler = self.retained.lock().clone();
        if let Some(handler) = handler {
            handler(PeerEvent::StateChanged(state));
        }
    }

    /// Report a locally gathered candidate
    pub fn gather(&self, candidate: IceCandidate) {
        let handler = self.handler.lock().clone();
        if let Some(handler) = handler {
            handler(PeerEvent::CandidateGathered(candidate));
        }
    }

    pub fn fail_answers(&self) {
        self.fail_answer.store(true, Ordering::SeqCst);
    }

    /// Make `close` take this long before the connection is actually closed
    pub fn close_slowly(&self, delay: Duration) {
        *self.close_delay.lock() = Some(delay);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.handler.lock().is_some()
    }

    pub fn attached_tracks(&self) -> usize {
        self.tracks.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> Vec<String> {
        self.answers.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.remote_candidates.lock().clone()
    }
}

#[async_trait]
impl PeerConnection for MockPeer {
    fn policy(&self) -> TransportPolicy {
        self.policy
    }

    fn state(&self) -> PeerState {
        *self.state.lock()
    }

    fn subscribe(&self, handler: PeerEventHandler) {
        *self.retained.lock() = Some(handler.clone());
        *self.handler.lock() = Some(handler);
    }

    fn unsubscribe(&self) {
        self.handler.lock().take();
    }

    async fn attach_track(&self, _track: LocalTrack) -> Result<(), WebRTCError> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WebRTCError> {
        Ok(format!("v=0 relay-offer tracks={}", self.attached_tracks()))
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), WebRTCError> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(WebRTCError::SdpError("malformed answer".into()));
        }
        self.answers.lock().push(sdp.to_string());
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        self.remote_candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        let delay = *self.close_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.handler.lock().take();
        if !self.closed.swap(true, Ordering::SeqCst) {
            *self.state.lock() = PeerState::Closed;
            self.liveness.lock().live -= 1;
        }
        Ok(())
    }
}

/// Signaling channel recording every message sent
#[derive(Default)]
pub(crate) struct MockSignaling {
    sent: Mutex<Vec<SignalingMessage>>,
    failing_kinds: Mutex<Vec<&'static str>>,
}

impl MockSignaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every send of this message type fail
    pub fn fail_on(&self, kind: &'static str) {
        self.failing_kinds.lock().push(kind);
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_of(&self, kind: &str) -> Vec<SignalingMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|message| message.kind() == kind)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SignalingChannel for MockSignaling {
    async fn send(&self, message: SignalingMessage) -> Result<(), WebRTCError> {
        if self.failing_kinds.lock().contains(&message.kind()) {
            return Err(WebRTCError::SignalingError("signaling server unreachable".into()));
        }
        self.sent.lock().push(message);
        Ok(())
    }
}
