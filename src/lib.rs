//! call-resilience - keeps a peer-to-peer call alive across network degradation
//!
//! Watches the peer connection of an ongoing audio/video call, rebuilds it over a
//! relay-only transport when connectivity is lost, and escalates to a managed media
//! relay when relayed connectivity keeps failing.

pub mod config;
pub mod logging;
pub mod resilience;
pub mod transport;
pub mod webrtc;

// Re-exports
pub use config::{CallConfig, Config, IceConfig, LoggingConfig, SignalingConfig};
pub use resilience::{
    CallSession, CallStatus, FailureReason, FallbackState, ResilienceError, SessionCallbacks,
    SessionContext, SignalingInbox,
};
pub use transport::WebSocketSignaling;
pub use crate::webrtc::{
    CallId, FallbackCredentials, PeerConnection, PeerConnectionFactory, PeerConnectionManager,
    PeerState, SignalingChannel, SignalingMessage, TransportPolicy, WebRTCError,
};
