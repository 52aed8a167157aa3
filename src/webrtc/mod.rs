//! WebRTC collaborators of the resilience core
//!
//! This module provides:
//! - The peer-connection handle abstraction and its webrtc-rs implementation
//! - The signaling message set and the signaling channel abstraction

pub mod peer_connection;
pub mod signaling;

pub use peer_connection::{
    ConnectionId, IceCandidate, LocalTrack, PeerConnection, PeerConnectionFactory,
    PeerConnectionManager, PeerEvent, PeerEventHandler, PeerState, RtcPeerConnection,
    TransportPolicy,
};
pub use signaling::{CallId, FallbackCredentials, SignalingBody, SignalingChannel, SignalingMessage};

use thiserror::Error;

/// WebRTC-related errors
#[derive(Debug, Error)]
pub enum WebRTCError {
    /// Peer connection creation or teardown failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// SDP processing failed
    #[error("SDP error: {0}")]
    SdpError(String),

    /// ICE candidate processing failed
    #[error("ICE error: {0}")]
    IceError(String),

    /// Media track error
    #[error("Media error: {0}")]
    MediaError(String),

    /// Signaling message could not be encoded, decoded or delivered
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// The connection or channel is already closed
    #[error("Closed")]
    Closed,
}
