//! Call resilience
//!
//! Keeps a call's media path alive across network degradation:
//! - `monitor`: deadline-bounded observation of a connection attempt
//! - `reconnector`: relay-only renegotiation of a failed connection
//! - `escalation`: retry budget and the managed relay request
//! - `guard`: fallback state, timers and UI notifications
//! - `session`: the per-call driver tying them together

pub mod escalation;
pub mod guard;
pub mod monitor;
pub mod reconnector;
pub mod session;
pub mod state;

#[cfg(test)]
mod testing;

pub use escalation::{EscalationController, RecoveryStep, RetryBudget};
pub use guard::{Deadline, LifecycleGuard, SessionCallbacks};
pub use monitor::{ConnectivityMonitor, Verdict};
pub use reconnector::RelayReconnector;
pub use session::{CallSession, SessionContext, SignalingInbox};
pub use state::{CallStatus, FailureReason, FallbackState, FallbackTransition, InvalidTransition};

use crate::webrtc::{ConnectionId, PeerEvent, SignalingMessage, WebRTCError};
use thiserror::Error;

/// Errors raised inside a recovery attempt.
///
/// These never reach the UI; the session translates them into transitions.
#[derive(Debug, Error)]
pub enum ResilienceError {
    #[error(transparent)]
    Peer(#[from] WebRTCError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("invalid managed relay credentials: {0}")]
    InvalidCredentials(String),

    #[error("managed relay rejected: {0}")]
    EscalationRejected(String),

    #[error("no relay connection is being negotiated")]
    NoActiveConnection,

    #[error("call session closed")]
    SessionClosed,
}

/// Everything the session driver reacts to, delivered through one intake
#[derive(Debug, Clone)]
pub(crate) enum SessionEvent {
    /// Raised by a peer connection, tagged with the connection it came from
    Peer {
        connection: ConnectionId,
        event: PeerEvent,
    },
    /// The ICE deadline of a monitored attempt elapsed
    IceDeadline { attempt: u64 },
    /// No answer to a managed relay request in time
    EscalationDeadline { request: u64 },
    /// Inbound signaling message
    Signaling(SignalingMessage),
    /// Loss reported by the transport using the managed relay
    ConnectivityLost,
}
