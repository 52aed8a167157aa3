//! Fallback state machine

use crate::webrtc::{CallId, FallbackCredentials};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where a call's media path currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackState {
    /// Normal peer-to-peer connection
    Direct,
    /// Relay-only reconnection in flight
    Reconnecting,
    /// Reconnected through a relay
    Relay,
    /// Waiting for, or using, the managed relay
    ManagedRelayFallback,
    /// Connection could not be restored
    Failed,
    /// Session ended by the local or remote side
    TornDown,
}

impl FallbackState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FallbackState::Failed | FallbackState::TornDown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackState::Direct => "direct",
            FallbackState::Reconnecting => "reconnecting",
            FallbackState::Relay => "relay",
            FallbackState::ManagedRelayFallback => "managed-relay-fallback",
            FallbackState::Failed => "failed",
            FallbackState::TornDown => "torn-down",
        }
    }

    /// Compute the state reached by applying `transition`
    pub fn apply(self, transition: FallbackTransition) -> Result<FallbackState, InvalidTransition> {
        use FallbackState::*;
        use FallbackTransition::*;

        let next = match (self, transition) {
            (Direct | Relay, LossDetected) => Reconnecting,
            (Reconnecting, RelayAttemptFailed) => Reconnecting,
            (Reconnecting, RelayRecovered) => Relay,
            (Reconnecting, BudgetExhausted) => ManagedRelayFallback,
            (ManagedRelayFallback, FallbackAccepted) => Relay,
            (ManagedRelayFallback, EscalationFailed) => Failed,
            (Reconnecting | ManagedRelayFallback, RetryCeilingExceeded) => Failed,
            (current, TearDown) if !current.is_terminal() => TornDown,
            (from, transition) => return Err(InvalidTransition { from, transition }),
        };
        Ok(next)
    }
}

impl fmt::Display for FallbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the fallback state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTransition {
    LossDetected,
    RelayAttemptFailed,
    RelayRecovered,
    BudgetExhausted,
    FallbackAccepted,
    EscalationFailed,
    RetryCeilingExceeded,
    TearDown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition {transition:?} in state {from}")]
pub struct InvalidTransition {
    pub from: FallbackState,
    pub transition: FallbackTransition,
}

/// Why a call ended in `failed`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailureReason {
    #[error("connection not restored after {retries} failures")]
    RetryCeilingExceeded { retries: u32 },

    #[error("managed relay request failed: {0}")]
    EscalationFailed(String),

    #[error("managed relay rejected: {0}")]
    EscalationRejected(String),

    #[error("invalid managed relay credentials: {0}")]
    InvalidCredentials(String),
}

/// Read-only snapshot of a call's recovery status, as exposed to the UI
#[derive(Debug, Clone, PartialEq)]
pub struct CallStatus {
    pub call_id: CallId,
    pub state: FallbackState,
    pub retry_count: u32,
    /// Credentials for the managed relay, once granted
    pub managed_relay: Option<FallbackCredentials>,
    pub failure: Option<FailureReason>,
}

impl CallStatus {
    pub fn new(call_id: CallId) -> Self {
        Self {
            call_id,
            state: FallbackState::Direct,
            retry_count: 0,
            managed_relay: None,
            failure: None,
        }
    }
}
