//! Lifecycle bookkeeping for a call session
//!
//! Owns the fallback state, the single-flight flag and the UI notifications.
//! Timers are `Deadline`s: dropping one cancels it.

use super::state::{CallStatus, FailureReason, FallbackState, FallbackTransition, InvalidTransition};
use super::SessionEvent;
use crate::webrtc::{CallId, FallbackCredentials};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// One-shot timer delivering an event to the session intake.
///
/// Cancelled when dropped, so replacing the field holding it cancels the
/// previous timer first.
#[derive(Debug)]
pub struct Deadline {
    handle: JoinHandle<()>,
}

impl Deadline {
    pub(crate) fn start(
        after: Duration,
        intake: mpsc::UnboundedSender<SessionEvent>,
        event: SessionEvent,
    ) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = intake.send(event);
        });
        Self { handle }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

type ReconnectedCallback = Box<dyn Fn() + Send + Sync>;
type FailedCallback = Box<dyn Fn(&FailureReason) + Send + Sync>;

/// UI callbacks for a call session
#[derive(Default)]
pub struct SessionCallbacks {
    on_reconnected: Option<ReconnectedCallback>,
    on_failed: Option<FailedCallback>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per successful recovery
    pub fn on_reconnected(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_reconnected = Some(Box::new(callback));
        self
    }

    /// Called at most once, when the call cannot be restored
    pub fn on_failed(mut self, callback: impl Fn(&FailureReason) + Send + Sync + 'static) -> Self {
        self.on_failed = Some(Box::new(callback));
        self
    }
}

pub struct LifecycleGuard {
    call_id: CallId,
    state: FallbackState,
    recovering: bool,
    failed_notified: bool,
    status: watch::Sender<CallStatus>,
    callbacks: SessionCallbacks,
}

impl LifecycleGuard {
    pub fn new(call_id: CallId, callbacks: SessionCallbacks) -> (Self, watch::Receiver<CallStatus>) {
        let (status, status_rx) = watch::channel(CallStatus::new(call_id.clone()));
        let guard = Self {
            call_id,
            state: FallbackState::Direct,
            recovering: false,
            failed_notified: false,
            status,
            callbacks,
        };
        (guard, status_rx)
    }

    pub fn state(&self) -> FallbackState {
        self.state
    }

    /// Apply a transition and publish the new state
    pub fn transition(
        &mut self,
        transition: FallbackTransition,
    ) -> Result<FallbackState, InvalidTransition> {
        let next = self.state.apply(transition)?;
        if next != self.state {
            info!("Call {}: {} -> {} ({:?})", self.call_id, self.state, next, transition);
        }
        self.state = next;
        if next.is_terminal() {
            self.recovering = false;
        }
        self.status.send_modify(|status| status.state = next);
        Ok(next)
    }

    /// Mark a recovery as in flight; false if one already is
    pub fn begin_recovery(&mut self) -> bool {
        if self.recovering || self.state.is_terminal() {
            return false;
        }
        self.recovering = true;
        true
    }

    pub fn end_recovery(&mut self) {
        self.recovering = false;
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    pub fn publish_retry_count(&self, retry_count: u32) {
        self.status.send_modify(|status| status.retry_count = retry_count);
    }

    pub fn publish_managed_relay(&self, credentials: FallbackCredentials) {
        self.status
            .send_modify(|status| status.managed_relay = Some(credentials));
    }

    pub fn notify_reconnected(&self) {
        debug!("Call {}: notifying reconnection", self.call_id);
        if let Some(callback) = &self.callbacks.on_reconnected {
            callback();
        }
    }

    /// Record the failure and notify the UI, at most once per session
    pub fn notify_failed(&mut self, reason: &FailureReason) {
        if self.failed_notified {
            warn!("Call {}: suppressing repeated failure: {}", self.call_id, reason);
            return;
        }
        self.failed_notified = true;
        let failure = reason.clone();
        self.status.send_modify(|status| status.failure = Some(failure));
        if let Some(callback) = &self.callbacks.on_failed {
            callback(reason);
        }
    }
}
