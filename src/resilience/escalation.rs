//! Retry budget and managed relay escalation

use super::guard::Deadline;
use super::{ResilienceError, SessionEvent};
use crate::webrtc::{CallId, FallbackCredentials, SignalingChannel, SignalingMessage, WebRTCError};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// What to do after a failure has been counted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    /// Try another relay-only connection
    RelayAttempt,
    /// Ask for the managed relay
    Escalate,
    /// Nothing left to try
    GiveUp,
}

/// Failure counter shared by every recovery of a call.
///
/// The count is cumulative for the session: a successful relay recovery does
/// not reset it.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_retries: u32,
    retry_count: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            retry_count: 0,
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether the next failure still leads to a relay attempt
    pub fn has_relay_attempts_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Count one failure and decide the next step
    pub fn record_failure(&mut self) -> RecoveryStep {
        self.retry_count = self.retry_count.saturating_add(1);
        if self.retry_count <= self.max_retries {
            RecoveryStep::RelayAttempt
        } else if self.retry_count == self.max_retries + 1 {
            RecoveryStep::Escalate
        } else {
            RecoveryStep::GiveUp
        }
    }
}

struct PendingRequest {
    request: u64,
    _timer: Option<Deadline>,
}

/// Requests the managed relay once the retry budget is spent
pub struct EscalationController {
    call_id: CallId,
    budget: RetryBudget,
    timeout: Option<Duration>,
    intake: mpsc::UnboundedSender<SessionEvent>,
    pending: Option<PendingRequest>,
    requests_sent: u64,
}

impl EscalationController {
    pub(crate) fn new(
        call_id: CallId,
        max_retries: u32,
        timeout: Option<Duration>,
        intake: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            call_id,
            budget: RetryBudget::new(max_retries),
            timeout,
            intake,
            pending: None,
            requests_sent: 0,
        }
    }

    pub fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    pub fn record_failure(&mut self) -> RecoveryStep {
        let step = self.budget.record_failure();
        debug!(
            "Call {}: failure {} of {} -> {:?}",
            self.call_id,
            self.budget.retry_count(),
            self.budget.max_retries(),
            step
        );
        step
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[cfg(test)]
    pub(crate) fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    /// Send the managed relay request and start waiting for the answer
    pub async fn request_fallback(&mut self, signaling: &dyn SignalingChannel) -> Result<(), WebRTCError> {
        if self.pending.is_some() {
            debug!("Call {}: managed relay already requested", self.call_id);
            return Ok(());
        }

        let attempt = self.budget.retry_count();
        signaling
            .send(SignalingMessage::fallback_request(self.call_id.clone(), attempt))
            .await?;

        self.requests_sent += 1;
        let request = self.requests_sent;
        let timer = self.timeout.map(|timeout| {
            Deadline::start(
                timeout,
                self.intake.clone(),
                SessionEvent::EscalationDeadline { request },
            )
        });
        self.pending = Some(PendingRequest {
            request,
            _timer: timer,
        });

        match self.timeout {
            Some(timeout) => info!(
                "Call {}: requested managed relay, waiting up to {:?}",
                self.call_id, timeout
            ),
            None => info!("Call {}: requested managed relay", self.call_id),
        }
        Ok(())
    }

    /// Handle granted credentials; `None` when nothing was requested
    pub fn accept(
        &mut self,
        credentials: FallbackCredentials,
    ) -> Option<Result<FallbackCredentials, ResilienceError>> {
        if self.pending.take().is_none() {
            return None;
        }
        Some(
            credentials
                .validate()
                .map(|()| credentials)
                .map_err(ResilienceError::InvalidCredentials),
        )
    }

    /// Handle a refusal; `None` when nothing was requested
    pub fn reject(&mut self, reason: &str) -> Option<ResilienceError> {
        self.pending.take()?;
        Some(ResilienceError::EscalationRejected(reason.to_string()))
    }

    /// True when the elapsed deadline belongs to the outstanding request
    pub fn deadline_elapsed(&mut self, request: u64) -> bool {
        if self.pending.as_ref().map(|pending| pending.request) != Some(request) {
            return false;
        }
        warn!("Call {}: managed relay request timed out", self.call_id);
        self.pending = None;
        true
    }

    /// Stop waiting and cancel the timer
    pub fn cancel(&mut self) {
        self.pending = None;
    }
}
