//! Call session driver
//!
//! Each call runs one task that owns the monitor, reconnector, escalation
//! controller and lifecycle guard. Peer events, timer expirations and
//! signaling messages all arrive through a single intake and are handled one
//! at a time, in arrival order.

use super::escalation::{EscalationController, RecoveryStep};
use super::guard::{LifecycleGuard, SessionCallbacks};
use super::monitor::{ConnectivityMonitor, Verdict};
use super::reconnector::RelayReconnector;
use super::state::{CallStatus, FailureReason, FallbackState, FallbackTransition};
use super::{ResilienceError, SessionEvent};
use crate::config::CallConfig;
use crate::webrtc::{
    CallId, ConnectionId, LocalTrack, PeerConnection, PeerConnectionFactory, PeerEvent, PeerState,
    SignalingBody, SignalingChannel, SignalingMessage,
};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Collaborators a call session drives
pub struct SessionContext {
    /// Creates replacement connections
    pub factory: Arc<dyn PeerConnectionFactory>,
    /// Outbound signaling
    pub signaling: Arc<dyn SignalingChannel>,
    /// The caller's local tracks, re-attached to every replacement connection
    pub local_tracks: Vec<LocalTrack>,
}

/// Handle to a running call session.
///
/// Dropping the handle tears the session down.
pub struct CallSession {
    call_id: CallId,
    intake: mpsc::UnboundedSender<SessionEvent>,
    status: watch::Receiver<CallStatus>,
    shutdown: Option<oneshot::Sender<()>>,
    driver: Option<JoinHandle<()>>,
}

impl CallSession {
    /// Start supervising `initial`, the call's established peer connection.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: &CallConfig,
        call_id: CallId,
        initial: Arc<dyn PeerConnection>,
        context: SessionContext,
        callbacks: SessionCallbacks,
    ) -> Self {
        let (intake, events) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (guard, status) = LifecycleGuard::new(call_id.clone(), callbacks);

        let mut coordinator = RecoveryCoordinator {
            call_id: call_id.clone(),
            guard,
            monitor: ConnectivityMonitor::new(config.ice_deadline(), intake.clone()),
            reconnector: RelayReconnector::new(
                call_id.clone(),
                context.factory,
                context.local_tracks,
                intake.clone(),
            ),
            escalation: EscalationController::new(
                call_id.clone(),
                config.max_retries,
                config.escalation_timeout(),
                intake.clone(),
            ),
            signaling: context.signaling,
        };

        let initial_id = coordinator.reconnector.adopt(initial.clone());
        // Already-established calls are not put on an ICE deadline
        if !initial.state().is_connected() {
            coordinator.monitor.arm(initial_id);
        }
        info!(
            "Call {}: session started (max retries {}, ICE deadline {:?})",
            call_id,
            config.max_retries,
            config.ice_deadline()
        );

        let driver = tokio::spawn(coordinator.run(events, shutdown_rx));

        Self {
            call_id,
            intake,
            status,
            shutdown: Some(shutdown_tx),
            driver: Some(driver),
        }
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn state(&self) -> FallbackState {
        self.status.borrow().state
    }

    pub fn retry_count(&self) -> u32 {
        self.status.borrow().retry_count
    }

    /// Current status snapshot
    pub fn status(&self) -> CallStatus {
        self.status.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status.clone()
    }

    /// Sink for inbound signaling messages of this call
    pub fn signaling_inbox(&self) -> SignalingInbox {
        SignalingInbox {
            intake: self.intake.clone(),
        }
    }

    pub fn deliver_signaling(&self, message: SignalingMessage) -> Result<(), ResilienceError> {
        self.intake
            .send(SessionEvent::Signaling(message))
            .map_err(|_| ResilienceError::SessionClosed)
    }

    /// Report a loss of the managed relay path to the session
    pub fn report_connectivity_loss(&self) -> Result<(), ResilienceError> {
        self.intake
            .send(SessionEvent::ConnectivityLost)
            .map_err(|_| ResilienceError::SessionClosed)
    }

    /// End the session: cancel timers, release listeners and the connection.
    ///
    /// When this returns the session is in a terminal state and no callback
    /// can fire any more.
    pub async fn teardown(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(driver) = self.driver.take() {
            if let Err(e) = driver.await {
                error!("Call {}: session driver panicked: {}", self.call_id, e);
            }
        }
    }
}

/// Cloneable entry point for inbound signaling
#[derive(Clone)]
pub struct SignalingInbox {
    intake: mpsc::UnboundedSender<SessionEvent>,
}

impl SignalingInbox {
    pub fn deliver(&self, message: SignalingMessage) -> Result<(), ResilienceError> {
        self.intake
            .send(SessionEvent::Signaling(message))
            .map_err(|_| ResilienceError::SessionClosed)
    }

    /// Forward everything from `inbound` until either side goes away
    pub fn forward(self, mut inbound: mpsc::UnboundedReceiver<SignalingMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if self.deliver(message).is_err() {
                    break;
                }
            }
        })
    }
}

/// Owns "handle a failure" and "attempt a reconnect" for one call
struct RecoveryCoordinator {
    call_id: CallId,
    guard: LifecycleGuard,
    monitor: ConnectivityMonitor,
    reconnector: RelayReconnector,
    escalation: EscalationController,
    signaling: Arc<dyn SignalingChannel>,
}

impl RecoveryCoordinator {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        loop {
            let event = tokio::select! {
                biased;
                _ = &mut shutdown => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let interrupted = tokio::select! {
                biased;
                _ = &mut shutdown => true,
                _ = self.handle(event) => false,
            };
            if interrupted || self.guard.state().is_terminal() {
                break;
            }
        }

        self.tear_down().await;
    }

    async fn handle(&mut self, event: SessionEvent) {
        if self.guard.state().is_terminal() {
            return;
        }

        match event {
            SessionEvent::Peer {
                connection,
                event: PeerEvent::StateChanged(state),
            } => self.on_peer_state(connection, state).await,
            SessionEvent::Peer {
                connection,
                event: PeerEvent::CandidateGathered(candidate),
            } => {
                self.reconnector
                    .forward_candidate(connection, candidate, self.signaling.as_ref())
                    .await
            }
            SessionEvent::IceDeadline { attempt } => {
                if let Some(verdict) = self
                    .monitor
                    .deadline_elapsed(attempt, self.escalation.budget())
                {
                    self.on_verdict(verdict).await;
                }
            }
            SessionEvent::EscalationDeadline { request } => {
                if self.escalation.deadline_elapsed(request) {
                    self.handle_failure().await;
                }
            }
            SessionEvent::Signaling(message) => self.on_signaling(message).await,
            SessionEvent::ConnectivityLost => self.on_connectivity_lost().await,
        }
    }

    async fn on_peer_state(&mut self, connection: ConnectionId, state: PeerState) {
        if !self.reconnector.is_current(connection) {
            debug!(
                "Call {}: ignoring {:?} from superseded connection {}",
                self.call_id, state, connection
            );
            return;
        }

        if self.monitor.is_watching(connection) {
            if let Some(verdict) = self
                .monitor
                .observe(connection, state, self.escalation.budget())
            {
                self.on_verdict(verdict).await;
            }
            return;
        }

        if state.is_lost() {
            info!("Call {}: {} lost ({:?})", self.call_id, connection, state);
            self.on_connectivity_lost().await;
        }
    }

    async fn on_verdict(&mut self, verdict: Verdict) {
        match verdict {
            Verdict::Recovered => {
                if self.guard.state() == FallbackState::Reconnecting {
                    self.transition(FallbackTransition::RelayRecovered);
                    self.guard.end_recovery();
                    self.guard.notify_reconnected();
                } else {
                    debug!("Call {}: connection healthy", self.call_id);
                }
            }
            Verdict::DegradedRetry | Verdict::FailedPermanently => self.handle_failure().await,
        }
    }

    /// Entry point for losses not tied to a monitored attempt
    async fn on_connectivity_lost(&mut self) {
        if self.guard.is_recovering() {
            debug!("Call {}: recovery already in flight", self.call_id);
            return;
        }
        match self.guard.state() {
            FallbackState::Direct | FallbackState::Relay => self.handle_failure().await,
            state => debug!("Call {}: ignoring loss in state {}", self.call_id, state),
        }
    }

    /// Count a failure and run the next recovery step
    async fn handle_failure(&mut self) {
        match self.guard.state() {
            FallbackState::Direct | FallbackState::Relay => {
                self.transition(FallbackTransition::LossDetected);
            }
            FallbackState::Reconnecting => {
                self.transition(FallbackTransition::RelayAttemptFailed);
            }
            FallbackState::ManagedRelayFallback => {}
            FallbackState::Failed | FallbackState::TornDown => return,
        }
        self.guard.begin_recovery();

        loop {
            let step = self.escalation.record_failure();
            let retries = self.escalation.budget().retry_count();
            self.guard.publish_retry_count(retries);

            match step {
                RecoveryStep::RelayAttempt => {
                    match self.reconnector.reconnect(self.signaling.as_ref()).await {
                        Ok(connection) => {
                            self.monitor.arm(connection);
                            return;
                        }
                        Err(e) => {
                            warn!("Call {}: relay attempt {} failed: {}", self.call_id, retries, e);
                            self.transition(FallbackTransition::RelayAttemptFailed);
                        }
                    }
                }
                RecoveryStep::Escalate => {
                    self.transition(FallbackTransition::BudgetExhausted);
                    self.escalate().await;
                    return;
                }
                RecoveryStep::GiveUp => {
                    self.fail(FailureReason::RetryCeilingExceeded { retries }).await;
                    return;
                }
            }
        }
    }

    async fn escalate(&mut self) {
        self.monitor.abandon();
        self.reconnector.release().await;
        if let Err(e) = self.escalation.request_fallback(self.signaling.as_ref()).await {
            error!("Call {}: managed relay request failed: {}", self.call_id, e);
            self.fail(FailureReason::EscalationFailed(e.to_string())).await;
        }
    }

    async fn on_signaling(&mut self, message: SignalingMessage) {
        let kind = message.kind();
        if message.call_id != self.call_id {
            debug!(
                "Call {}: ignoring {} addressed to call {}",
                self.call_id, kind, message.call_id
            );
            return;
        }

        match message.body {
            SignalingBody::Answer { sdp } => {
                if !self.reconnector.has_relay_connection() {
                    debug!("Call {}: no relay connection awaiting an answer", self.call_id);
                    return;
                }
                if let Err(e) = self.reconnector.apply_answer(&sdp).await {
                    warn!("Call {}: rejecting relay answer: {}", self.call_id, e);
                    let attempt_in_flight = self
                        .reconnector
                        .active_id()
                        .is_some_and(|id| self.monitor.is_watching(id));
                    if attempt_in_flight {
                        self.monitor.abandon();
                        self.handle_failure().await;
                    }
                }
            }
            SignalingBody::IceCandidate(candidate) => {
                if !self.reconnector.has_relay_connection() {
                    debug!("Call {}: dropping remote candidate", self.call_id);
                    return;
                }
                if let Err(e) = self.reconnector.add_remote_candidate(candidate).await {
                    warn!("Call {}: failed to add remote candidate: {}", self.call_id, e);
                }
            }
            SignalingBody::FallbackAccepted(credentials) => match self.escalation.accept(credentials) {
                Some(Ok(credentials)) => {
                    info!(
                        "Call {}: managed relay granted ({} URLs)",
                        self.call_id,
                        credentials.urls.len()
                    );
                    self.transition(FallbackTransition::FallbackAccepted);
                    self.guard.publish_managed_relay(credentials);
                    self.guard.end_recovery();
                    self.guard.notify_reconnected();
                }
                Some(Err(ResilienceError::InvalidCredentials(reason))) => {
                    self.fail(FailureReason::InvalidCredentials(reason)).await;
                }
                Some(Err(e)) => self.fail(FailureReason::EscalationFailed(e.to_string())).await,
                None => debug!("Call {}: ignoring unsolicited fallback-accepted", self.call_id),
            },
            SignalingBody::FallbackRejected { reason } => {
                if self.escalation.reject(&reason).is_some() {
                    warn!("Call {}: managed relay rejected: {}", self.call_id, reason);
                    self.fail(FailureReason::EscalationRejected(reason)).await;
                } else {
                    debug!("Call {}: ignoring unsolicited fallback-rejected", self.call_id);
                }
            }
            SignalingBody::Offer { .. } | SignalingBody::FallbackRequest { .. } => {
                debug!("Call {}: ignoring inbound {}", self.call_id, kind);
            }
        }
    }

    async fn fail(&mut self, reason: FailureReason) {
        self.dispose().await;
        let transition = match reason {
            FailureReason::RetryCeilingExceeded { .. } => FallbackTransition::RetryCeilingExceeded,
            _ => FallbackTransition::EscalationFailed,
        };
        self.transition(transition);
        error!("Call {}: connection could not be restored: {}", self.call_id, reason);
        self.guard.notify_failed(&reason);
    }

    /// Cancel timers, unsubscribe listeners, close the owned connection
    async fn dispose(&mut self) {
        self.monitor.abandon();
        self.escalation.cancel();
        self.reconnector.release().await;
        self.guard.end_recovery();
    }

    async fn tear_down(&mut self) {
        self.dispose().await;
        if !self.guard.state().is_terminal() {
            self.transition(FallbackTransition::TearDown);
            info!("Call {}: session torn down", self.call_id);
        }
    }

    fn transition(&mut self, transition: FallbackTransition) {
        if let Err(e) = self.guard.transition(transition) {
            error!("Call {}: {}", self.call_id, e);
        }
    }
}
