//! Connectivity monitor
//!
//! Watches one connection attempt at a time and reports a single verdict for
//! it: the connection came up, or it was lost (or never came up) before the
//! ICE deadline.

use super::escalation::RetryBudget;
use super::guard::Deadline;
use super::SessionEvent;
use crate::webrtc::{ConnectionId, PeerState};
use log::{debug, info};
use tokio::sync::mpsc;
use tokio::time::Duration;

/// Outcome of one monitored attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Recovered,
    /// Failed, and another relay attempt is still in the budget
    DegradedRetry,
    /// Failed with no relay attempt left
    FailedPermanently,
}

impl Verdict {
    fn for_failure(budget: &RetryBudget) -> Self {
        if budget.has_relay_attempts_left() {
            Verdict::DegradedRetry
        } else {
            Verdict::FailedPermanently
        }
    }
}

/// Deadline of the attempt currently being watched
struct IceTimer {
    attempt: u64,
    connection: ConnectionId,
    _deadline: Deadline,
}

pub struct ConnectivityMonitor {
    deadline: Duration,
    intake: mpsc::UnboundedSender<SessionEvent>,
    attempts: u64,
    timer: Option<IceTimer>,
}

impl ConnectivityMonitor {
    pub(crate) fn new(deadline: Duration, intake: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            deadline,
            intake,
            attempts: 0,
            timer: None,
        }
    }

    /// Start watching `connection`, cancelling any previous attempt first
    pub fn arm(&mut self, connection: ConnectionId) -> u64 {
        self.timer = None;
        self.attempts += 1;
        let attempt = self.attempts;
        let deadline = Deadline::start(
            self.deadline,
            self.intake.clone(),
            SessionEvent::IceDeadline { attempt },
        );
        self.timer = Some(IceTimer {
            attempt,
            connection,
            _deadline: deadline,
        });
        debug!("Watching {} (attempt {}, deadline {:?})", connection, attempt, self.deadline);
        attempt
    }

    /// Whether an attempt on `connection` is awaiting its verdict
    pub fn is_watching(&self, connection: ConnectionId) -> bool {
        self.timer.as_ref().map(|timer| timer.connection) == Some(connection)
    }

    pub fn is_armed(&self) -> bool {
        self.timer.is_some()
    }

    /// Feed a state change; yields the verdict when the attempt settles
    pub fn observe(
        &mut self,
        connection: ConnectionId,
        state: PeerState,
        budget: &RetryBudget,
    ) -> Option<Verdict> {
        if !self.is_watching(connection) {
            return None;
        }

        let verdict = if state.is_connected() {
            Verdict::Recovered
        } else if state.is_lost() {
            Verdict::for_failure(budget)
        } else {
            return None;
        };

        self.timer = None;
        info!("{} settled: {:?} ({:?})", connection, verdict, state);
        Some(verdict)
    }

    /// Handle an elapsed deadline; stale deadlines yield nothing
    pub fn deadline_elapsed(&mut self, attempt: u64, budget: &RetryBudget) -> Option<Verdict> {
        if self.timer.as_ref().map(|timer| timer.attempt) != Some(attempt) {
            return None;
        }
        let timer = self.timer.take()?;
        let verdict = Verdict::for_failure(budget);
        info!(
            "{} did not connect within {:?}: {:?}",
            timer.connection, self.deadline, verdict
        );
        Some(verdict)
    }

    /// Stop watching without a verdict
    pub fn abandon(&mut self) {
        if let Some(timer) = self.timer.take() {
            debug!("Abandoned attempt {} on {}", timer.attempt, timer.connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> (ConnectivityMonitor, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectivityMonitor::new(Duration::from_millis(15_000), tx), rx)
    }

    async fn next_deadline(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> u64 {
        match rx.recv().await {
            Some(SessionEvent::IceDeadline { attempt }) => attempt,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_before_deadline_recovers() {
        let (mut monitor, mut rx) = monitor();
        let budget = RetryBudget::new(2);
        let pc = ConnectionId(1);
        monitor.arm(pc);

        tokio::time::sleep(Duration::from_millis(5_000)).await;
        assert_eq!(monitor.observe(pc, PeerState::Connecting, &budget), None);
        assert_eq!(monitor.observe(pc, PeerState::Connected, &budget), Some(Verdict::Recovered));
        assert!(!monitor.is_armed());

        tokio::time::sleep(Duration::from_millis(20_000)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_then_late_state_is_single_fire() {
        let (mut monitor, mut rx) = monitor();
        let budget = RetryBudget::new(2);
        let pc = ConnectionId(1);
        monitor.arm(pc);

        let attempt = next_deadline(&mut rx).await;
        assert_eq!(monitor.deadline_elapsed(attempt, &budget), Some(Verdict::DegradedRetry));
        assert_eq!(monitor.observe(pc, PeerState::Connected, &budget), None);
        assert_eq!(monitor.deadline_elapsed(attempt, &budget), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_cancels_previous_deadline() {
        let (mut monitor, mut rx) = monitor();
        let budget = RetryBudget::new(2);
        let first = monitor.arm(ConnectionId(1));
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        let second = monitor.arm(ConnectionId(2));

        let fired = next_deadline(&mut rx).await;
        assert_eq!(fired, second);
        assert_ne!(fired, first);
        assert!(!monitor.is_watching(ConnectionId(1)));
        assert_eq!(monitor.observe(ConnectionId(1), PeerState::Failed, &budget), None);
    }

    #[tokio::test]
    async fn test_failure_verdict_tracks_budget() {
        let (mut monitor, _rx) = monitor();
        let mut budget = RetryBudget::new(1);
        monitor.arm(ConnectionId(1));
        assert_eq!(
            monitor.observe(ConnectionId(1), PeerState::Disconnected, &budget),
            Some(Verdict::DegradedRetry)
        );

        budget.record_failure();
        monitor.arm(ConnectionId(2));
        assert_eq!(
            monitor.observe(ConnectionId(2), PeerState::Failed, &budget),
            Some(Verdict::FailedPermanently)
        );
    }

    #[tokio::test]
    async fn test_abandon_drops_attempt() {
        let (mut monitor, _rx) = monitor();
        let budget = RetryBudget::new(2);
        monitor.arm(ConnectionId(3));
        monitor.abandon();
        assert_eq!(monitor.observe(ConnectionId(3), PeerState::Failed, &budget), None);
    }
}
