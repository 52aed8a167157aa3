//! Relay-only reconnection
//!
//! Sole owner of the call's active peer connection. A replacement is only
//! created after the previous connection has been closed.

use super::{ResilienceError, SessionEvent};
use crate::webrtc::{
    CallId, ConnectionId, IceCandidate, LocalTrack, PeerConnection, PeerConnectionFactory,
    PeerEventHandler, SignalingChannel, SignalingMessage, TransportPolicy,
};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;

struct ActiveConnection {
    id: ConnectionId,
    handle: Arc<dyn PeerConnection>,
    /// Created and negotiated here, as opposed to adopted from the caller
    negotiated: bool,
}

pub struct RelayReconnector {
    call_id: CallId,
    factory: Arc<dyn PeerConnectionFactory>,
    local_tracks: Vec<LocalTrack>,
    intake: mpsc::UnboundedSender<SessionEvent>,
    active: Option<ActiveConnection>,
    next_id: u64,
}

impl RelayReconnector {
    pub(crate) fn new(
        call_id: CallId,
        factory: Arc<dyn PeerConnectionFactory>,
        local_tracks: Vec<LocalTrack>,
        intake: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            call_id,
            factory,
            local_tracks,
            intake,
            active: None,
            next_id: 0,
        }
    }

    /// Take ownership of the call's initial connection
    pub fn adopt(&mut self, handle: Arc<dyn PeerConnection>) -> ConnectionId {
        let id = self.allocate_id();
        self.subscribe(id, handle.as_ref());
        self.active = Some(ActiveConnection {
            id,
            handle,
            negotiated: false,
        });
        debug!("Call {}: adopted initial connection {}", self.call_id, id);
        id
    }

    pub fn active_id(&self) -> Option<ConnectionId> {
        self.active.as_ref().map(|active| active.id)
    }

    /// Whether events tagged `id` come from the connection currently in use
    pub fn is_current(&self, id: ConnectionId) -> bool {
        self.active_id() == Some(id)
    }

    /// Whether the active connection is one negotiated here
    pub fn has_relay_connection(&self) -> bool {
        self.active.as_ref().is_some_and(|active| active.negotiated)
    }

    /// Replace the active connection with a relay-only one.
    ///
    /// On error the half-built connection is already closed.
    pub async fn reconnect(&mut self, signaling: &dyn SignalingChannel) -> Result<ConnectionId, ResilienceError> {
        self.release().await;

        let handle = self.factory.create(TransportPolicy::RelayOnly).await?;
        let id = self.allocate_id();
        self.subscribe(id, handle.as_ref());
        self.active = Some(ActiveConnection {
            id,
            handle: handle.clone(),
            negotiated: true,
        });
        info!("Call {}: opened relay-only connection {}", self.call_id, id);

        if let Err(e) = self.negotiate(handle.as_ref(), signaling).await {
            warn!("Call {}: relay setup on {} failed: {}", self.call_id, id, e);
            self.release().await;
            return Err(e);
        }
        Ok(id)
    }

    async fn negotiate(
        &self,
        handle: &dyn PeerConnection,
        signaling: &dyn SignalingChannel,
    ) -> Result<(), ResilienceError> {
        for track in &self.local_tracks {
            handle.attach_track(track.clone()).await?;
        }
        let sdp = handle.create_offer().await?;
        signaling
            .send(SignalingMessage::offer(self.call_id.clone(), sdp))
            .await?;
        Ok(())
    }

    /// Apply the remote answer to the relay connection
    pub async fn apply_answer(&self, sdp: &str) -> Result<(), ResilienceError> {
        let active = self.relay_connection()?;
        active.handle.apply_answer(sdp).await?;
        debug!("Call {}: applied answer on {}", self.call_id, active.id);
        Ok(())
    }

    /// Add a remote candidate to the relay connection
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), ResilienceError> {
        let active = self.relay_connection()?;
        active.handle.add_remote_candidate(candidate).await?;
        Ok(())
    }

    /// Send a locally gathered candidate of the relay connection to the peer
    pub async fn forward_candidate(
        &self,
        id: ConnectionId,
        candidate: IceCandidate,
        signaling: &dyn SignalingChannel,
    ) {
        if !self.is_current(id) || !self.has_relay_connection() {
            debug!("Call {}: not forwarding candidate from {}", self.call_id, id);
            return;
        }
        if let Err(e) = signaling
            .send(SignalingMessage::ice_candidate(self.call_id.clone(), candidate))
            .await
        {
            warn!("Call {}: failed to forward candidate: {}", self.call_id, e);
        }
    }

    /// Unsubscribe from and close the active connection, if any.
    ///
    /// The connection leaves the slot only once `close` has returned, so a
    /// release interrupted mid-close is completed by the next one.
    pub async fn release(&mut self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let (id, handle) = (active.id, active.handle.clone());
        handle.unsubscribe();
        let closed = handle.close().await;
        self.active = None;
        match closed {
            Ok(()) => info!("Call {}: closed connection {}", self.call_id, id),
            Err(e) => warn!("Call {}: error closing {}: {}", self.call_id, id, e),
        }
    }

    fn relay_connection(&self) -> Result<&ActiveConnection, ResilienceError> {
        self.active
            .as_ref()
            .filter(|active| active.negotiated)
            .ok_or(ResilienceError::NoActiveConnection)
    }

    fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }

    fn subscribe(&self, id: ConnectionId, handle: &dyn PeerConnection) {
        let intake = self.intake.clone();
        let handler: PeerEventHandler = Arc::new(move |event| {
            let _ = intake.send(SessionEvent::Peer {
                connection: id,
                event,
            });
        });
        handle.subscribe(handler);
    }
}
