//! WebRTC PeerConnection management
//!
//! Defines the peer-connection handle the resilience core drives, and its
//! webrtc-rs implementation.

use super::WebRTCError;
use crate::config::{IceConfig, IceServerConfig};
use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::fmt;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::ice::mdns::MulticastDnsMode;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

/// Username suffix for TURN REST credentials
const TURN_REST_USER: &str = "call-resilience";

/// A caller-owned local media track; connections only hold shared references
pub type LocalTrack = Arc<dyn TrackLocal + Send + Sync>;

/// Callback receiving connection events
pub type PeerEventHandler = Arc<dyn Fn(PeerEvent) + Send + Sync>;

/// Identifies one peer connection within a call.
///
/// Ids are never reused, so an event tagged with an old id can always be told
/// apart from events of the connection that replaced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pc#{}", self.0)
    }
}

/// Candidate gathering policy for a new connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportPolicy {
    /// Host, server-reflexive and relay candidates
    #[default]
    All,
    /// Relay candidates only; traffic always goes through TURN
    RelayOnly,
}

/// Connectivity state of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_connected(&self) -> bool {
        matches!(self, PeerState::Connected)
    }

    /// Media can no longer flow over this connection
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => PeerState::New,
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
        }
    }
}

/// Event emitted by a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    StateChanged(PeerState),
    CandidateGathered(IceCandidate),
}

/// Handle to one peer connection.
///
/// At most one handler is subscribed at a time; `unsubscribe` guarantees the
/// handler is not invoked for events raised afterwards.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Candidate policy the connection was created with
    fn policy(&self) -> TransportPolicy;

    /// Current connectivity state
    fn state(&self) -> PeerState;

    /// Route state changes and gathered candidates to `handler`
    fn subscribe(&self, handler: PeerEventHandler);

    /// Drop the current handler
    fn unsubscribe(&self);

    /// Send an existing local track over this connection
    async fn attach_track(&self, track: LocalTrack) -> Result<(), WebRTCError>;

    /// Create an SDP offer and install it as the local description
    async fn create_offer(&self) -> Result<String, WebRTCError>;

    /// Apply the remote SDP answer
    async fn apply_answer(&self, sdp: &str) -> Result<(), WebRTCError>;

    /// Add a candidate trickled by the remote side
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError>;

    /// Close the connection and release its transports
    async fn close(&self) -> Result<(), WebRTCError>;
}

/// Creates peer connections on demand
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, policy: TransportPolicy) -> Result<Arc<dyn PeerConnection>, WebRTCError>;
}

/// webrtc-rs backed peer connection
pub struct RtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    policy: TransportPolicy,
    handler: Arc<Mutex<Option<PeerEventHandler>>>,
}

impl RtcPeerConnection {
    /// Wrap an `RTCPeerConnection`, installing the event forwarding callbacks
    pub fn new(inner: Arc<RTCPeerConnection>, policy: TransportPolicy) -> Self {
        let handler: Arc<Mutex<Option<PeerEventHandler>>> = Arc::new(Mutex::new(None));

        let state_slot = handler.clone();
        inner.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let current = state_slot.lock().clone();
            Box::pin(async move {
                if let Some(handler) = current {
                    handler(PeerEvent::StateChanged(PeerState::from(state)));
                }
            })
        }));

        let candidate_slot = handler.clone();
        inner.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let current = candidate_slot.lock().clone();
            Box::pin(async move {
                let (Some(handler), Some(candidate)) = (current, candidate) else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => handler(PeerEvent::CandidateGathered(IceCandidate::from(init))),
                    Err(e) => debug!("Dropping unserializable ICE candidate: {}", e),
                }
            })
        }));

        Self {
            inner,
            policy,
            handler,
        }
    }

    /// Underlying webrtc-rs connection
    pub fn inner(&self) -> &Arc<RTCPeerConnection> {
        &self.inner
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    fn policy(&self) -> TransportPolicy {
        self.policy
    }

    fn state(&self) -> PeerState {
        PeerState::from(self.inner.connection_state())
    }

    fn subscribe(&self, handler: PeerEventHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn unsubscribe(&self) {
        self.handler.lock().take();
    }

    async fn attach_track(&self, track: LocalTrack) -> Result<(), WebRTCError> {
        self.inner
            .add_track(track)
            .await
            .map_err(|e| WebRTCError::MediaError(format!("Failed to add track: {}", e)))?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, WebRTCError> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to create offer: {}", e)))?;

        self.inner
            .set_local_description(offer.clone())
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set local description: {}", e)))?;

        Ok(offer.sdp)
    }

    async fn apply_answer(&self, sdp: &str) -> Result<(), WebRTCError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| WebRTCError::SdpError(format!("Invalid SDP answer: {}", e)))?;

        self.inner
            .set_remote_description(answer)
            .await
            .map_err(|e| WebRTCError::SdpError(format!("Failed to set remote description: {}", e)))?;

        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), WebRTCError> {
        let candidate_init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };

        self.inner
            .add_ice_candidate(candidate_init)
            .await
            .map_err(|e| WebRTCError::IceError(format!("Failed to add ICE candidate: {}", e)))?;

        Ok(())
    }

    async fn close(&self) -> Result<(), WebRTCError> {
        self.unsubscribe();
        self.inner
            .close()
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to close connection: {}", e)))?;
        Ok(())
    }
}

/// Builds webrtc-rs peer connections from the ICE configuration
pub struct PeerConnectionManager {
    config: IceConfig,
}

impl PeerConnectionManager {
    /// Create a new PeerConnection manager
    pub fn new(config: IceConfig) -> Self {
        Self { config }
    }

    /// ICE servers handed to every new connection
    pub fn ice_servers(&self) -> Vec<IceServerConfig> {
        build_ice_servers(&self.config)
    }

    /// Create a new PeerConnection with the configured settings
    pub async fn create_peer_connection(
        &self,
        policy: TransportPolicy,
    ) -> Result<RtcPeerConnection, WebRTCError> {
        let effective_ice_servers = self.ice_servers();

        if policy == TransportPolicy::RelayOnly && !has_turn_server(&effective_ice_servers) {
            return Err(WebRTCError::ConnectionFailed(
                "Relay-only transport requires a TURN server".to_string(),
            ));
        }

        let mut setting_engine = SettingEngine::default();
        if policy == TransportPolicy::RelayOnly {
            // Host candidates are never used on a relay-only path
            setting_engine.set_ice_multicast_dns_mode(MulticastDnsMode::Disabled);
        }

        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register codecs: {}", e)))?;

        // Create interceptor registry for RTCP feedback
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        let ice_servers = effective_ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let ice_transport_policy = match policy {
            TransportPolicy::All => RTCIceTransportPolicy::All,
            TransportPolicy::RelayOnly => RTCIceTransportPolicy::Relay,
        };

        let rtc_config = RTCConfiguration {
            ice_servers,
            ice_transport_policy,
            ..Default::default()
        };

        let peer_connection = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| WebRTCError::ConnectionFailed(format!("Failed to create peer connection: {}", e)))?;

        debug!("Created peer connection with {:?} transport policy", policy);
        Ok(RtcPeerConnection::new(Arc::new(peer_connection), policy))
    }
}

#[async_trait]
impl PeerConnectionFactory for PeerConnectionManager {
    async fn create(&self, policy: TransportPolicy) -> Result<Arc<dyn PeerConnection>, WebRTCError> {
        let connection = self.create_peer_connection(policy).await?;
        Ok(Arc::new(connection))
    }
}

fn has_turn_server(servers: &[IceServerConfig]) -> bool {
    servers
        .iter()
        .flat_map(|server| server.urls.iter())
        .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
}

fn build_ice_servers(config: &IceConfig) -> Vec<IceServerConfig> {
    let mut servers = Vec::new();

    let has_stun = !config.stun_host.is_empty() && config.stun_port != 0;

    if has_stun {
        servers.push(IceServerConfig {
            urls: vec![format!("stun:{}:{}", config.stun_host, config.stun_port)],
            username: None,
            credential: None,
        });
    }

    if !config.turn_host.is_empty() {
        let scheme = if config.turn_tls { "turns" } else { "turn" };
        let transport = if config.turn_protocol.is_empty() {
            "udp"
        } else {
            config.turn_protocol.as_str()
        };
        let url = format!(
            "{}:{}:{}?transport={}",
            scheme, config.turn_host, config.turn_port, transport
        );

        let (username, credential) = if !config.turn_shared_secret.is_empty() {
            let expiry = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs() + config.turn_credential_ttl_secs)
                .unwrap_or(config.turn_credential_ttl_secs);
            let user = format!("{}:{}", expiry, TURN_REST_USER);
            match hmac_sha1_base64(&config.turn_shared_secret, &user) {
                Some(password) => (Some(user), Some(password)),
                None => {
                    warn!("Could not derive TURN credentials from shared secret");
                    (None, None)
                }
            }
        } else if !config.turn_username.is_empty() && !config.turn_password.is_empty() {
            (
                Some(config.turn_username.clone()),
                Some(config.turn_password.clone()),
            )
        } else {
            (None, None)
        };

        servers.push(IceServerConfig {
            urls: vec![url],
            username,
            credential,
        });
    }

    if servers.is_empty() {
        return config.ice_servers.clone();
    }

    servers
}

fn hmac_sha1_base64(secret: &str, message: &str) -> Option<String> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(message.as_bytes());
    let result = mac.finalize().into_bytes();
    Some(base64::engine::general_purpose::STANDARD.encode(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn_config() -> IceConfig {
        IceConfig {
            turn_host: "turn.example.org".to_string(),
            turn_username: "alice".to_string(),
            turn_password: "wonderland".to_string(),
            ..IceConfig::default()
        }
    }

    #[test]
    fn test_peer_state_from_rtc_state() {
        assert_eq!(PeerState::from(RTCPeerConnectionState::New), PeerState::New);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Connected), PeerState::Connected);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Failed), PeerState::Failed);
        assert_eq!(PeerState::from(RTCPeerConnectionState::Unspecified), PeerState::New);
    }

    #[test]
    fn test_lost_states() {
        assert!(PeerState::Failed.is_lost());
        assert!(PeerState::Disconnected.is_lost());
        assert!(PeerState::Closed.is_lost());
        assert!(!PeerState::Connecting.is_lost());
        assert!(!PeerState::Connected.is_lost());
    }

    #[test]
    fn test_static_turn_credentials() {
        let servers = build_ice_servers(&turn_config());
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478?transport=udp"]);
        assert_eq!(servers[0].username.as_deref(), Some("alice"));
        assert_eq!(servers[0].credential.as_deref(), Some("wonderland"));
    }

    #[test]
    fn test_shared_secret_credentials_are_time_limited() {
        let config = IceConfig {
            turn_host: "turn.example.org".to_string(),
            turn_tls: true,
            turn_protocol: "tcp".to_string(),
            turn_shared_secret: "s3cret".to_string(),
            ..IceConfig::default()
        };
        let servers = build_ice_servers(&config);
        let turn = &servers[0];
        assert_eq!(turn.urls, vec!["turns:turn.example.org:3478?transport=tcp"]);

        let username = turn.username.clone().unwrap();
        let (expiry, user) = username.split_once(':').unwrap();
        assert!(expiry.parse::<u64>().unwrap() > 0);
        assert_eq!(user, TURN_REST_USER);
        assert_eq!(
            turn.credential.as_deref(),
            hmac_sha1_base64("s3cret", &username).as_deref()
        );
    }

    #[test]
    fn test_stun_and_turn_together() {
        let mut config = turn_config();
        config.stun_host = "stun.example.org".to_string();
        let servers = build_ice_servers(&config);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].urls, vec!["stun:stun.example.org:3478"]);
        assert!(has_turn_server(&servers));
    }

    #[test]
    fn test_explicit_servers_used_when_nothing_configured() {
        let config = IceConfig {
            ice_servers: vec![IceServerConfig {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: None,
                credential: None,
            }],
            ..IceConfig::default()
        };
        let servers = build_ice_servers(&config);
        assert_eq!(servers, config.ice_servers);
        assert!(!has_turn_server(&servers));
    }

    #[tokio::test]
    async fn test_relay_only_requires_turn() {
        let manager = PeerConnectionManager::new(IceConfig::default());
        let result = manager.create_peer_connection(TransportPolicy::RelayOnly).await;
        assert!(matches!(result, Err(WebRTCError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn test_create_and_close_relay_only_connection() {
        let manager = PeerConnectionManager::new(turn_config());
        let connection = manager.create(TransportPolicy::RelayOnly).await.unwrap();
        assert_eq!(connection.policy(), TransportPolicy::RelayOnly);
        assert_eq!(connection.state(), PeerState::New);

        connection.subscribe(Arc::new(|_event| {}));
        connection.unsubscribe();
        connection.close().await.unwrap();
    }
}
