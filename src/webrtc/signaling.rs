//! Call signaling protocol
//!
//! Messages exchanged with the remote peer/server to renegotiate a call's media
//! path. On the wire every message is a JSON object of the form
//! `{"type": "...", "callId": "...", "payload": {...}}`.

use super::peer_connection::IceCandidate;
use super::WebRTCError;
use crate::config::IceServerConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque call identifier, stable for the lifetime of a call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random call id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credentials for joining the managed media relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackCredentials {
    /// TURN URLs of the managed relay
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
    /// Lifetime of the credentials, when the server reports one
    #[serde(default, rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl FallbackCredentials {
    /// Check that the credentials can actually be used to join a relay
    pub fn validate(&self) -> Result<(), String> {
        if self.urls.is_empty() {
            return Err("no relay URLs".to_string());
        }
        if let Some(url) = self
            .urls
            .iter()
            .find(|url| !url.starts_with("turn:") && !url.starts_with("turns:"))
        {
            return Err(format!("not a TURN URL: {}", url));
        }
        if self.username.is_empty() || self.credential.is_empty() {
            return Err("missing username or credential".to_string());
        }
        Ok(())
    }

    /// ICE server entry for the transport layer joining the managed relay
    pub fn to_ice_server(&self) -> IceServerConfig {
        IceServerConfig {
            urls: self.urls.clone(),
            username: Some(self.username.clone()),
            credential: Some(self.credential.clone()),
        }
    }
}

/// Message-specific content
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingBody {
    /// SDP offer for a (re)negotiated connection
    Offer { sdp: String },
    /// SDP answer from the remote side
    Answer { sdp: String },
    /// Trickled ICE candidate
    IceCandidate(IceCandidate),
    /// Ask the server for a managed relay session
    FallbackRequest { attempt: u32 },
    /// Managed relay session granted
    FallbackAccepted(FallbackCredentials),
    /// Managed relay session refused
    FallbackRejected { reason: String },
}

impl SignalingBody {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingBody::Offer { .. } => "offer",
            SignalingBody::Answer { .. } => "answer",
            SignalingBody::IceCandidate(_) => "ice-candidate",
            SignalingBody::FallbackRequest { .. } => "fallback-request",
            SignalingBody::FallbackAccepted(_) => "fallback-accepted",
            SignalingBody::FallbackRejected { .. } => "fallback-rejected",
        }
    }
}

/// A signaling message addressed to one call
#[derive(Debug, Clone, PartialEq)]
pub struct SignalingMessage {
    pub call_id: CallId,
    pub body: SignalingBody,
}

#[derive(Serialize, Deserialize)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "callId")]
    call_id: CallId,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    payload: Value,
}

#[derive(Serialize, Deserialize)]
struct SdpPayload {
    sdp: String,
}

#[derive(Serialize, Deserialize)]
struct FallbackRequestPayload {
    #[serde(default)]
    attempt: u32,
}

#[derive(Serialize, Deserialize)]
struct FallbackRejectedPayload {
    #[serde(default)]
    reason: String,
}

impl SignalingMessage {
    pub fn new(call_id: CallId, body: SignalingBody) -> Self {
        Self { call_id, body }
    }

    /// Create an offer message
    pub fn offer(call_id: CallId, sdp: String) -> Self {
        Self::new(call_id, SignalingBody::Offer { sdp })
    }

    /// Create an answer message
    pub fn answer(call_id: CallId, sdp: String) -> Self {
        Self::new(call_id, SignalingBody::Answer { sdp })
    }

    /// Create an ICE candidate message
    pub fn ice_candidate(call_id: CallId, candidate: IceCandidate) -> Self {
        Self::new(call_id, SignalingBody::IceCandidate(candidate))
    }

    /// Create a managed relay request
    pub fn fallback_request(call_id: CallId, attempt: u32) -> Self {
        Self::new(call_id, SignalingBody::FallbackRequest { attempt })
    }

    pub fn fallback_accepted(call_id: CallId, credentials: FallbackCredentials) -> Self {
        Self::new(call_id, SignalingBody::FallbackAccepted(credentials))
    }

    pub fn fallback_rejected(call_id: CallId, reason: &str) -> Self {
        Self::new(
            call_id,
            SignalingBody::FallbackRejected {
                reason: reason.to_string(),
            },
        )
    }

    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        self.body.kind()
    }

    /// Parse a signaling message from JSON
    pub fn from_json(json: &str) -> Result<Self, WebRTCError> {
        let wire: WireMessage = serde_json::from_str(json)
            .map_err(|e| WebRTCError::SignalingError(format!("Invalid signaling message: {}", e)))?;

        let body = match wire.kind.as_str() {
            "offer" => SignalingBody::Offer {
                sdp: payload::<SdpPayload>(wire.payload)?.sdp,
            },
            "answer" => SignalingBody::Answer {
                sdp: payload::<SdpPayload>(wire.payload)?.sdp,
            },
            "ice-candidate" => SignalingBody::IceCandidate(payload(wire.payload)?),
            "fallback-request" => {
                let request = if wire.payload.is_null() {
                    FallbackRequestPayload { attempt: 0 }
                } else {
                    payload(wire.payload)?
                };
                SignalingBody::FallbackRequest {
                    attempt: request.attempt,
                }
            }
            "fallback-accepted" => SignalingBody::FallbackAccepted(payload(wire.payload)?),
            "fallback-rejected" => {
                let rejected = if wire.payload.is_null() {
                    FallbackRejectedPayload {
                        reason: String::new(),
                    }
                } else {
                    payload(wire.payload)?
                };
                SignalingBody::FallbackRejected {
                    reason: rejected.reason,
                }
            }
            other => {
                return Err(WebRTCError::SignalingError(format!(
                    "Unknown message type: {}",
                    other
                )))
            }
        };

        Ok(Self {
            call_id: wire.call_id,
            body,
        })
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, WebRTCError> {
        let payload = match &self.body {
            SignalingBody::Offer { sdp } | SignalingBody::Answer { sdp } => {
                serde_json::to_value(SdpPayload { sdp: sdp.clone() })
            }
            SignalingBody::IceCandidate(candidate) => serde_json::to_value(candidate),
            SignalingBody::FallbackRequest { attempt } => {
                serde_json::to_value(FallbackRequestPayload { attempt: *attempt })
            }
            SignalingBody::FallbackAccepted(credentials) => serde_json::to_value(credentials),
            SignalingBody::FallbackRejected { reason } => {
                serde_json::to_value(FallbackRejectedPayload {
                    reason: reason.clone(),
                })
            }
        }
        .map_err(|e| WebRTCError::SignalingError(format!("Failed to serialize payload: {}", e)))?;

        let wire = WireMessage {
            kind: self.kind().to_string(),
            call_id: self.call_id.clone(),
            payload,
        };
        serde_json::to_string(&wire)
            .map_err(|e| WebRTCError::SignalingError(format!("Failed to serialize message: {}", e)))
    }
}

fn payload<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, WebRTCError> {
    serde_json::from_value(value)
        .map_err(|e| WebRTCError::SignalingError(format!("Invalid payload: {}", e)))
}

/// Outbound half of the signaling channel.
///
/// Inbound messages are handed to the call session by whoever owns the
/// receiving side (see [`crate::resilience::SignalingInbox`]).
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Deliver a message to the remote peer/server
    async fn send(&self, message: SignalingMessage) -> Result<(), WebRTCError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call() -> CallId {
        CallId::new("call-42")
    }

    #[test]
    fn test_parse_answer() {
        let json = r#"{"type": "answer", "callId": "call-42", "payload": {"sdp": "v=0\r\n..."}}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        assert_eq!(msg.call_id, call());
        match msg.body {
            SignalingBody::Answer { sdp } => assert!(sdp.starts_with("v=0")),
            other => panic!("Expected Answer, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_ice_candidate_uses_browser_field_names() {
        let json = r#"{
            "type": "ice-candidate",
            "callId": "call-42",
            "payload": {
                "candidate": "candidate:1 1 udp 16777215 203.0.113.7 49152 typ relay",
                "sdpMid": "0",
                "sdpMLineIndex": 0
            }
        }"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg.body {
            SignalingBody::IceCandidate(candidate) => {
                assert!(candidate.candidate.contains("typ relay"));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("Expected IceCandidate, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_fallback_accepted() {
        let json = r#"{
            "type": "fallback-accepted",
            "callId": "call-42",
            "payload": {
                "urls": ["turns:relay.example.net:443?transport=tcp"],
                "username": "1700000000:call-42",
                "credential": "c2VjcmV0",
                "ttl": 600
            }
        }"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        match msg.body {
            SignalingBody::FallbackAccepted(credentials) => {
                assert_eq!(credentials.ttl_secs, Some(600));
                assert!(credentials.validate().is_ok());
            }
            other => panic!("Expected FallbackAccepted, got {:?}", other),
        }
    }

    #[test]
    fn test_fallback_rejected_without_payload() {
        let json = r#"{"type": "fallback-rejected", "callId": "call-42"}"#;
        let msg = SignalingMessage::from_json(json).unwrap();
        assert_eq!(
            msg.body,
            SignalingBody::FallbackRejected {
                reason: String::new()
            }
        );
    }

    #[test]
    fn test_fallback_request_serialization() {
        let json = SignalingMessage::fallback_request(call(), 3).to_json().unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "fallback-request");
        assert_eq!(value["callId"], "call-42");
        assert_eq!(value["payload"]["attempt"], 3);
    }

    #[test]
    fn test_offer_serialization() {
        let json = SignalingMessage::offer(call(), "v=0...".to_string())
            .to_json()
            .unwrap();
        assert!(json.contains("\"type\":\"offer\""));
        assert!(json.contains("v=0..."));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let json = r#"{"type": "keyframe", "callId": "call-42"}"#;
        assert!(SignalingMessage::from_json(json).is_err());
    }

    #[test]
    fn test_missing_call_id_is_rejected() {
        let json = r#"{"type": "answer", "payload": {"sdp": "v=0"}}"#;
        assert!(SignalingMessage::from_json(json).is_err());
    }

    #[test]
    fn test_credentials_validation() {
        let mut credentials = FallbackCredentials {
            urls: vec!["turn:relay.example.net:3478".to_string()],
            username: "user".to_string(),
            credential: "pass".to_string(),
            ttl_secs: None,
        };
        assert!(credentials.validate().is_ok());

        credentials.urls.push("stun:stun.example.net".to_string());
        assert!(credentials.validate().is_err());

        credentials.urls.clear();
        assert!(credentials.validate().is_err());

        credentials.urls.push("turn:relay.example.net:3478".to_string());
        credentials.credential.clear();
        assert!(credentials.validate().is_err());
    }

    #[test]
    fn test_generated_call_ids_are_unique_and_survive_the_wire() {
        let first = CallId::generate();
        let second = CallId::generate();
        assert_ne!(first, second);
        assert!(uuid::Uuid::parse_str(first.as_str()).is_ok());

        let json = SignalingMessage::answer(first.clone(), "v=0".into())
            .to_json()
            .unwrap();
        assert!(json.contains(first.as_str()));
        assert_eq!(SignalingMessage::from_json(&json).unwrap().call_id, first);
    }

    #[test]
    fn test_credentials_to_ice_server() {
        let credentials = FallbackCredentials {
            urls: vec![
                "turn:relay.example.net:3478?transport=udp".to_string(),
                "turns:relay.example.net:5349".to_string(),
            ],
            username: "1700000000:call-42".to_string(),
            credential: "c2VjcmV0".to_string(),
            ttl_secs: Some(600),
        };
        let server = credentials.to_ice_server();
        assert_eq!(server.urls, credentials.urls);
        assert_eq!(server.username.as_deref(), Some("1700000000:call-42"));
        assert_eq!(server.credential.as_deref(), Some("c2VjcmV0"));
    }
}
