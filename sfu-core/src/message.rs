//! Wire-level message schema.
//!
//! Every frame is text JSON of the form `{"event": "<name>", "data": "..."}`
//! where `data` is itself a JSON document encoded as a string. Receivers
//! decode the envelope first and then parse `data` against the schema the
//! event selects.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::Result;

// Supported events
pub const EVENT_OFFER: &str = "offer";
pub const EVENT_ANSWER: &str = "answer";
pub const EVENT_CANDIDATE: &str = "candidate";
pub const EVENT_SERVER_REGISTER: &str = "server_register";
pub const EVENT_CLIENT_JOIN: &str = "client_join";
pub const EVENT_ROOM_JOINED: &str = "room_joined";
pub const EVENT_ROOM_ERROR: &str = "room_error";
pub const EVENT_KEEP_ALIVE: &str = "keep_alive";

/// Envelope for every frame on the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub event: String,
    #[serde(default)]
    pub data: String,
}

impl WireMessage {
    pub fn new(event: &str, data: impl Into<String>) -> Self {
        Self {
            event: event.to_string(),
            data: data.into(),
        }
    }

    /// Decode the nested `data` document against the payload type the
    /// event calls for.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.data)?)
    }

    pub fn offer(description: &RTCSessionDescription) -> Result<Self> {
        Ok(Self::new(EVENT_OFFER, serde_json::to_string(description)?))
    }

    pub fn candidate(candidate: &RTCIceCandidateInit) -> Result<Self> {
        Ok(Self::new(EVENT_CANDIDATE, serde_json::to_string(candidate)?))
    }

    pub fn room_joined(message: impl Into<String>) -> Self {
        Self::new(EVENT_ROOM_JOINED, message)
    }

    pub fn room_error(message: impl Into<String>) -> Self {
        Self::new(EVENT_ROOM_ERROR, message)
    }

    pub fn keep_alive() -> Self {
        Self::new(EVENT_KEEP_ALIVE, "")
    }
}

/// Payload of `server_register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRegistration {
    pub server_id: String,
    pub server_token: String,
    pub room_id: String,
}

/// Payload of `client_join`, the mandatory first frame on a client socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientJoin {
    pub room_id: String,
    pub server_id: String,
    pub server_token: String,
    /// Opaque end-user token; carried but not interpreted by the core.
    #[serde(default)]
    pub user_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_round_trip() {
        let msg = WireMessage::new(EVENT_KEEP_ALIVE, "");
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: WireMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_data_is_a_string_not_an_object() {
        let reg = ServerRegistration {
            server_id: "s1".to_string(),
            server_token: "tok".to_string(),
            room_id: "r1".to_string(),
        };
        let msg = WireMessage::new(
            EVENT_SERVER_REGISTER,
            serde_json::to_string(&reg).unwrap(),
        );
        let encoded = serde_json::to_string(&msg).unwrap();

        // The outer `data` field must be a JSON string, not a nested object.
        let raw: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert!(raw["data"].is_string());

        let decoded: WireMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.payload::<ServerRegistration>().unwrap(), reg);
    }

    #[test]
    fn test_client_join_round_trip() {
        let join = ClientJoin {
            room_id: "r1".to_string(),
            server_id: "s1".to_string(),
            server_token: "tok".to_string(),
            user_token: "user".to_string(),
        };
        let msg = WireMessage::new(EVENT_CLIENT_JOIN, serde_json::to_string(&join).unwrap());
        let decoded: WireMessage =
            serde_json::from_str(&serde_json::to_string(&msg).unwrap()).unwrap();
        assert_eq!(decoded.payload::<ClientJoin>().unwrap(), join);
    }

    #[test]
    fn test_client_join_user_token_optional() {
        let join: ClientJoin = serde_json::from_str(
            r#"{"room_id":"r","server_id":"s","server_token":"t"}"#,
        )
        .unwrap();
        assert_eq!(join.user_token, "");
    }

    #[test]
    fn test_candidate_round_trip() {
        let init = RTCIceCandidateInit {
            candidate: "candidate:1 1 UDP 2122252543 10.0.0.1 50000 typ host".to_string(),
            ..Default::default()
        };
        let msg = WireMessage::candidate(&init).unwrap();
        assert_eq!(msg.event, EVENT_CANDIDATE);
        let decoded: RTCIceCandidateInit = msg.payload().unwrap();
        assert_eq!(decoded.candidate, init.candidate);
    }

    #[test]
    fn test_room_error_carries_plain_text() {
        let msg = WireMessage::room_error("join rejected");
        assert_eq!(msg.event, EVENT_ROOM_ERROR);
        assert_eq!(msg.data, "join rejected");
    }

    #[test]
    fn test_missing_data_field_defaults_empty() {
        let decoded: WireMessage = serde_json::from_str(r#"{"event":"keep_alive"}"#).unwrap();
        assert_eq!(decoded.event, EVENT_KEEP_ALIVE);
        assert_eq!(decoded.data, "");
    }
}
