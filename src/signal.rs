use serde::{Deserialize, Serialize};
use webrtc::{
    ice_transport::ice_candidate::RTCIceCandidateInit,
    peer_connection::sdp::session_description::RTCSessionDescription,
};

/// Messages accepted from a client. On the wire: `{"type": ..., "payload": ...}`.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Join(JoinPayload),
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    // Seems like client-side (JS) RTCIceCandidate struct is equal RTCIceCandidateInit.
    Candidate(RTCIceCandidateInit),
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct JoinPayload {
    pub room_id: String,
}

/// Messages sent to a client, using the same envelope as [`ClientMessage`].
#[derive(Serialize, Debug)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    Offer(RTCSessionDescription),
    Answer(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
    UserLeft {
        user_id: String,
        stream_ids: Vec<String>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Offer(_) => "offer",
            ClientMessage::Answer(_) => "answer",
            ClientMessage::Candidate(_) => "candidate",
        }
    }
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Offer(_) => "offer",
            ServerMessage::Answer(_) => "answer",
            ServerMessage::Candidate(_) => "candidate",
            ServerMessage::UserLeft { .. } => "user_left",
        }
    }
}
