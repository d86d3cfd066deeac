//! Wire protocol: one JSON object per frame, discriminated by `type`.
//!
//! Decoding is two-staged so that an unrecognized `type` is reported
//! separately from a recognized one with a bad payload. The first is
//! forward-compatible noise; the second is a coordinator bug worth a warning.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages exchanged with the coordinating service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    // === Client → Server ===
    /// First frame on every fresh transport.
    Authenticate { token: String },

    /// Enter the matchmaking queue.
    JoinQueue,

    /// Leave the matchmaking queue.
    LeaveQueue,

    /// Hang up the current call.
    EndCall,

    // === Server → Client ===
    /// The token was accepted.
    Authenticated {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Our own identifier as the coordinator knows it, when provided.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    /// Queue position update. May be resent any number of times.
    Queued {
        position: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// A partner was found.
    MatchFound {
        call_id: String,
        partner_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Who sends the offer. Older coordinators omit it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },

    /// The coordinator ended the call.
    CallEnded {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// The partner's transport went away.
    PartnerDisconnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    Error {
        #[serde(default)]
        message: String,
    },

    // === Relayed between partners ===
    WebrtcOffer { offer: SessionDescription },

    WebrtcAnswer { answer: SessionDescription },

    WebrtcIce { candidate: IceCandidate },
}

/// Every `type` value [`SignalingMessage`] understands.
pub const KNOWN_TAGS: &[&str] = &[
    "authenticate",
    "authenticated",
    "join_queue",
    "leave_queue",
    "end_call",
    "queued",
    "match_found",
    "call_ended",
    "partner_disconnected",
    "error",
    "webrtc_offer",
    "webrtc_answer",
    "webrtc_ice",
];

impl SignalingMessage {
    /// The wire `type` of this message.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Authenticate { .. } => "authenticate",
            Self::JoinQueue => "join_queue",
            Self::LeaveQueue => "leave_queue",
            Self::EndCall => "end_call",
            Self::Authenticated { .. } => "authenticated",
            Self::Queued { .. } => "queued",
            Self::MatchFound { .. } => "match_found",
            Self::CallEnded { .. } => "call_ended",
            Self::PartnerDisconnected { .. } => "partner_disconnected",
            Self::Error { .. } => "error",
            Self::WebrtcOffer { .. } => "webrtc_offer",
            Self::WebrtcAnswer { .. } => "webrtc_answer",
            Self::WebrtcIce { .. } => "webrtc_ice",
        }
    }

    /// Serialize to a single text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Which side of the call sends the offer. Fixed for the call's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// An SDP offer or answer, shaped like the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

/// One ICE candidate, shaped like the browser's `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// Result of decoding one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(SignalingMessage),
    /// A `type` this client does not know. Dropped.
    Unknown { tag: String },
    /// Not decodable: bad JSON, no `type`, or a known `type` with a bad payload.
    Malformed { tag: Option<String>, reason: String },
}

impl Inbound {
    pub fn decode(frame: &str) -> Self {
        let value: Value = match serde_json::from_str(frame) {
            Ok(v) => v,
            Err(e) => return Self::Malformed { tag: None, reason: e.to_string() },
        };
        let Some(tag) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
            return Self::Malformed { tag: None, reason: "missing \"type\" field".into() };
        };
        if !KNOWN_TAGS.contains(&tag.as_str()) {
            return Self::Unknown { tag };
        }
        match serde_json::from_value::<SignalingMessage>(value) {
            Ok(msg) => Self::Message(msg),
            Err(e) => Self::Malformed { tag: Some(tag), reason: e.to_string() },
        }
    }
}
