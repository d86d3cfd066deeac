//! Call-layer errors.

use str0m::RtcError;

use crate::peer::NegotiationState;

/// Anything that aborts the current offer/answer exchange.
///
/// A partial handshake cannot be resumed, so every variant ends the call.
#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebRTC error: {0}")]
    Rtc(#[from] RtcError),

    #[error("SDP error: {0}")]
    Sdp(String),

    #[error("ICE candidate rejected: {0}")]
    Candidate(String),

    #[error("{action} is not valid while negotiation is {state:?}")]
    UnexpectedState {
        action: &'static str,
        state: NegotiationState,
    },

    #[error("Peer connection already closed")]
    Closed,
}

/// Local capture failures. Never retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("Capture permission denied")]
    Denied,

    #[error("Capture device is already in use")]
    Busy,

    #[error("No audio or video requested")]
    NothingRequested,
}
