//! The session actor's single input queue.
//!
//! Every producer (transport supervisor, user handle, timers, peer engine)
//! pushes an [`Input`] into one unbounded queue; the actor drains it one item
//! at a time. Timer and engine inputs carry the peer epoch they were issued
//! against so the actor can discard anything that outlived its call.

use serde::Serialize;

use crate::media::TrackKind;
use duet_signaling::IceCandidate;

#[derive(Debug)]
pub enum Input {
    /// Something happened on transport `generation`.
    Link { generation: u64, event: LinkInput },
    User(UserAction),
    Timer { kind: TimerKind, epoch: u64 },
    Peer { epoch: u64, event: EngineEvent },
}

#[derive(Debug)]
pub enum LinkInput {
    Opened,
    Frame(String),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    JoinQueue,
    LeaveQueue,
    EndCall,
    ToggleMute,
    ToggleVideo,
    Logout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Caller emits its offer.
    Offer,
    /// Matched → InCall.
    EnterCall,
}

/// Reports from the peer engine.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    ConnectionState(PeerConnectionStatus),
}

/// A track received from the partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteTrack {
    pub mid: String,
    pub kind: TrackKind,
}

/// Transport-level health of the direct media path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}
