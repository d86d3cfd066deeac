//! What the UI sees: a status snapshot and a stream of notices.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::events::{PeerConnectionStatus, RemoteTrack};
use crate::media::TrackKind;
use crate::peer::NegotiationState;
use crate::session::{CallInfo, SessionState};

/// Snapshot published after every processed input.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub queue_position: Option<u32>,
    pub call: Option<CallInfo>,
    pub in_call_since: Option<DateTime<Utc>>,
    /// Why the last call attempt could not start. Cleared by joining the queue again.
    pub failure: Option<String>,
    pub transport_open: bool,
    pub negotiation: Option<NegotiationState>,
    pub peer: Option<PeerConnectionStatus>,
    pub muted: bool,
    pub video_off: bool,
    pub remote_tracks: Vec<RemoteTrack>,
}

impl Default for SessionStatus {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            queue_position: None,
            call: None,
            in_call_since: None,
            failure: None,
            transport_open: false,
            negotiation: None,
            peer: None,
            muted: false,
            video_off: false,
            remote_tracks: Vec::new(),
        }
    }
}

impl SessionStatus {
    pub fn call_duration(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.in_call_since.map(|since| (now - since).max(Duration::zero()))
    }
}

/// Render a call duration as `MM:SS`. Minutes keep counting past 59.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.num_seconds().max(0);
    format!("{:02}:{:02}", secs / 60, secs % 60)
}

/// Things worth telling the user about, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum SessionNotice {
    StateChanged { from: SessionState, to: SessionState },
    /// Free-text `message` carried by a coordinator push.
    Coordinator { tag: &'static str, message: String },
    /// The coordinator sent an `error` message.
    CoordinatorError { message: String },
    /// Transport lost; a new attempt is scheduled.
    Reconnecting,
    MediaToggled { kind: TrackKind, enabled: bool },
    CallFailed { reason: String },
}
