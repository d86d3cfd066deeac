//! Session State Machine: the authority for call lifecycle state.
//!
//! [`Session::apply`] is pure: it checks the event against the transition
//! table, mutates the session, and returns the [`Effect`]s the actor must
//! carry out. Anything not in the table is rejected and leaves the session
//! untouched.
//!
//! ```text
//!  Disconnected ─opened─▶ Connecting ─authenticated─▶ Connected ◀──────────────┐
//!                                                      │  ▲                    │
//!                                                 join │  │ leave              │ end / ended /
//!                                                      ▼  │                    │ failure
//!                                                     Queued ─match─▶ Matched ─timer─▶ InCall
//!
//!  any ─transport lost─▶ Disconnected        any ─logout─▶ Ended (terminal)
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;

use duet_signaling::{Role, SignalingMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Queued,
    Matched,
    InCall,
    Ended,
}

impl SessionState {
    /// States in which a peer connection exists.
    pub fn has_call(self) -> bool {
        matches!(self, Self::Matched | Self::InCall)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallInfo {
    pub call_id: String,
    pub partner_id: String,
    pub role: Role,
}

/// Inputs to the transition table.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    TransportOpened,
    TransportLost,
    Authenticated { user_id: Option<String> },
    JoinQueue,
    LeaveQueue,
    Queued { position: u32 },
    MatchFound { call_id: String, partner_id: String, role: Option<Role> },
    EnterCallTimerElapsed,
    EndCall,
    /// `call_ended` or `partner_disconnected`.
    RemoteEnded,
    NegotiationFailed { reason: String },
    MediaFailed { reason: String },
    Logout,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::TransportOpened => "transport_opened",
            Self::TransportLost => "transport_lost",
            Self::Authenticated { .. } => "authenticated",
            Self::JoinQueue => "join_queue",
            Self::LeaveQueue => "leave_queue",
            Self::Queued { .. } => "queued",
            Self::MatchFound { .. } => "match_found",
            Self::EnterCallTimerElapsed => "enter_call_timer",
            Self::EndCall => "end_call",
            Self::RemoteEnded => "remote_ended",
            Self::NegotiationFailed { .. } => "negotiation_failed",
            Self::MediaFailed { .. } => "media_failed",
            Self::Logout => "logout",
        }
    }
}

/// Side effects requested by a transition, executed in order by the actor.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(SignalingMessage),
    /// Send `authenticate` with the cached token.
    Authenticate,
    /// Acquire local media, open the peer connection, arm the call timers.
    BeginCall { role: Role },
    /// The call is live; hand local/remote media to the UI.
    AttachMedia,
    /// Cancel call timers, stop local tracks, close the peer connection.
    TeardownPeer,
    ClearCredentials,
    StopReconnecting,
}

/// An event the current state does not accept.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{event} rejected in state {state:?}")]
pub struct Rejected {
    pub state: SessionState,
    pub event: &'static str,
}

/// One user's call lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    state: SessionState,
    queue_position: u32,
    call: Option<CallInfo>,
    /// Our identifier as reported by the coordinator, if it reports one.
    user_id: Option<String>,
    in_call_since: Option<DateTime<Utc>>,
    /// Set when local media could not be acquired; cleared by an explicit retry.
    failure: Option<String>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            queue_position: 0,
            call: None,
            user_id: None,
            in_call_since: None,
            failure: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Only meaningful while `Queued`.
    pub fn queue_position(&self) -> Option<u32> {
        (self.state == SessionState::Queued).then_some(self.queue_position)
    }

    pub fn call(&self) -> Option<&CallInfo> {
        self.call.as_ref()
    }

    pub fn in_call_since(&self) -> Option<DateTime<Utc>> {
        self.in_call_since
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn apply(&mut self, event: SessionEvent) -> Result<Vec<Effect>, Rejected> {
        use SessionEvent as E;
        use SessionState as S;

        let rejected = Rejected { state: self.state, event: event.name() };

        let effects = match (self.state, event) {
            (S::Ended, _) => return Err(rejected),

            (_, E::Logout) => {
                self.clear_call();
                self.queue_position = 0;
                self.user_id = None;
                self.state = S::Ended;
                vec![Effect::TeardownPeer, Effect::StopReconnecting, Effect::ClearCredentials]
            }

            (_, E::TransportLost) => {
                self.clear_call();
                self.queue_position = 0;
                self.state = S::Disconnected;
                vec![Effect::TeardownPeer]
            }

            (S::Disconnected, E::TransportOpened) => {
                self.state = S::Connecting;
                vec![Effect::Authenticate]
            }

            (S::Connecting, E::Authenticated { user_id }) => {
                self.user_id = user_id;
                self.state = S::Connected;
                vec![]
            }

            (S::Connected, E::JoinQueue) => {
                self.failure = None;
                self.queue_position = 0;
                self.state = S::Queued;
                vec![Effect::Send(SignalingMessage::JoinQueue)]
            }

            (S::Queued, E::Queued { position }) => {
                self.queue_position = position;
                vec![]
            }

            (S::Queued, E::LeaveQueue) => {
                self.queue_position = 0;
                self.state = S::Connected;
                vec![Effect::Send(SignalingMessage::LeaveQueue)]
            }

            (S::Queued, E::MatchFound { call_id, partner_id, role }) => {
                let role = role.unwrap_or_else(|| resolve_role(self.user_id.as_deref(), &partner_id));
                self.call = Some(CallInfo { call_id, partner_id, role });
                self.queue_position = 0;
                self.state = S::Matched;
                vec![Effect::BeginCall { role }]
            }

            (S::Matched, E::EnterCallTimerElapsed) => {
                self.in_call_since = Some(Utc::now());
                self.state = S::InCall;
                vec![Effect::AttachMedia]
            }

            (S::InCall, E::EndCall) => {
                self.clear_call();
                self.state = S::Connected;
                vec![Effect::Send(SignalingMessage::EndCall), Effect::TeardownPeer]
            }

            (S::Matched | S::InCall, E::RemoteEnded) => {
                self.clear_call();
                self.state = S::Connected;
                vec![Effect::TeardownPeer]
            }

            // The coordinator still thinks we are in a call; tell it otherwise
            // so the partner is released too.
            (S::Matched | S::InCall, E::NegotiationFailed { .. }) => {
                self.clear_call();
                self.state = S::Connected;
                vec![Effect::TeardownPeer, Effect::Send(SignalingMessage::EndCall)]
            }

            (S::Matched, E::MediaFailed { reason }) => {
                self.clear_call();
                self.failure = Some(reason);
                self.state = S::Connected;
                vec![Effect::TeardownPeer, Effect::Send(SignalingMessage::EndCall)]
            }

            _ => return Err(rejected),
        };
        Ok(effects)
    }

    fn clear_call(&mut self) {
        self.call = None;
        self.in_call_since = None;
    }
}

/// Decide who offers when the coordinator did not say.
///
/// Both sides evaluate the same rule: the lexicographically smaller
/// identifier calls. Without our own identifier we assume the caller role.
pub fn resolve_role(own_id: Option<&str>, partner_id: &str) -> Role {
    match own_id {
        Some(own) if own > partner_id => Role::Callee,
        _ => Role::Caller,
    }
}
