//! # duet-call
//!
//! Call session coordination for one anonymous user:
//!
//! ```text
//!   coordinator ──ws──▶ ReconnectSupervisor ──┐
//!   user (SessionHandle) ─────────────────────┼──▶ input queue ──▶ SessionActor
//!   timers / peer engine (epoch-tagged) ──────┘                     │  Session (pure transitions)
//!                                                                   │  PeerConnectionManager
//!                                                                   ▼
//!                                              SignalingChannel ──▶ coordinator
//! ```
//!
//! Start a session with [`CallClient::start`]; drive it through the
//! returned [`SessionHandle`].

pub mod actor;
pub mod engine;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod session;
pub mod status;
pub mod str0m_engine;
pub mod supervisor;
pub mod timers;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use duet_common::Credentials;
use duet_common::config::AppConfig;
use duet_signaling::{Dialer, SignalingChannel};

pub use actor::{SessionActor, SessionHandle};
pub use engine::{PeerConnection, PeerEngine};
pub use error::{MediaError, NegotiationError};
pub use media::{CaptureDevice, MediaConstraints, MediaSource, TrackKind};
pub use session::{CallInfo, SessionState};
pub use status::{SessionNotice, SessionStatus, format_duration};
pub use str0m_engine::Str0mEngine;
pub use supervisor::ReconnectSupervisor;

/// Timing and media settings for one session.
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// Matched → caller emits its offer.
    pub offer_delay: Duration,
    /// Matched → InCall.
    pub in_call_delay: Duration,
    /// Transport lost → next dial.
    pub reconnect_delay: Duration,
    pub media: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            offer_delay: Duration::from_secs(1),
            in_call_delay: Duration::from_secs(2),
            reconnect_delay: Duration::from_secs(3),
            media: MediaConstraints::default(),
        }
    }
}

impl From<&AppConfig> for CallConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            offer_delay: cfg.call.offer_delay(),
            in_call_delay: cfg.call.in_call_delay(),
            reconnect_delay: cfg.signaling.reconnect_delay(),
            media: MediaConstraints { audio: cfg.media.audio, video: cfg.media.video },
        }
    }
}

/// External collaborators, injected.
pub struct CallDeps {
    pub dialer: Arc<dyn Dialer>,
    pub credentials: Credentials,
    pub engine: Arc<dyn PeerEngine>,
    pub media: Arc<dyn MediaSource>,
}

/// A running session: the actor plus its reconnection supervisor.
pub struct CallClient {
    handle: SessionHandle,
    actor: JoinHandle<()>,
    supervisor: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl CallClient {
    /// Spawn the session. Must be called inside a Tokio runtime.
    pub fn start(config: CallConfig, deps: CallDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = SignalingChannel::new();
        let shutdown = CancellationToken::new();

        let supervisor = ReconnectSupervisor::new(
            deps.dialer,
            deps.credentials.clone(),
            channel.clone(),
            tx.clone(),
            config.reconnect_delay,
            shutdown.clone(),
        );
        let actor = SessionActor::new(
            rx,
            tx,
            channel,
            deps.credentials,
            deps.engine,
            deps.media,
            config,
            shutdown.clone(),
        );
        let handle = actor.handle();

        Self {
            handle,
            actor: tokio::spawn(actor.run()),
            supervisor: supervisor.spawn(),
            shutdown,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stop without logging out: the call (if any) is torn down and the
    /// cached token is kept.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.join().await;
    }

    /// Wait for the session to end on its own (logout).
    pub async fn join(self) {
        if let Err(e) = self.actor.await {
            warn!(error = %e, "Session actor panicked");
        }
        if let Err(e) = self.supervisor.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Reconnection supervisor panicked");
            }
        }
    }
}
