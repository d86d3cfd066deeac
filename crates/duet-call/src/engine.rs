//! Seam between the Peer Connection Manager and a WebRTC implementation.
//!
//! The manager owns negotiation rules (who may offer, candidate buffering,
//! teardown). An engine only performs the individual steps and reports what
//! it observes through [`EngineEvents`].

use async_trait::async_trait;
use tokio::sync::mpsc;

use duet_signaling::{IceCandidate, SessionDescription};

use crate::error::NegotiationError;
use crate::events::{EngineEvent, Input};
use crate::media::TrackKind;

/// Epoch-tagged sender into the session actor's queue.
#[derive(Debug, Clone)]
pub struct EngineEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<Input>,
}

impl EngineEvents {
    pub(crate) fn new(epoch: u64, tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Returns `false` once the session actor is gone.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx.send(Input::Peer { epoch: self.epoch, event }).is_ok()
    }
}

/// Creates peer connections.
#[async_trait]
pub trait PeerEngine: Send + Sync {
    /// Open a connection that will send the given local track kinds.
    ///
    /// Local ICE candidates are reported through `events` as they are gathered.
    async fn open(
        &self,
        tracks: &[TrackKind],
        events: EngineEvents,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError>;
}

/// One negotiated (or negotiating) connection.
#[async_trait]
pub trait PeerConnection: Send {
    /// Create and apply a local offer.
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError>;

    /// Apply a remote offer and return the local answer.
    async fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    /// Apply the remote answer to our outstanding offer.
    async fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), NegotiationError>;

    /// Abandon our outstanding offer so the partner's can be accepted.
    async fn rollback(&mut self) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&mut self);
}
