//! Peer Connection Manager: owns the direct media path for one call.
//!
//! Negotiation follows a strict single-shot offer/answer:
//!
//! ```text
//!   caller:  Idle ──start_as_caller──▶ OfferSent ──on_answer──▶ Stable
//!   callee:  Idle ──on_offer──▶ OfferReceived ──(answer sent)──▶ Stable
//! ```
//!
//! When both sides offered (a coordinator that assigns no roles makes both of
//! them callers), the offers cross. Each side then holds the same two
//! descriptions, so both pick the same winner: the lower offer is withdrawn
//! and its side answers the other one.
//!
//! Remote ICE candidates that arrive before `Stable` are queued and flushed in
//! receipt order the moment the remote description is applied. Anything else
//! out of order is a [`NegotiationError`]; the session ends the call rather
//! than trying to repair a half-finished handshake.

use std::collections::VecDeque;

use serde::Serialize;
use tracing::{debug, info, warn};

use duet_signaling::{IceCandidate, SdpType, SessionDescription, SignalingMessage};

use crate::engine::{EngineEvents, PeerConnection, PeerEngine};
use crate::error::NegotiationError;
use crate::events::{PeerConnectionStatus, RemoteTrack};
use crate::media::{LocalMedia, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    Stable,
}

pub struct PeerConnectionManager {
    epoch: u64,
    connection: Option<Box<dyn PeerConnection>>,
    negotiation: NegotiationState,
    /// Our offer while it awaits an answer.
    local_offer: Option<SessionDescription>,
    pending_remote_candidates: VecDeque<IceCandidate>,
    local_media: LocalMedia,
    remote_tracks: Vec<RemoteTrack>,
    status: PeerConnectionStatus,
}

impl PeerConnectionManager {
    /// Open a connection for `media`. On failure the media is stopped.
    pub async fn open(
        engine: &dyn PeerEngine,
        mut media: LocalMedia,
        events: EngineEvents,
    ) -> Result<Self, NegotiationError> {
        let epoch = events.epoch();
        let connection = match engine.open(&media.kinds(), events).await {
            Ok(c) => c,
            Err(e) => {
                media.stop();
                return Err(e);
            }
        };
        debug!(epoch, "Peer connection opened");
        Ok(Self {
            epoch,
            connection: Some(connection),
            negotiation: NegotiationState::Idle,
            local_offer: None,
            pending_remote_candidates: VecDeque::new(),
            local_media: media,
            remote_tracks: Vec::new(),
            status: PeerConnectionStatus::Connecting,
        })
    }

    pub fn negotiation_state(&self) -> NegotiationState {
        self.negotiation
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    pub fn local_media(&self) -> &LocalMedia {
        &self.local_media
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn status(&self) -> PeerConnectionStatus {
        self.status
    }

    pub fn is_torn_down(&self) -> bool {
        self.connection.is_none()
    }

    fn expect_state(
        &self,
        action: &'static str,
        state: NegotiationState,
    ) -> Result<(), NegotiationError> {
        if self.connection.is_none() {
            return Err(NegotiationError::Closed);
        }
        if self.negotiation != state {
            return Err(NegotiationError::UnexpectedState { action, state: self.negotiation });
        }
        Ok(())
    }

    fn connection(&mut self) -> Result<&mut Box<dyn PeerConnection>, NegotiationError> {
        self.connection.as_mut().ok_or(NegotiationError::Closed)
    }

    /// Caller path: create our offer and return the `webrtc_offer` to send.
    pub async fn start_as_caller(&mut self) -> Result<SignalingMessage, NegotiationError> {
        self.expect_state("start_as_caller", NegotiationState::Idle)?;
        let offer = self.connection()?.create_offer().await?;
        self.negotiation = NegotiationState::OfferSent;
        self.local_offer = Some(offer.clone());
        info!(epoch = self.epoch, "Offer created");
        Ok(SignalingMessage::WebrtcOffer { offer })
    }

    /// Callee path: apply the partner's offer and return the `webrtc_answer` to send.
    ///
    /// With our own offer outstanding, `Ok(None)` means ours wins: the
    /// partner's offer is dropped and their answer is awaited instead.
    pub async fn on_offer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<Option<SignalingMessage>, NegotiationError> {
        if offer.kind != SdpType::Offer {
            return Err(NegotiationError::Sdp(format!("expected offer, got {:?}", offer.kind)));
        }
        if self.negotiation == NegotiationState::OfferSent && self.connection.is_some() {
            if !self.yields_to(&offer) {
                info!(epoch = self.epoch, "Offers crossed, keeping ours");
                return Ok(None);
            }
            info!(epoch = self.epoch, "Offers crossed, withdrawing ours");
            self.connection()?.rollback().await?;
            self.local_offer = None;
            self.negotiation = NegotiationState::Idle;
        }
        self.expect_state("on_offer", NegotiationState::Idle)?;
        self.negotiation = NegotiationState::OfferReceived;
        let answer = self.connection()?.accept_offer(&offer).await?;
        self.enter_stable().await?;
        info!(epoch = self.epoch, "Answer created");
        Ok(Some(SignalingMessage::WebrtcAnswer { answer }))
    }

    /// Lower offer withdraws. Equal descriptions cannot come from two
    /// independent connections.
    fn yields_to(&self, remote: &SessionDescription) -> bool {
        self.local_offer.as_ref().is_some_and(|ours| ours.sdp < remote.sdp)
    }

    /// Caller path: apply the partner's answer.
    pub async fn on_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.expect_state("on_answer", NegotiationState::OfferSent)?;
        if answer.kind != SdpType::Answer {
            return Err(NegotiationError::Sdp(format!("expected answer, got {:?}", answer.kind)));
        }
        self.connection()?.accept_answer(&answer).await?;
        self.local_offer = None;
        self.enter_stable().await?;
        info!(epoch = self.epoch, "Answer applied");
        Ok(())
    }

    /// Apply a remote candidate now, or queue it until the remote description exists.
    pub async fn on_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        if self.connection.is_none() {
            return Err(NegotiationError::Closed);
        }
        if self.negotiation == NegotiationState::Stable {
            self.connection()?.add_remote_candidate(&candidate).await
        } else {
            debug!(
                epoch = self.epoch,
                queued = self.pending_remote_candidates.len() + 1,
                "Remote description not set yet, queuing candidate"
            );
            self.pending_remote_candidates.push_back(candidate);
            Ok(())
        }
    }

    /// Wrap a locally gathered candidate for immediate sending.
    pub fn on_local_candidate_gathered(&self, candidate: IceCandidate) -> SignalingMessage {
        SignalingMessage::WebrtcIce { candidate }
    }

    pub fn on_remote_track(&mut self, track: RemoteTrack) {
        debug!(epoch = self.epoch, mid = %track.mid, kind = ?track.kind, "Remote track added");
        self.remote_tracks.retain(|t| t.mid != track.mid);
        self.remote_tracks.push(track);
    }

    pub fn on_status(&mut self, status: PeerConnectionStatus) {
        if self.connection.is_some() && self.status != status {
            info!(epoch = self.epoch, from = ?self.status, to = ?status, "Peer connection state changed");
            self.status = status;
        }
    }

    /// Local-only mute. No renegotiation and no signaling message.
    pub fn toggle_mute(&mut self) -> Option<bool> {
        self.local_media.toggle(TrackKind::Audio)
    }

    /// Local-only camera toggle. No renegotiation and no signaling message.
    pub fn toggle_video(&mut self) -> Option<bool> {
        self.local_media.toggle(TrackKind::Video)
    }

    /// Stop local tracks, close the connection, forget negotiation state. Idempotent.
    pub async fn teardown(&mut self) {
        self.local_media.stop();
        if let Some(mut connection) = self.connection.take() {
            connection.close().await;
            info!(epoch = self.epoch, "Peer connection torn down");
        }
        self.negotiation = NegotiationState::Idle;
        self.local_offer = None;
        self.pending_remote_candidates.clear();
        self.remote_tracks.clear();
        self.status = PeerConnectionStatus::Closed;
    }

    /// Remote description applied: the previous remote tracks are void, and
    /// queued candidates can go in, oldest first.
    async fn enter_stable(&mut self) -> Result<(), NegotiationError> {
        self.negotiation = NegotiationState::Stable;
        self.remote_tracks.clear();

        let pending: Vec<IceCandidate> = self.pending_remote_candidates.drain(..).collect();
        if !pending.is_empty() {
            debug!(epoch = self.epoch, count = pending.len(), "Flushing queued remote candidates");
        }
        let connection = self.connection()?;
        for candidate in pending {
            if let Err(e) = connection.add_remote_candidate(&candidate).await {
                warn!(error = %e, "Failed to apply queued candidate");
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        if self.connection.is_some() {
            warn!(epoch = self.epoch, "Peer connection dropped without teardown");
        }
    }
}
