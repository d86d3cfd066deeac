//! The session actor.
//!
//! One task owns the [`Session`], the live [`PeerConnectionManager`] and the
//! call timers. Everything else talks to it through the input queue, so no
//! two handlers ever run concurrently. Timer and engine inputs are stamped
//! with the peer epoch they were issued against; the epoch moves on every
//! teardown, which turns late callbacks from a dead call into no-ops.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use duet_common::{CredentialResult, Credentials};
use duet_signaling::{Inbound, Role, SignalingChannel, SignalingMessage};

use crate::CallConfig;
use crate::engine::{EngineEvents, PeerEngine};
use crate::events::{EngineEvent, Input, LinkInput, PeerConnectionStatus, TimerKind, UserAction};
use crate::media::{MediaSource, TrackKind};
use crate::peer::{NegotiationState, PeerConnectionManager};
use crate::session::{Effect, Session, SessionEvent, SessionState};
use crate::status::{SessionNotice, SessionStatus};
use crate::timers::Timers;

const NOTICE_CAPACITY: usize = 64;

pub struct SessionActor {
    session: Session,
    inputs: mpsc::UnboundedReceiver<Input>,
    tx: mpsc::UnboundedSender<Input>,
    channel: SignalingChannel,
    credentials: Credentials,
    engine: Arc<dyn PeerEngine>,
    media: Arc<dyn MediaSource>,
    config: CallConfig,
    /// Link generation whose frames we accept.
    generation: u64,
    epoch: u64,
    peer: Option<PeerConnectionManager>,
    timers: Timers,
    status: watch::Sender<SessionStatus>,
    notices: broadcast::Sender<SessionNotice>,
    shutdown: CancellationToken,
}

impl SessionActor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        inputs: mpsc::UnboundedReceiver<Input>,
        tx: mpsc::UnboundedSender<Input>,
        channel: SignalingChannel,
        credentials: Credentials,
        engine: Arc<dyn PeerEngine>,
        media: Arc<dyn MediaSource>,
        config: CallConfig,
        shutdown: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            session: Session::new(),
            inputs,
            timers: Timers::new(tx.clone()),
            tx,
            channel,
            credentials,
            engine,
            media,
            config,
            generation: 0,
            epoch: 0,
            peer: None,
            status,
            notices,
            shutdown,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            tx: self.tx.clone(),
            status: self.status.subscribe(),
            notices: self.notices.clone(),
            credentials: self.credentials.clone(),
        }
    }

    pub async fn run(mut self) {
        info!("Session actor started");
        loop {
            let input = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                input = self.inputs.recv() => input,
            };
            let Some(input) = input else { break };
            self.on_input(input).await;
            self.publish();
            if self.session.state() == SessionState::Ended {
                break;
            }
        }

        self.teardown_peer().await;
        self.shutdown.cancel();
        self.publish();
        info!(state = ?self.session.state(), "Session actor stopped");
    }

    async fn on_input(&mut self, input: Input) {
        match input {
            Input::Link { generation, event } => self.on_link(generation, event).await,
            Input::User(action) => self.on_user(action).await,
            Input::Timer { kind, epoch } => {
                if epoch != self.epoch {
                    debug!(?kind, epoch, current = self.epoch, "Discarding stale timer");
                    return;
                }
                self.timers.fired(kind);
                self.on_timer(kind).await;
            }
            Input::Peer { epoch, event } => {
                if epoch != self.epoch || self.peer.is_none() {
                    debug!(epoch, current = self.epoch, "Discarding stale peer event");
                    return;
                }
                self.on_peer_event(event).await;
            }
        }
    }

    async fn on_link(&mut self, generation: u64, event: LinkInput) {
        match event {
            LinkInput::Opened => {
                self.generation = generation;
                self.dispatch(SessionEvent::TransportOpened).await;
            }
            LinkInput::Frame(_) | LinkInput::Closed if generation != self.generation => {
                debug!(generation, current = self.generation, "Ignoring input from an old link");
            }
            LinkInput::Frame(frame) => match Inbound::decode(&frame) {
                Inbound::Message(msg) => self.on_message(msg).await,
                Inbound::Unknown { tag } => debug!(%tag, "Ignoring unknown message type"),
                Inbound::Malformed { tag, reason } => {
                    warn!(tag = ?tag, %reason, "Dropping malformed signaling message");
                }
            },
            LinkInput::Closed => {
                self.dispatch(SessionEvent::TransportLost).await;
                self.notify(SessionNotice::Reconnecting);
            }
        }
    }

    async fn on_user(&mut self, action: UserAction) {
        debug!(?action, "User action");
        match action {
            UserAction::JoinQueue => self.dispatch(SessionEvent::JoinQueue).await,
            UserAction::LeaveQueue => self.dispatch(SessionEvent::LeaveQueue).await,
            UserAction::EndCall => self.dispatch(SessionEvent::EndCall).await,
            UserAction::Logout => self.dispatch(SessionEvent::Logout).await,
            UserAction::ToggleMute => self.toggle(TrackKind::Audio),
            UserAction::ToggleVideo => self.toggle(TrackKind::Video),
        }
    }

    /// Local media only. Nothing goes over signaling.
    fn toggle(&mut self, kind: TrackKind) {
        let Some(peer) = self.peer.as_mut() else {
            debug!(?kind, "No call, nothing to toggle");
            return;
        };
        let toggled = match kind {
            TrackKind::Audio => peer.toggle_mute(),
            TrackKind::Video => peer.toggle_video(),
        };
        if let Some(enabled) = toggled {
            info!(?kind, enabled, "Local track toggled");
            self.notify(SessionNotice::MediaToggled { kind, enabled });
        }
    }

    async fn on_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::EnterCall => self.dispatch(SessionEvent::EnterCallTimerElapsed).await,
            TimerKind::Offer => {
                let Some(peer) = self.peer.as_mut() else { return };
                // The partner offered first and we already answered.
                if peer.negotiation_state() != NegotiationState::Idle {
                    debug!(state = ?peer.negotiation_state(), "Negotiation under way, not offering");
                    return;
                }
                match peer.start_as_caller().await {
                    Ok(offer) => {
                        self.channel.send(&offer);
                    }
                    Err(e) => self.negotiation_failed(e.to_string()).await,
                }
            }
        }
    }

    async fn on_peer_event(&mut self, event: EngineEvent) {
        let Some(peer) = self.peer.as_mut() else { return };
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                let msg = peer.on_local_candidate_gathered(candidate);
                self.channel.send(&msg);
            }
            EngineEvent::RemoteTrack(track) => peer.on_remote_track(track),
            EngineEvent::ConnectionState(status) => {
                peer.on_status(status);
                if status == PeerConnectionStatus::Failed {
                    self.negotiation_failed("peer connection failed".into()).await;
                }
            }
        }
    }

    async fn on_message(&mut self, msg: SignalingMessage) {
        let tag = msg.tag();
        match msg {
            SignalingMessage::Authenticated { message, user_id } => {
                self.coordinator_notice(tag, message);
                self.dispatch(SessionEvent::Authenticated { user_id }).await;
            }
            SignalingMessage::Queued { position, message } => {
                self.coordinator_notice(tag, message);
                self.dispatch(SessionEvent::Queued { position }).await;
            }
            SignalingMessage::MatchFound { call_id, partner_id, message, role } => {
                self.coordinator_notice(tag, message);
                self.dispatch(SessionEvent::MatchFound { call_id, partner_id, role }).await;
            }
            SignalingMessage::CallEnded { message }
            | SignalingMessage::PartnerDisconnected { message } => {
                self.coordinator_notice(tag, message);
                self.dispatch(SessionEvent::RemoteEnded).await;
            }
            SignalingMessage::Error { message } => {
                warn!(%message, "Coordinator reported an error");
                self.notify(SessionNotice::CoordinatorError { message });
            }
            SignalingMessage::WebrtcOffer { offer } => {
                let Some(peer) = self.peer_for(tag) else { return };
                match peer.on_offer(offer).await {
                    Ok(Some(answer)) => {
                        self.channel.send(&answer);
                    }
                    Ok(None) => {}
                    Err(e) => self.negotiation_failed(e.to_string()).await,
                }
            }
            SignalingMessage::WebrtcAnswer { answer } => {
                let Some(peer) = self.peer_for(tag) else { return };
                if let Err(e) = peer.on_answer(answer).await {
                    self.negotiation_failed(e.to_string()).await;
                }
            }
            SignalingMessage::WebrtcIce { candidate } => {
                let Some(peer) = self.peer_for(tag) else { return };
                if let Err(e) = peer.on_remote_candidate(candidate).await {
                    self.negotiation_failed(e.to_string()).await;
                }
            }
            SignalingMessage::Authenticate { .. }
            | SignalingMessage::JoinQueue
            | SignalingMessage::LeaveQueue
            | SignalingMessage::EndCall => {
                debug!(tag, "Ignoring client-bound copy of an outbound message");
            }
        }
    }

    /// Negotiation messages only make sense while a call exists.
    fn peer_for(&mut self, tag: &'static str) -> Option<&mut PeerConnectionManager> {
        if !self.session.state().has_call() {
            debug!(tag, state = ?self.session.state(), "No call in progress, ignoring");
            return None;
        }
        self.peer.as_mut()
    }

    async fn negotiation_failed(&mut self, reason: String) {
        warn!(%reason, "Negotiation failed, ending call");
        self.notify(SessionNotice::CallFailed { reason: reason.clone() });
        self.dispatch(SessionEvent::NegotiationFailed { reason }).await;
    }

    /// Apply `event` and run the resulting effects. Effects that produce
    /// follow-up events queue them here instead of recursing.
    async fn dispatch(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let from = self.session.state();
            let name = event.name();
            let effects = match self.session.apply(event) {
                Ok(effects) => effects,
                Err(rejected) => {
                    debug!(%rejected, "Event rejected");
                    continue;
                }
            };
            let to = self.session.state();
            if from != to {
                info!(event = name, ?from, ?to, "Session state changed");
                self.notify(SessionNotice::StateChanged { from, to });
            }
            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::Send(msg) => {
                self.channel.send(&msg);
            }
            Effect::Authenticate => match self.credentials.get() {
                Some(token) => {
                    self.channel.send(&SignalingMessage::Authenticate { token });
                }
                None => warn!("No session token cached, cannot authenticate"),
            },
            Effect::BeginCall { role } => return self.begin_call(role).await,
            Effect::AttachMedia => {
                if let Some(call) = self.session.call() {
                    info!(call = %call.call_id, partner = %call.partner_id, "Call started");
                }
            }
            Effect::TeardownPeer => self.teardown_peer().await,
            Effect::ClearCredentials => {
                if let Err(e) = self.credentials.clear() {
                    error!(error = %e, "Failed to clear session token");
                }
            }
            Effect::StopReconnecting => self.shutdown.cancel(),
        }
        None
    }

    /// Acquire media, open the peer connection and arm the call timers.
    async fn begin_call(&mut self, role: Role) -> Option<SessionEvent> {
        // Invariant: at most one peer connection and capture lease at a time.
        self.teardown_peer().await;

        let media = match self.media.acquire(self.config.media).await {
            Ok(media) => media,
            Err(e) => {
                error!(error = %e, "Could not acquire local media");
                let reason = e.to_string();
                self.notify(SessionNotice::CallFailed { reason: reason.clone() });
                return Some(SessionEvent::MediaFailed { reason });
            }
        };

        let events = EngineEvents::new(self.epoch, self.tx.clone());
        let peer = match PeerConnectionManager::open(self.engine.as_ref(), media, events).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!(error = %e, "Could not open peer connection");
                let reason = e.to_string();
                self.notify(SessionNotice::CallFailed { reason: reason.clone() });
                return Some(SessionEvent::NegotiationFailed { reason });
            }
        };
        self.peer = Some(peer);

        self.timers.schedule(TimerKind::EnterCall, self.config.in_call_delay, self.epoch);
        if role == Role::Caller {
            self.timers.schedule(TimerKind::Offer, self.config.offer_delay, self.epoch);
        }
        if let Some(call) = self.session.call() {
            info!(call = %call.call_id, partner = %call.partner_id, ?role, epoch = self.epoch, "Call setup started");
        }
        None
    }

    /// Cancel timers, release media, close the connection. Moves the epoch on
    /// so anything still in flight for the old call is ignored.
    async fn teardown_peer(&mut self) {
        self.timers.cancel_all();
        if let Some(mut peer) = self.peer.take() {
            peer.teardown().await;
        }
        self.epoch += 1;
    }

    fn coordinator_notice(&self, tag: &'static str, message: Option<String>) {
        if let Some(message) = message.filter(|m| !m.is_empty()) {
            self.notify(SessionNotice::Coordinator { tag, message });
        }
    }

    fn notify(&self, notice: SessionNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn publish(&self) {
        let peer = self.peer.as_ref();
        let track_off = |kind: TrackKind| {
            peer.is_some_and(|p| {
                let media = p.local_media();
                media.kinds().contains(&kind) && !media.is_enabled(kind)
            })
        };
        let status = SessionStatus {
            state: self.session.state(),
            queue_position: self.session.queue_position(),
            call: self.session.call().cloned(),
            in_call_since: self.session.in_call_since(),
            failure: self.session.failure().map(str::to_owned),
            transport_open: self.channel.is_open(),
            negotiation: peer.map(PeerConnectionManager::negotiation_state),
            peer: peer.map(PeerConnectionManager::status),
            muted: track_off(TrackKind::Audio),
            video_off: track_off(TrackKind::Video),
            remote_tracks: peer.map(|p| p.remote_tracks().to_vec()).unwrap_or_default(),
        };
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<SessionStatus>,
    notices: broadcast::Sender<SessionNotice>,
    credentials: Credentials,
}

impl SessionHandle {
    fn act(&self, action: UserAction) -> bool {
        self.tx.send(Input::User(action)).is_ok()
    }

    pub fn join_queue(&self) -> bool {
        self.act(UserAction::JoinQueue)
    }

    pub fn leave_queue(&self) -> bool {
        self.act(UserAction::LeaveQueue)
    }

    pub fn end_call(&self) -> bool {
        self.act(UserAction::EndCall)
    }

    pub fn toggle_mute(&self) -> bool {
        self.act(UserAction::ToggleMute)
    }

    pub fn toggle_video(&self) -> bool {
        self.act(UserAction::ToggleVideo)
    }

    /// Clear the token and stop for good.
    pub fn logout(&self) -> bool {
        self.act(UserAction::Logout)
    }

    /// Provision a fresh token. Used on the next (re)connect.
    pub async fn refresh_token(&self) -> CredentialResult<String> {
        self.credentials.refresh().await
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    /// Whether the actor has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use duet_common::credentials::{LocalGenerator, MemoryStore};
    use duet_signaling::IceCandidate;
    use duet_signaling::memory::{self, MemoryServer, ServerEnd};
    use tokio::time::Instant;

    use super::*;
    use crate::media::CaptureDevice;
    use crate::testing::{FakeEngine, LOCAL_CANDIDATE};
    use crate::{CallClient, CallDeps};

    struct Harness {
        client: CallClient,
        handle: SessionHandle,
        server: MemoryServer,
        end: ServerEnd,
        engine: FakeEngine,
        device: CaptureDevice,
        credentials: Credentials,
    }

    async fn wait_for(handle: &SessionHandle, what: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
        let mut rx = handle.watch();
        let status = tokio::time::timeout(Duration::from_secs(60), rx.wait_for(|s| what(s)))
            .await
            .expect("timed out waiting for status")
            .expect("actor gone")
            .clone();
        status
    }

    async fn wait_state(handle: &SessionHandle, state: SessionState) -> SessionStatus {
        wait_for(handle, |s| s.state == state).await
    }

    /// Let the actor drain its queue without reaching any call timer.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn connected() -> Harness {
        let (dialer, mut server) = memory::pair();
        let engine = FakeEngine::default();
        let device = CaptureDevice::new();
        let credentials = Credentials::new(Arc::new(MemoryStore::new()), Arc::new(LocalGenerator));
        let client = CallClient::start(
            CallConfig::default(),
            CallDeps {
                dialer: Arc::new(dialer),
                credentials: credentials.clone(),
                engine: Arc::new(engine.clone()),
                media: Arc::new(device.clone()),
            },
        );
        let handle = client.handle();

        let mut end = server.accept().await.unwrap();
        let token = credentials.get().unwrap();
        assert_eq!(end.recv().await, Some(SignalingMessage::Authenticate { token }));
        end.push(&SignalingMessage::Authenticated { message: None, user_id: None }).await;
        wait_state(&handle, SessionState::Connected).await;

        Harness { client, handle, server, end, engine, device, credentials }
    }

    fn match_found(role: Option<Role>) -> SignalingMessage {
        SignalingMessage::MatchFound {
            call_id: "c1".into(),
            partner_id: "p1".into(),
            message: Some("Match found!".into()),
            role,
        }
    }

    fn local_ice() -> SignalingMessage {
        SignalingMessage::WebrtcIce { candidate: IceCandidate::new(LOCAL_CANDIDATE) }
    }

    async fn queued(h: &mut Harness) {
        h.handle.join_queue();
        assert_eq!(h.end.recv().await, Some(SignalingMessage::JoinQueue));
        wait_state(&h.handle, SessionState::Queued).await;
    }

    async fn in_call(h: &mut Harness, role: Role) {
        queued(h).await;
        h.end.push(&match_found(Some(role))).await;
        wait_state(&h.handle, SessionState::Matched).await;
        assert_eq!(h.end.recv().await, Some(local_ice()));
        if role == Role::Caller {
            assert!(matches!(h.end.recv().await, Some(SignalingMessage::WebrtcOffer { .. })));
        }
        wait_state(&h.handle, SessionState::InCall).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_to_call_as_caller() {
        let mut h = connected().await;
        queued(&mut h).await;

        h.end.push(&SignalingMessage::Queued { position: 3, message: None }).await;
        wait_for(&h.handle, |s| s.queue_position == Some(3)).await;
        h.end.push(&SignalingMessage::Queued { position: 1, message: None }).await;
        wait_for(&h.handle, |s| s.queue_position == Some(1)).await;

        let matched_at = Instant::now();
        h.end.push(&match_found(Some(Role::Caller))).await;
        let status = wait_state(&h.handle, SessionState::Matched).await;
        let call = status.call.unwrap();
        assert_eq!((call.call_id.as_str(), call.partner_id.as_str()), ("c1", "p1"));
        assert_eq!(status.queue_position, None);
        assert!(h.device.in_use());

        assert_eq!(h.end.recv().await, Some(local_ice()));
        assert!(matches!(h.end.recv().await, Some(SignalingMessage::WebrtcOffer { .. })));
        assert!(matched_at.elapsed() >= Duration::from_secs(1));

        let status = wait_state(&h.handle, SessionState::InCall).await;
        assert!(matched_at.elapsed() >= Duration::from_secs(2));
        assert!(status.in_call_since.is_some());

        // Exactly one offer.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.end.try_recv().is_none());
        assert_eq!(h.engine.calls(), vec!["create_offer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answer_completes_caller_negotiation() {
        let mut h = connected().await;
        in_call(&mut h, Role::Caller).await;

        h.end
            .push(&SignalingMessage::WebrtcAnswer { answer: duet_signaling::SessionDescription::answer("a") })
            .await;
        let status = wait_for(&h.handle, |s| {
            s.negotiation == Some(NegotiationState::Stable)
        })
        .await;
        assert_eq!(status.state, SessionState::InCall);
        assert_eq!(h.engine.calls(), vec!["create_offer", "accept_answer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callee_buffers_candidates_until_offer() {
        let mut h = connected().await;
        queued(&mut h).await;
        h.end.push(&match_found(Some(Role::Callee))).await;
        wait_state(&h.handle, SessionState::Matched).await;
        assert_eq!(h.end.recv().await, Some(local_ice()));

        for c in ["c-1", "c-2"] {
            h.end.push(&SignalingMessage::WebrtcIce { candidate: IceCandidate::new(c) }).await;
        }
        settle().await;
        assert!(h.engine.calls().is_empty());

        h.end
            .push(&SignalingMessage::WebrtcOffer { offer: duet_signaling::SessionDescription::offer("o") })
            .await;
        assert!(matches!(h.end.recv().await, Some(SignalingMessage::WebrtcAnswer { .. })));
        assert_eq!(h.engine.calls(), vec!["accept_offer", "candidate c-1", "candidate c-2"]);

        h.end.push(&SignalingMessage::WebrtcIce { candidate: IceCandidate::new("c-3") }).await;
        settle().await;
        assert_eq!(h.engine.calls().last().map(String::as_str), Some("candidate c-3"));
        assert_eq!(h.engine.calls().len(), 4);

        // The callee never offers.
        wait_state(&h.handle, SessionState::InCall).await;
        assert!(!h.engine.calls().contains(&"create_offer".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_partner_disconnect_releases_call() {
        let mut h = connected().await;
        in_call(&mut h, Role::Caller).await;
        let mut notices = h.handle.subscribe();

        h.end
            .push(&SignalingMessage::PartnerDisconnected { message: Some("Partner left".into()) })
            .await;
        let status = wait_state(&h.handle, SessionState::Connected).await;
        assert!(status.call.is_none());
        assert!(status.in_call_since.is_none());
        assert!(status.peer.is_none());
        assert_eq!(h.engine.closed(), 1);
        assert!(!h.device.in_use());

        let mut saw_message = false;
        while let Ok(notice) = notices.try_recv() {
            if let SessionNotice::Coordinator { tag, message } = notice {
                assert_eq!(tag, "partner_disconnected");
                assert_eq!(message, "Partner left");
                saw_message = true;
            }
        }
        assert!(saw_message);
    }

    #[tokio::test(start_paused = true)]
    async fn test_end_call_notifies_coordinator() {
        let mut h = connected().await;
        in_call(&mut h, Role::Callee).await;

        h.handle.end_call();
        assert_eq!(h.end.recv().await, Some(SignalingMessage::EndCall));
        wait_state(&h.handle, SessionState::Connected).await;
        assert_eq!(h.engine.closed(), 1);
        assert!(!h.device.in_use());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_end_before_offer_cancels_timers() {
        let mut h = connected().await;
        queued(&mut h).await;
        h.end.push(&match_found(Some(Role::Caller))).await;
        wait_state(&h.handle, SessionState::Matched).await;
        assert_eq!(h.end.recv().await, Some(local_ice()));

        h.end.push(&SignalingMessage::CallEnded { message: None }).await;
        wait_state(&h.handle, SessionState::Connected).await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(h.end.try_recv().is_none());
        assert!(h.engine.calls().is_empty());
        assert_eq!(h.handle.status().state, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_twice_is_local_only() {
        let mut h = connected().await;
        in_call(&mut h, Role::Caller).await;

        h.handle.toggle_mute();
        assert!(wait_for(&h.handle, |s| s.muted).await.muted);
        h.handle.toggle_mute();
        assert!(!wait_for(&h.handle, |s| !s.muted).await.muted);

        h.handle.toggle_video();
        assert!(wait_for(&h.handle, |s| s.video_off).await.video_off);

        settle().await;
        assert!(h.end.try_recv().is_none());
        assert_eq!(h.handle.status().state, SessionState::InCall);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_while_queued_reconnects() {
        let mut h = connected().await;
        queued(&mut h).await;
        h.end.push(&SignalingMessage::Queued { position: 5, message: None }).await;
        wait_for(&h.handle, |s| s.queue_position == Some(5)).await;

        let token = h.credentials.get().unwrap();
        h.end.close().await;
        let status = wait_state(&h.handle, SessionState::Disconnected).await;
        assert_eq!(status.queue_position, None);
        let lost_at = Instant::now();

        let mut end = h.server.accept().await.unwrap();
        assert_eq!(end.recv().await, Some(SignalingMessage::Authenticate { token }));
        assert!(lost_at.elapsed() >= Duration::from_secs(3));
        wait_state(&h.handle, SessionState::Connecting).await;

        // Queue membership is not resumed.
        end.push(&SignalingMessage::Authenticated { message: None, user_id: None }).await;
        wait_state(&h.handle, SessionState::Connected).await;
        settle().await;
        assert!(end.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_loss_in_call_tears_down_first() {
        let mut h = connected().await;
        in_call(&mut h, Role::Caller).await;

        h.end.close().await;
        wait_state(&h.handle, SessionState::Disconnected).await;
        assert_eq!(h.engine.closed(), 1);
        assert!(!h.device.in_use());

        let mut end = h.server.accept().await.unwrap();
        assert!(matches!(end.recv().await, Some(SignalingMessage::Authenticate { .. })));
        let status = h.handle.status();
        assert!(status.call.is_none());
        assert!(status.peer.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_denied_requires_retry() {
        let mut h = connected().await;
        h.device.set_permitted(false);
        queued(&mut h).await;

        h.end.push(&match_found(Some(Role::Caller))).await;
        assert_eq!(h.end.recv().await, Some(SignalingMessage::EndCall));
        let status = wait_for(&h.handle, |s| s.failure.is_some()).await;
        assert_eq!(status.state, SessionState::Connected);
        assert_eq!(h.engine.opened(), 0);

        // No automatic retry.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.end.try_recv().is_none());

        h.device.set_permitted(true);
        h.handle.join_queue();
        assert_eq!(h.end.recv().await, Some(SignalingMessage::JoinQueue));
        let status = wait_state(&h.handle, SessionState::Queued).await;
        assert!(status.failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_answer_ends_call() {
        let mut h = connected().await;
        h.engine.fail_answers(true);
        in_call(&mut h, Role::Caller).await;

        h.end
            .push(&SignalingMessage::WebrtcAnswer { answer: duet_signaling::SessionDescription::answer("bad") })
            .await;
        assert_eq!(h.end.recv().await, Some(SignalingMessage::EndCall));
        wait_state(&h.handle, SessionState::Connected).await;
        assert_eq!(h.engine.closed(), 1);
        assert!(!h.device.in_use());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_malformed_messages_are_dropped() {
        let mut h = connected().await;
        queued(&mut h).await;
        h.end.push(&SignalingMessage::Queued { position: 4, message: None }).await;
        wait_for(&h.handle, |s| s.queue_position == Some(4)).await;

        h.end.push_raw(r#"{"type":"typing","who":"p1"}"#).await;
        h.end.push_raw(r#"{"type":"queued","position":"first"}"#).await;
        h.end.push_raw("not json").await;
        h.end.push_raw(r#"{"type":"match_found"}"#).await;
        settle().await;

        let status = h.handle.status();
        assert_eq!(status.state, SessionState::Queued);
        assert_eq!(status.queue_position, Some(4));

        h.end.push(&SignalingMessage::Queued { position: 2, message: None }).await;
        wait_for(&h.handle, |s| s.queue_position == Some(2)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_signaling_for_no_call_is_ignored() {
        let mut h = connected().await;
        h.end
            .push(&SignalingMessage::WebrtcOffer { offer: duet_signaling::SessionDescription::offer("o") })
            .await;
        h.end.push(&SignalingMessage::WebrtcIce { candidate: IceCandidate::new("c") }).await;
        settle().await;
        assert!(h.end.try_recv().is_none());
        assert_eq!(h.handle.status().state, SessionState::Connected);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_pending_reconnect() {
        let mut h = connected().await;
        h.end.close().await;
        wait_state(&h.handle, SessionState::Disconnected).await;

        h.handle.logout();
        wait_state(&h.handle, SessionState::Ended).await;
        assert!(h.credentials.get().is_none());

        // The supervisor stops instead of redialing.
        assert!(h.server.accept().await.is_none());
        h.client.join().await;
        assert!(h.handle.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_falls_back_to_identifier_order() {
        let mut h = connected().await;
        h.end.close().await;
        let mut end = h.server.accept().await.unwrap();
        end.recv().await;
        end.push(&SignalingMessage::Authenticated { message: None, user_id: Some("zed".into()) }).await;
        wait_state(&h.handle, SessionState::Connected).await;

        h.handle.join_queue();
        assert_eq!(end.recv().await, Some(SignalingMessage::JoinQueue));
        end.push(&SignalingMessage::MatchFound {
            call_id: "c9".into(),
            partner_id: "amy".into(),
            message: None,
            role: None,
        })
        .await;
        let status = wait_state(&h.handle, SessionState::Matched).await;
        assert_eq!(status.call.unwrap().role, Role::Callee);

        wait_state(&h.handle, SessionState::InCall).await;
        assert!(h.engine.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossed_offers_lower_side_answers() {
        let mut h = connected().await;
        queued(&mut h).await;
        h.end.push(&match_found(None)).await;
        assert_eq!(wait_state(&h.handle, SessionState::Matched).await.call.unwrap().role, Role::Caller);
        assert_eq!(h.end.recv().await, Some(local_ice()));
        assert!(matches!(h.end.recv().await, Some(SignalingMessage::WebrtcOffer { .. })));

        // "fake-offer" sorts below the partner's, so ours is withdrawn.
        h.end
            .push(&SignalingMessage::WebrtcOffer { offer: duet_signaling::SessionDescription::offer("zzz-offer") })
            .await;
        assert!(matches!(h.end.recv().await, Some(SignalingMessage::WebrtcAnswer { .. })));
        wait_for(&h.handle, |s| {
            s.state == SessionState::InCall && s.negotiation == Some(NegotiationState::Stable)
        })
        .await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.end.try_recv().is_none());
        assert_eq!(h.handle.status().state, SessionState::InCall);
        assert_eq!(h.engine.calls(), vec!["create_offer", "rollback", "accept_offer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossed_offers_higher_side_waits_for_answer() {
        let mut h = connected().await;
        queued(&mut h).await;
        h.end.push(&match_found(None)).await;
        assert_eq!(h.end.recv().await, Some(local_ice()));
        assert!(matches!(h.end.recv().await, Some(SignalingMessage::WebrtcOffer { .. })));

        h.end
            .push(&SignalingMessage::WebrtcOffer { offer: duet_signaling::SessionDescription::offer("aaa-offer") })
            .await;
        settle().await;
        assert!(h.end.try_recv().is_none());
        assert_eq!(h.handle.status().negotiation, Some(NegotiationState::OfferSent));

        h.end
            .push(&SignalingMessage::WebrtcAnswer { answer: duet_signaling::SessionDescription::answer("aaa-answer") })
            .await;
        wait_for(&h.handle, |s| {
            s.state == SessionState::InCall && s.negotiation == Some(NegotiationState::Stable)
        })
        .await;
        assert!(h.end.try_recv().is_none());
        assert_eq!(h.engine.calls(), vec!["create_offer", "accept_answer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partner_offer_before_our_timer_suppresses_ours() {
        let mut h = connected().await;
        queued(&mut h).await;
        h.end.push(&match_found(None)).await;
        wait_state(&h.handle, SessionState::Matched).await;
        assert_eq!(h.end.recv().await, Some(local_ice()));

        h.end
            .push(&SignalingMessage::WebrtcOffer { offer: duet_signaling::SessionDescription::offer("early") })
            .await;
        assert!(matches!(h.end.recv().await, Some(SignalingMessage::WebrtcAnswer { .. })));

        // The offer timer fires after this and must leave the call alone.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(h.end.try_recv().is_none());
        let status = h.handle.status();
        assert_eq!(status.state, SessionState::InCall);
        assert_eq!(status.negotiation, Some(NegotiationState::Stable));
        assert_eq!(h.engine.calls(), vec!["accept_offer"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_callbacks_from_previous_call_are_ignored() {
        let mut h = connected().await;
        in_call(&mut h, Role::Caller).await;
        h.end.push(&SignalingMessage::CallEnded { message: None }).await;
        wait_state(&h.handle, SessionState::Connected).await;
        let first = h.engine.events(0);

        queued(&mut h).await;
        h.end
            .push(&SignalingMessage::MatchFound {
                call_id: "c2".into(),
                partner_id: "p2".into(),
                message: None,
                role: Some(Role::Callee),
            })
            .await;
        wait_state(&h.handle, SessionState::Matched).await;
        assert_eq!(h.end.recv().await, Some(local_ice()));
        assert_ne!(h.engine.events(1).epoch(), first.epoch());

        // Everything stamped with the first call's epoch is dropped.
        first.emit(EngineEvent::ConnectionState(PeerConnectionStatus::Failed));
        first.emit(EngineEvent::LocalCandidate(IceCandidate::new("stale")));
        h.handle
            .tx
            .send(Input::Timer { kind: TimerKind::Offer, epoch: first.epoch() })
            .unwrap();
        settle().await;

        assert!(h.end.try_recv().is_none());
        let status = h.handle.status();
        assert_eq!(status.state, SessionState::Matched);
        assert_eq!(status.call.unwrap().call_id, "c2");
        assert_eq!(status.negotiation, Some(NegotiationState::Idle));
        assert_eq!(h.engine.closed(), 1);
        assert_eq!(h.engine.calls(), vec!["create_offer"]);

        // The live call still reacts to its own engine.
        h.engine.events(1).emit(EngineEvent::ConnectionState(PeerConnectionStatus::Failed));
        assert_eq!(h.end.recv().await, Some(SignalingMessage::EndCall));
        wait_state(&h.handle, SessionState::Connected).await;
        assert_eq!(h.engine.closed(), 2);
    }

    /// Coordinator stand-in that assigns no roles and reports no user ids.
    async fn relay_without_roles(mut ends: [ServerEnd; 2]) {
        let mut queued = [false; 2];
        loop {
            let (from, msg) = {
                let [a, b] = &mut ends;
                tokio::select! {
                    m = a.recv() => (0, m),
                    m = b.recv() => (1, m),
                }
            };
            let Some(msg) = msg else { break };
            let to = 1 - from;
            match msg {
                SignalingMessage::Authenticate { .. } => {
                    ends[from]
                        .push(&SignalingMessage::Authenticated { message: None, user_id: None })
                        .await;
                }
                SignalingMessage::JoinQueue => {
                    queued[from] = true;
                    if queued == [true, true] {
                        for (i, end) in ends.iter().enumerate() {
                            end.push(&SignalingMessage::MatchFound {
                                call_id: "c1".into(),
                                partner_id: format!("peer-{}", 1 - i),
                                message: None,
                                role: None,
                            })
                            .await;
                        }
                    }
                }
                SignalingMessage::EndCall => {
                    ends[to].push(&SignalingMessage::CallEnded { message: None }).await;
                }
                relay @ (SignalingMessage::WebrtcOffer { .. }
                | SignalingMessage::WebrtcAnswer { .. }
                | SignalingMessage::WebrtcIce { .. }) => ends[to].push(&relay).await,
                _ => {}
            }
        }
    }

    async fn start_named(label: &'static str) -> (CallClient, FakeEngine, MemoryServer, ServerEnd) {
        let (dialer, mut server) = memory::pair();
        let engine = FakeEngine::named(label);
        let client = CallClient::start(
            CallConfig::default(),
            CallDeps {
                dialer: Arc::new(dialer),
                credentials: Credentials::new(Arc::new(MemoryStore::new()), Arc::new(LocalGenerator)),
                engine: Arc::new(engine.clone()),
                media: Arc::new(CaptureDevice::new()),
            },
        );
        let end = server.accept().await.unwrap();
        (client, engine, server, end)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_sessions_connect_without_assigned_roles() {
        let (amber, amber_engine, _amber_server, amber_end) = start_named("amber").await;
        let (birch, birch_engine, _birch_server, birch_end) = start_named("birch").await;
        tokio::spawn(relay_without_roles([amber_end, birch_end]));

        let handles = [amber.handle(), birch.handle()];
        for handle in &handles {
            wait_state(handle, SessionState::Connected).await;
            handle.join_queue();
        }
        for handle in &handles {
            let status = wait_for(handle, |s| {
                s.state == SessionState::InCall && s.negotiation == Some(NegotiationState::Stable)
            })
            .await;
            assert_eq!(status.call.unwrap().role, Role::Caller);
        }

        tokio::time::sleep(Duration::from_secs(10)).await;
        for handle in &handles {
            let status = handle.status();
            assert_eq!(status.state, SessionState::InCall);
            assert_eq!(status.negotiation, Some(NegotiationState::Stable));
        }

        // Exactly one side answered, whichever way the offers raced.
        let count = |call: &str| {
            [&amber_engine, &birch_engine]
                .iter()
                .filter(|e| e.calls().iter().any(|c| c == call))
                .count()
        };
        assert_eq!(count("accept_offer"), 1);
        assert_eq!(count("accept_answer"), 1);

        amber.shutdown().await;
        birch.shutdown().await;
    }
}
