//! [`PeerEngine`] backed by `str0m`.
//!
//! str0m is Sans-IO: it never touches a socket or a clock. Each connection
//! binds one UDP socket, advertises it as a host candidate, and runs a driver
//! task that feeds datagrams and timeouts into the `Rtc` and carries out
//! whatever it asks for (transmits, timeouts, events). Negotiation calls lock
//! the same `Rtc` and poke the driver so new output is flushed promptly.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{Direction, MediaKind, Mid};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use duet_common::config::MediaConfig;
use duet_signaling::{IceCandidate, SessionDescription};

use crate::engine::{EngineEvents, PeerConnection, PeerEngine};
use crate::error::NegotiationError;
use crate::events::{EngineEvent, PeerConnectionStatus, RemoteTrack};
use crate::media::TrackKind;

const MAX_DATAGRAM: usize = 2000;

pub struct Str0mEngine {
    bind_ip: IpAddr,
    stun_urls: Vec<String>,
}

impl Str0mEngine {
    pub fn new(bind_ip: IpAddr) -> Self {
        Self { bind_ip, stun_urls: Vec::new() }
    }

    /// Recorded for diagnostics. Only the host candidate of the bound socket
    /// is ever advertised, so peers must be directly reachable.
    pub fn with_stun_urls(mut self, urls: Vec<String>) -> Self {
        self.stun_urls = urls;
        self
    }

    pub fn from_config(cfg: &MediaConfig) -> Result<Self, NegotiationError> {
        let bind_ip: IpAddr = cfg.bind_ip.parse().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("media.bind_ip: {e}"))
        })?;
        Ok(Self::new(bind_ip).with_stun_urls(cfg.stun_urls.clone()))
    }

    /// The address we advertise. An unspecified bind address is useless as a
    /// host candidate, so ask the routing table which interface it would use.
    fn candidate_ip(&self) -> IpAddr {
        if !self.bind_ip.is_unspecified() {
            return self.bind_ip;
        }
        std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|s| {
                s.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
                s.local_addr()
            })
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}

#[async_trait]
impl PeerEngine for Str0mEngine {
    async fn open(
        &self,
        tracks: &[TrackKind],
        events: EngineEvents,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        let socket = UdpSocket::bind(SocketAddr::new(self.candidate_ip(), 0)).await?;
        let local_addr = socket.local_addr()?;
        debug!(epoch = events.epoch(), addr = %local_addr, "Bound UDP socket for peer");
        if !self.stun_urls.is_empty() {
            // Host candidates only; no server-reflexive gathering.
            debug!(stun = ?self.stun_urls, "Configured STUN servers are not queried");
        }

        let mut rtc = Rtc::builder().build(Instant::now());
        let candidate = Candidate::host(local_addr, Protocol::Udp)
            .map_err(|e| NegotiationError::Candidate(e.to_string()))?;
        events.emit(EngineEvent::LocalCandidate(to_wire(&candidate)));
        rtc.add_local_candidate(candidate);

        let shared = Arc::new(Shared { rtc: Mutex::new(rtc), wake: Notify::new() });
        let driver = tokio::spawn(drive(shared.clone(), Arc::new(socket), local_addr, events.clone()));

        Ok(Box::new(Str0mConnection {
            shared,
            driver: Some(driver),
            events,
            tracks: tracks.to_vec(),
            offered: Vec::new(),
            pending: None,
        }))
    }
}

struct Shared {
    rtc: Mutex<Rtc>,
    /// Signalled whenever negotiation changed the `Rtc` from outside the driver.
    wake: Notify,
}

struct Str0mConnection {
    shared: Arc<Shared>,
    driver: Option<JoinHandle<()>>,
    events: EngineEvents,
    tracks: Vec<TrackKind>,
    /// m-lines we added when creating our offer.
    offered: Vec<(Mid, TrackKind)>,
    pending: Option<SdpPendingOffer>,
}

impl Str0mConnection {
    fn poke(&self) {
        self.shared.wake.notify_one();
    }
}

#[async_trait]
impl PeerConnection for Str0mConnection {
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let mut rtc = self.shared.rtc.lock().await;
        let mut api = rtc.sdp_api();
        let mut offered = Vec::with_capacity(self.tracks.len());
        for kind in &self.tracks {
            let mid = api.add_media(media_kind(*kind), Direction::SendRecv, None, None, None);
            offered.push((mid, *kind));
        }
        let (offer, pending) = api
            .apply()
            .ok_or_else(|| NegotiationError::Sdp("no media to offer".into()))?;
        drop(rtc);

        self.offered = offered;
        self.pending = Some(pending);
        self.poke();
        Ok(SessionDescription::offer(offer.to_sdp_string()))
    }

    async fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let offer = SdpOffer::from_sdp_string(&offer.sdp)
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        let answer = self.shared.rtc.lock().await.sdp_api().accept_offer(offer)?;
        self.poke();
        Ok(SessionDescription::answer(answer.to_sdp_string()))
    }

    async fn accept_answer(&mut self, answer: &SessionDescription) -> Result<(), NegotiationError> {
        let pending = self
            .pending
            .take()
            .ok_or_else(|| NegotiationError::Sdp("answer without an outstanding offer".into()))?;
        let answer = SdpAnswer::from_sdp_string(&answer.sdp)
            .map_err(|e| NegotiationError::Sdp(e.to_string()))?;
        let mut rtc = self.shared.rtc.lock().await;
        rtc.sdp_api().accept_answer(pending, answer)?;
        drop(rtc);

        // Our m-lines are send/recv, so each one also carries the partner's track.
        for (mid, kind) in &self.offered {
            self.events.emit(EngineEvent::RemoteTrack(RemoteTrack {
                mid: mid.to_string(),
                kind: *kind,
            }));
        }
        self.poke();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), NegotiationError> {
        // Dropping the pending offer is enough: str0m never applied it.
        if self.pending.take().is_none() {
            return Err(NegotiationError::Sdp("no outstanding offer to roll back".into()));
        }
        self.offered.clear();
        self.poke();
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        let parsed = Candidate::from_sdp_string(&candidate.candidate)
            .map_err(|e| NegotiationError::Candidate(format!("{e:?}")))?;
        self.shared.rtc.lock().await.add_remote_candidate(parsed);
        self.poke();
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
            self.shared.rtc.lock().await.disconnect();
            debug!(epoch = self.events.epoch(), "str0m connection closed");
        }
    }
}

impl Drop for Str0mConnection {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// Pump the `Rtc` until it is dead or the task is aborted.
async fn drive(shared: Arc<Shared>, socket: Arc<UdpSocket>, local_addr: SocketAddr, events: EngineEvents) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let deadline = {
            let mut rtc = shared.rtc.lock().await;
            match flush(&mut rtc, &socket, &events).await {
                Some(deadline) => deadline,
                None => break,
            }
        };

        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                let mut rtc = shared.rtc.lock().await;
                if let Err(e) = rtc.handle_input(Input::Timeout(Instant::now())) {
                    warn!(error = %e, "str0m timeout handling failed");
                }
            }
            received = socket.recv_from(&mut buf) => {
                let (n, source) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        warn!(error = %e, "UDP receive failed");
                        continue;
                    }
                };
                let receive = match Receive::new(Protocol::Udp, source, local_addr, &buf[..n]) {
                    Ok(r) => r,
                    Err(e) => {
                        trace!(error = ?e, %source, "Ignoring unrecognised datagram");
                        continue;
                    }
                };
                let mut rtc = shared.rtc.lock().await;
                if let Err(e) = rtc.handle_input(Input::Receive(Instant::now(), receive)) {
                    warn!(error = %e, "str0m rejected datagram");
                }
            }
        }
    }

    events.emit(EngineEvent::ConnectionState(PeerConnectionStatus::Closed));
    debug!(epoch = events.epoch(), "str0m driver stopped");
}

/// Drain pending output. Returns the next deadline, or `None` once the
/// connection is dead.
async fn flush(rtc: &mut Rtc, socket: &UdpSocket, events: &EngineEvents) -> Option<Instant> {
    loop {
        if !rtc.is_alive() {
            return None;
        }
        let output = match rtc.poll_output() {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "str0m poll failed");
                events.emit(EngineEvent::ConnectionState(PeerConnectionStatus::Failed));
                return None;
            }
        };
        match output {
            Output::Timeout(deadline) => return Some(deadline),
            Output::Transmit(t) => {
                if let Err(e) = socket.send_to(&t.contents, t.destination).await {
                    debug!(error = %e, destination = %t.destination, "UDP send failed");
                }
            }
            Output::Event(event) => on_event(event, events),
        }
    }
}

fn on_event(event: Event, events: &EngineEvents) {
    match event {
        Event::IceConnectionStateChange(state) => {
            let status = match state {
                IceConnectionState::New | IceConnectionState::Checking => PeerConnectionStatus::Connecting,
                IceConnectionState::Connected | IceConnectionState::Completed => {
                    PeerConnectionStatus::Connected
                }
                IceConnectionState::Disconnected => PeerConnectionStatus::Disconnected,
            };
            events.emit(EngineEvent::ConnectionState(status));
        }
        Event::Connected => info!(epoch = events.epoch(), "Peer media path established"),
        Event::MediaAdded(added) => {
            let kind = match added.kind {
                MediaKind::Audio => TrackKind::Audio,
                MediaKind::Video => TrackKind::Video,
            };
            events.emit(EngineEvent::RemoteTrack(RemoteTrack { mid: added.mid.to_string(), kind }));
        }
        other => trace!(event = ?other, "str0m event"),
    }
}

fn media_kind(kind: TrackKind) -> MediaKind {
    match kind {
        TrackKind::Audio => MediaKind::Audio,
        TrackKind::Video => MediaKind::Video,
    }
}

fn to_wire(candidate: &Candidate) -> IceCandidate {
    let sdp = candidate.to_sdp_string();
    IceCandidate {
        sdp_mid: Some("0".into()),
        sdp_m_line_index: Some(0),
        ..IceCandidate::new(sdp.trim_start_matches("a=").trim_end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Input as ActorInput;
    use duet_signaling::SdpType;
    use tokio::sync::mpsc;

    fn engine_events(epoch: u64) -> (EngineEvents, mpsc::UnboundedReceiver<ActorInput>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EngineEvents::new(epoch, tx), rx)
    }

    fn first_candidate(rx: &mut mpsc::UnboundedReceiver<ActorInput>) -> IceCandidate {
        while let Ok(input) = rx.try_recv() {
            if let ActorInput::Peer { event: EngineEvent::LocalCandidate(c), .. } = input {
                return c;
            }
        }
        panic!("no local candidate emitted");
    }

    #[tokio::test]
    async fn test_offer_answer_exchange_over_loopback() {
        let engine = Str0mEngine::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let kinds = [TrackKind::Audio, TrackKind::Video];

        let (caller_events, mut caller_rx) = engine_events(1);
        let (callee_events, mut callee_rx) = engine_events(1);
        let mut caller = engine.open(&kinds, caller_events).await.unwrap();
        let mut callee = engine.open(&kinds, callee_events).await.unwrap();

        let caller_candidate = first_candidate(&mut caller_rx);
        let callee_candidate = first_candidate(&mut callee_rx);
        assert!(caller_candidate.candidate.starts_with("candidate:"));
        assert_eq!(caller_candidate.sdp_m_line_index, Some(0));

        let offer = caller.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));

        let answer = callee.accept_offer(&offer).await.unwrap();
        assert_eq!(answer.kind, SdpType::Answer);
        caller.accept_answer(&answer).await.unwrap();

        caller.add_remote_candidate(&callee_candidate).await.unwrap();
        callee.add_remote_candidate(&caller_candidate).await.unwrap();

        caller.close().await;
        callee.close().await;
        // Closing twice is harmless.
        caller.close().await;
    }

    #[tokio::test]
    async fn test_crossed_offers_settle_after_rollback() {
        let engine = Str0mEngine::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let kinds = [TrackKind::Audio];
        let (a_events, _a_rx) = engine_events(1);
        let (b_events, _b_rx) = engine_events(1);
        let mut a = engine.open(&kinds, a_events).await.unwrap();
        let mut b = engine.open(&kinds, b_events).await.unwrap();

        let _a_offer = a.create_offer().await.unwrap();
        let b_offer = b.create_offer().await.unwrap();

        a.rollback().await.unwrap();
        assert!(a.rollback().await.is_err());
        let answer = a.accept_offer(&b_offer).await.unwrap();
        b.accept_answer(&answer).await.unwrap();

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_stun_servers_add_no_candidates() {
        let engine = Str0mEngine::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .with_stun_urls(vec!["stun:stun.l.google.com:19302".into()]);
        let (events, mut rx) = engine_events(1);
        let mut conn = engine.open(&[TrackKind::Audio], events).await.unwrap();

        let candidate = first_candidate(&mut rx);
        assert!(candidate.candidate.contains("typ host"));
        assert!(candidate.candidate.contains("127.0.0.1"));
        while let Ok(input) = rx.try_recv() {
            assert!(!matches!(input, ActorInput::Peer { event: EngineEvent::LocalCandidate(_), .. }));
        }
        conn.close().await;
    }

    #[tokio::test]
    async fn test_garbage_sdp_is_rejected() {
        let engine = Str0mEngine::new(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let (events, _rx) = engine_events(1);
        let mut conn = engine.open(&[TrackKind::Audio], events).await.unwrap();

        let err = conn
            .accept_offer(&SessionDescription::offer("not sdp"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Sdp(_)));

        let err = conn
            .add_remote_candidate(&IceCandidate::new("nonsense"))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::Candidate(_)));
        conn.close().await;
    }

    #[test]
    fn test_bind_ip_from_config() {
        let cfg = MediaConfig {
            audio: true,
            video: false,
            bind_ip: "not-an-ip".into(),
            stun_urls: vec![],
        };
        assert!(Str0mEngine::from_config(&cfg).is_err());

        let cfg = MediaConfig { bind_ip: "127.0.0.1".into(), ..cfg };
        let engine = Str0mEngine::from_config(&cfg).unwrap();
        assert_eq!(engine.candidate_ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
}
