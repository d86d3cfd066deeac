//! Offline demo: an in-process coordinator plus a partner that always queues.
//!
//! The coordinator speaks the real protocol over memory links. It pairs the
//! first two queued sessions, relays negotiation messages between them, and
//! tells the other side when one hangs up or disappears.

use std::collections::HashMap;
use std::sync::Arc;

use duet_call::{CallClient, CallConfig, CallDeps, CaptureDevice, PeerEngine, SessionState};
use duet_common::Credentials;
use duet_common::credentials::{LocalGenerator, MemoryStore};
use duet_signaling::memory::{self, MemoryDialer, MemoryServer, ServerEnd};
use duet_signaling::{Role, SignalingMessage};
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct Demo {
    /// Dialer for the user's session.
    pub dialer: MemoryDialer,
    pub partner: CallClient,
}

impl Demo {
    pub fn start(config: CallConfig, engine: Arc<dyn PeerEngine>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let (user_dialer, user_server) = memory::pair();
        let (partner_dialer, partner_server) = memory::pair();
        tokio::spawn(accept_loop(user_server, events_tx.clone()));
        tokio::spawn(accept_loop(partner_server, events_tx));
        tokio::spawn(Coordinator::default().run(events_rx));

        let partner = CallClient::start(
            config,
            CallDeps {
                dialer: Arc::new(partner_dialer),
                credentials: Credentials::new(Arc::new(MemoryStore::new()), Arc::new(LocalGenerator)),
                engine,
                media: Arc::new(CaptureDevice::new()),
            },
        );
        tokio::spawn(auto_join(partner.handle()));

        Self { dialer: user_dialer, partner }
    }
}

/// Rejoin the queue whenever the partner is idle.
async fn auto_join(handle: duet_call::SessionHandle) {
    let mut status = handle.watch();
    loop {
        let current = status.borrow_and_update().clone();
        if current.state == SessionState::Connected {
            debug!("Demo partner joining the queue");
            handle.join_queue();
        }
        if current.state == SessionState::Ended || status.changed().await.is_err() {
            break;
        }
    }
}

type LinkId = u64;

enum CoordinatorEvent {
    Joined(LinkId, mpsc::UnboundedSender<SignalingMessage>),
    Message(LinkId, SignalingMessage),
    Left(LinkId),
}

/// Turn every accepted memory link into coordinator events.
async fn accept_loop(mut server: MemoryServer, events: mpsc::UnboundedSender<CoordinatorEvent>) {
    static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
    while let Some(end) = server.accept().await {
        let id = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        tokio::spawn(pump(id, end, events.clone()));
    }
}

async fn pump(id: LinkId, mut end: ServerEnd, events: mpsc::UnboundedSender<CoordinatorEvent>) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    if events.send(CoordinatorEvent::Joined(id, out_tx)).is_err() {
        return;
    }
    loop {
        tokio::select! {
            msg = end.recv() => match msg {
                Some(msg) => {
                    if events.send(CoordinatorEvent::Message(id, msg)).is_err() {
                        break;
                    }
                }
                None => break,
            },
            outgoing = out_rx.recv() => match outgoing {
                Some(msg) => end.push(&msg).await,
                None => break,
            },
        }
    }
    let _ = events.send(CoordinatorEvent::Left(id));
}

#[derive(Default)]
struct Coordinator {
    links: HashMap<LinkId, mpsc::UnboundedSender<SignalingMessage>>,
    queue: Vec<LinkId>,
    /// Both directions of every active pairing.
    partners: HashMap<LinkId, LinkId>,
    calls: u64,
}

impl Coordinator {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<CoordinatorEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                CoordinatorEvent::Joined(id, tx) => {
                    self.links.insert(id, tx);
                }
                CoordinatorEvent::Message(id, msg) => self.on_message(id, msg),
                CoordinatorEvent::Left(id) => {
                    self.links.remove(&id);
                    self.queue.retain(|q| *q != id);
                    if let Some(other) = self.unpair(id) {
                        self.send(other, SignalingMessage::PartnerDisconnected {
                            message: Some("Your partner disconnected".into()),
                        });
                    }
                }
            }
        }
    }

    fn send(&self, id: LinkId, msg: SignalingMessage) {
        if let Some(tx) = self.links.get(&id) {
            let _ = tx.send(msg);
        }
    }

    fn unpair(&mut self, id: LinkId) -> Option<LinkId> {
        let other = self.partners.remove(&id)?;
        self.partners.remove(&other);
        Some(other)
    }

    fn on_message(&mut self, id: LinkId, msg: SignalingMessage) {
        match msg {
            SignalingMessage::Authenticate { .. } => self.send(id, SignalingMessage::Authenticated {
                message: Some("Welcome to the Duet demo".into()),
                user_id: Some(format!("demo-{id}")),
            }),
            SignalingMessage::JoinQueue => {
                if !self.queue.contains(&id) && !self.partners.contains_key(&id) {
                    self.queue.push(id);
                }
                self.announce_queue();
                self.try_match();
            }
            SignalingMessage::LeaveQueue => {
                self.queue.retain(|q| *q != id);
                self.announce_queue();
            }
            SignalingMessage::EndCall => {
                if let Some(other) = self.unpair(id) {
                    self.send(other, SignalingMessage::CallEnded {
                        message: Some("Your partner ended the call".into()),
                    });
                }
            }
            relay @ (SignalingMessage::WebrtcOffer { .. }
            | SignalingMessage::WebrtcAnswer { .. }
            | SignalingMessage::WebrtcIce { .. }) => {
                if let Some(other) = self.partners.get(&id).copied() {
                    self.send(other, relay);
                }
            }
            other => debug!(tag = other.tag(), "Demo coordinator ignoring message"),
        }
    }

    fn announce_queue(&self) {
        for (index, id) in self.queue.iter().enumerate() {
            self.send(*id, SignalingMessage::Queued {
                position: index as u32 + 1,
                message: Some("Looking for someone to talk to".into()),
            });
        }
    }

    fn try_match(&mut self) {
        while self.queue.len() >= 2 {
            let caller = self.queue.remove(0);
            let callee = self.queue.remove(0);
            self.calls += 1;
            let call_id = format!("demo-call-{}", self.calls);
            info!(%call_id, caller, callee, "Demo coordinator paired sessions");

            self.partners.insert(caller, callee);
            self.partners.insert(callee, caller);
            for (me, other, role) in [(caller, callee, Role::Caller), (callee, caller, Role::Callee)] {
                self.send(me, SignalingMessage::MatchFound {
                    call_id: call_id.clone(),
                    partner_id: format!("demo-{other}"),
                    message: Some("Match found!".into()),
                    role: Some(role),
                });
            }
        }
    }
}
