//! Scripted peer engine for unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use duet_signaling::{IceCandidate, SessionDescription};

use crate::engine::{EngineEvents, PeerConnection, PeerEngine};
use crate::error::NegotiationError;
use crate::events::EngineEvent;
use crate::media::TrackKind;

pub(crate) const LOCAL_CANDIDATE: &str = "candidate:1 1 udp 2130706431 127.0.0.1 50000 typ host";

#[derive(Default)]
struct Log {
    calls: Vec<String>,
    opened: usize,
    closed: usize,
    /// Event senders of every connection opened so far, oldest first.
    events: Vec<EngineEvents>,
}

/// Records every step; emits one local candidate per opened connection.
#[derive(Clone)]
pub(crate) struct FakeEngine {
    label: &'static str,
    log: Arc<Mutex<Log>>,
    fail_answer: Arc<AtomicBool>,
    fail_open: Arc<AtomicBool>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::named("fake")
    }
}

impl FakeEngine {
    /// Offers and answers carry `label`, so two engines produce different SDP.
    pub(crate) fn named(label: &'static str) -> Self {
        Self {
            label,
            log: Arc::default(),
            fail_answer: Arc::default(),
            fail_open: Arc::default(),
        }
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().calls.clone()
    }

    pub(crate) fn opened(&self) -> usize {
        self.log.lock().unwrap().opened
    }

    pub(crate) fn closed(&self) -> usize {
        self.log.lock().unwrap().closed
    }

    /// Events handle of the `n`th opened connection (zero-based).
    pub(crate) fn events(&self, n: usize) -> EngineEvents {
        self.log.lock().unwrap().events[n].clone()
    }

    pub(crate) fn fail_answers(&self, fail: bool) {
        self.fail_answer.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerEngine for FakeEngine {
    async fn open(
        &self,
        _tracks: &[TrackKind],
        events: EngineEvents,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(NegotiationError::Sdp("engine unavailable".into()));
        }
        events.emit(EngineEvent::LocalCandidate(IceCandidate::new(LOCAL_CANDIDATE)));
        {
            let mut log = self.log.lock().unwrap();
            log.opened += 1;
            log.events.push(events);
        }
        Ok(Box::new(FakeConnection {
            label: self.label,
            log: self.log.clone(),
            fail_answer: self.fail_answer.clone(),
            offered: false,
            closed: false,
        }))
    }
}

struct FakeConnection {
    label: &'static str,
    log: Arc<Mutex<Log>>,
    fail_answer: Arc<AtomicBool>,
    offered: bool,
    closed: bool,
}

impl FakeConnection {
    fn record(&self, call: impl Into<String>) {
        self.log.lock().unwrap().calls.push(call.into());
    }
}

#[async_trait]
impl PeerConnection for FakeConnection {
    async fn create_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        self.record("create_offer");
        self.offered = true;
        Ok(SessionDescription::offer(format!("{}-offer", self.label)))
    }

    async fn accept_offer(
        &mut self,
        _offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.record("accept_offer");
        Ok(SessionDescription::answer(format!("{}-answer", self.label)))
    }

    async fn accept_answer(&mut self, _answer: &SessionDescription) -> Result<(), NegotiationError> {
        if self.fail_answer.load(Ordering::SeqCst) {
            return Err(NegotiationError::Sdp("answer rejected".into()));
        }
        self.record("accept_answer");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), NegotiationError> {
        if !std::mem::take(&mut self.offered) {
            return Err(NegotiationError::Sdp("nothing to roll back".into()));
        }
        self.record("rollback");
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), NegotiationError> {
        self.record(format!("candidate {}", candidate.candidate));
        Ok(())
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.lock().unwrap().closed += 1;
        }
    }
}
