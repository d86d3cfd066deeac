//! Outbound half of the signaling channel.
//!
//! `send` never blocks and never fails loudly: if no link is attached the
//! message is logged and dropped. Callers are expected to be driven by
//! idempotent server-pushed state, so a dropped `join_queue` is recovered the
//! next time the user acts.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::SignalingMessage;

struct AttachedLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<String>,
}

/// Cloneable send handle shared by the session actor and the supervisor.
#[derive(Clone, Default)]
pub struct SignalingChannel {
    link: Arc<Mutex<Option<AttachedLink>>>,
}

impl SignalingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route sends to a freshly opened link.
    pub fn attach(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) {
        if let Ok(mut slot) = self.link.lock() {
            *slot = Some(AttachedLink { generation, outbound });
        }
    }

    /// Stop routing sends to `generation`. A no-op if a newer link is attached.
    pub fn detach(&self, generation: u64) {
        if let Ok(mut slot) = self.link.lock() {
            if slot.as_ref().is_some_and(|l| l.generation == generation) {
                *slot = None;
            }
        }
    }

    /// Whether a link is attached and its writer is still alive.
    pub fn is_open(&self) -> bool {
        self.link
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|l| !l.outbound.is_closed()))
            .unwrap_or(false)
    }

    /// Enqueue a message for transmission. Returns whether it was enqueued.
    pub fn send(&self, msg: &SignalingMessage) -> bool {
        let frame = match msg.encode() {
            Ok(f) => f,
            Err(e) => {
                warn!(tag = msg.tag(), error = %e, "Failed to encode signaling message");
                return false;
            }
        };

        let Ok(slot) = self.link.lock() else {
            return false;
        };
        if let Some(link) = slot.as_ref() {
            if link.outbound.send(frame).is_ok() {
                debug!(tag = msg.tag(), generation = link.generation, "Signaling message queued");
                return true;
            }
        }
        warn!(tag = msg.tag(), "Signaling channel not open, dropping message");
        false
    }
}
