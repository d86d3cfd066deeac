//! Cancellable one-shot timers that post back into the actor queue.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::events::{Input, TimerKind};

pub struct Timers {
    tx: mpsc::UnboundedSender<Input>,
    pending: HashMap<TimerKind, JoinHandle<()>>,
}

impl Timers {
    pub fn new(tx: mpsc::UnboundedSender<Input>) -> Self {
        Self { tx, pending: HashMap::new() }
    }

    /// Arm `kind` for `epoch`, replacing any earlier timer of the same kind.
    pub fn schedule(&mut self, kind: TimerKind, delay: Duration, epoch: u64) {
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Input::Timer { kind, epoch });
        });
        if let Some(old) = self.pending.insert(kind, handle) {
            old.abort();
        }
        debug!(?kind, ?delay, epoch, "Timer armed");
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.pending.drain() {
            handle.abort();
        }
    }

    /// Mark `kind` as delivered.
    pub fn fired(&mut self, kind: TimerKind) {
        self.pending.remove(&kind);
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.pending.get(&kind).is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
