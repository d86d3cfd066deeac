//! In-process transport.
//!
//! [`pair`] returns a [`MemoryDialer`] for the client and a [`MemoryServer`]
//! that accepts each dialed link as a [`ServerEnd`]. Used to script a
//! coordinating service in tests and in the console's offline demo.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::SignalingError;
use crate::protocol::{Inbound, SignalingMessage};
use crate::transport::{Dialer, Link, LinkEvent};

/// Create a connected dialer/server pair.
pub fn pair() -> (MemoryDialer, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    (
        MemoryDialer { accept_tx, refuse: refuse.clone() },
        MemoryServer { accept_rx, refuse },
    )
}

#[derive(Clone)]
pub struct MemoryDialer {
    accept_tx: mpsc::UnboundedSender<ServerEnd>,
    refuse: Arc<AtomicBool>,
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self) -> Result<Link, SignalingError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(SignalingError::Dial("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(256);
        self.accept_tx
            .send(ServerEnd { from_client: out_rx, to_client: in_tx })
            .map_err(|_| SignalingError::Dial("server gone".into()))?;
        Ok(Link { outbound: out_tx, inbound: in_rx })
    }
}

pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<ServerEnd>,
    refuse: Arc<AtomicBool>,
}

impl MemoryServer {
    /// Wait for the next client link.
    pub async fn accept(&mut self) -> Option<ServerEnd> {
        self.accept_rx.recv().await
    }

    /// Make subsequent dials fail (or succeed again).
    pub fn set_refusing(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }
}

/// Server side of one memory link.
pub struct ServerEnd {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::Sender<LinkEvent>,
}

impl ServerEnd {
    /// Push a message to the client.
    pub async fn push(&self, msg: &SignalingMessage) {
        if let Ok(frame) = msg.encode() {
            self.push_raw(frame).await;
        }
    }

    /// Push an arbitrary frame, e.g. one the client cannot parse.
    pub async fn push_raw(&self, frame: impl Into<String>) {
        let _ = self.to_client.send(LinkEvent::Frame(frame.into())).await;
    }

    /// Next message from the client. `None` once the client dropped the link.
    ///
    /// Frames that do not decode are skipped.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        while let Some(frame) = self.from_client.recv().await {
            if let Inbound::Message(msg) = Inbound::decode(&frame) {
                return Some(msg);
            }
        }
        None
    }

    /// Non-blocking variant of [`recv`](Self::recv).
    pub fn try_recv(&mut self) -> Option<SignalingMessage> {
        while let Ok(frame) = self.from_client.try_recv() {
            if let Inbound::Message(msg) = Inbound::decode(&frame) {
                return Some(msg);
            }
        }
        None
    }

    /// Close the link from the server side.
    pub async fn close(self) {
        let _ = self.to_client.send(LinkEvent::Closed { reason: None }).await;
    }
}
