//! Transports that carry signaling frames.
//!
//! A [`Dialer`] opens one [`Link`]. A link is a pair of queues: text frames
//! out, [`LinkEvent`]s in. Inbound events arrive in network order from a
//! single reader task, so consumers never see two frames concurrently.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::error::SignalingError;

/// Something that happened on an open link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// One text frame, undecoded.
    Frame(String),
    /// The link is gone. No further events follow.
    Closed { reason: Option<String> },
}

/// One open transport.
pub struct Link {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Opens links to the coordinating service.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> Result<Link, SignalingError>;
}

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// WebSocket transport.
#[derive(Debug, Clone)]
pub struct WsDialer {
    url: String,
    connect_timeout: Duration,
}

impl WsDialer {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), connect_timeout: DEFAULT_CONNECT_TIMEOUT }
    }

    /// Bound on TCP connect plus the WebSocket handshake.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self) -> Result<Link, SignalingError> {
        let (ws, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| SignalingError::Timeout(self.connect_timeout))??;
        let (mut sink, mut stream) = ws.split();
        info!(url = %self.url, "Signaling WebSocket connected");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::channel::<LinkEvent>(256);

        // Writer: drains outbound frames until the sender side is dropped.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    warn!(error = %e, "Signaling write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: one task, so frames are delivered strictly in arrival order.
        tokio::spawn(async move {
            let reason = loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(LinkEvent::Frame(text.as_str().to_owned())).await.is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|f| f.reason.as_str().to_owned());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Some(e.to_string()),
                    None => break None,
                }
            };
            debug!(reason = ?reason, "Signaling WebSocket closed");
            writer.abort();
            let _ = in_tx.send(LinkEvent::Closed { reason }).await;
        });

        Ok(Link { outbound: out_tx, inbound: in_rx })
    }
}
