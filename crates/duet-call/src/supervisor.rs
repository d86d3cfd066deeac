//! Reconnection Supervisor.
//!
//! Keeps exactly one transport attached to the [`SignalingChannel`]. Every
//! attempt makes sure a credential exists, dials, and then pumps inbound
//! frames into the actor queue tagged with the link's generation. When the
//! link drops (or the dial fails) it waits the fixed delay and tries again,
//! forever, until shut down by logout.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use duet_common::Credentials;
use duet_signaling::{Dialer, LinkEvent, SignalingChannel};

use crate::events::{Input, LinkInput};

pub struct ReconnectSupervisor {
    dialer: Arc<dyn Dialer>,
    credentials: Credentials,
    channel: SignalingChannel,
    inputs: mpsc::UnboundedSender<Input>,
    delay: Duration,
    shutdown: CancellationToken,
}

/// Why one connection attempt ended.
enum Outcome {
    /// The link was up and then closed.
    Dropped,
    /// We never got a link.
    Failed,
    /// Shutdown requested or nobody is listening any more.
    Stop,
}

impl ReconnectSupervisor {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        credentials: Credentials,
        channel: SignalingChannel,
        inputs: mpsc::UnboundedSender<Input>,
        delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self { dialer, credentials, channel, inputs, delay, shutdown }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut generation = 0u64;
        loop {
            generation += 1;
            match self.connect_once(generation).await {
                Outcome::Stop => break,
                Outcome::Dropped => {
                    warn!(delay_ms = self.delay.as_millis() as u64, "Signaling connection lost, reconnecting");
                }
                Outcome::Failed => {
                    warn!(delay_ms = self.delay.as_millis() as u64, "Signaling connection failed, retrying");
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        debug!("Reconnection supervisor stopped");
    }

    async fn connect_once(&self, generation: u64) -> Outcome {
        if self.shutdown.is_cancelled() {
            return Outcome::Stop;
        }

        if let Err(e) = self.credentials.ensure().await {
            warn!(error = %e, "Could not obtain a session token");
            return Outcome::Failed;
        }

        let dialed = tokio::select! {
            _ = self.shutdown.cancelled() => return Outcome::Stop,
            dialed = self.dialer.dial() => dialed,
        };
        let mut link = match dialed {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "Signaling dial failed");
                return Outcome::Failed;
            }
        };

        self.channel.attach(generation, link.outbound.clone());
        info!(generation, "Signaling transport established");
        if !self.forward(generation, LinkInput::Opened) {
            self.channel.detach(generation);
            return Outcome::Stop;
        }

        let outcome = loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break Outcome::Stop,
                event = link.inbound.recv() => event,
            };
            match event {
                Some(LinkEvent::Frame(frame)) => {
                    if !self.forward(generation, LinkInput::Frame(frame)) {
                        break Outcome::Stop;
                    }
                }
                Some(LinkEvent::Closed { reason }) => {
                    debug!(generation, reason = ?reason, "Signaling transport closed");
                    break Outcome::Dropped;
                }
                None => break Outcome::Dropped,
            }
        };

        self.channel.detach(generation);
        if matches!(outcome, Outcome::Dropped) && !self.forward(generation, LinkInput::Closed) {
            return Outcome::Stop;
        }
        outcome
    }

    fn forward(&self, generation: u64, event: LinkInput) -> bool {
        self.inputs.send(Input::Link { generation, event }).is_ok()
    }
}
