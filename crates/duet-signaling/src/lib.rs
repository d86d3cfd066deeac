//! # duet-signaling
//!
//! Client side of the coordinating service protocol:
//! - JSON wire messages discriminated by a `type` field
//! - Tolerant frame decoding (unknown tags are reported, never fatal)
//! - A non-blocking send handle that drops messages while no link is open
//! - Pluggable transports: WebSocket for production, in-memory for tests and demos
//!
//! Reconnection policy lives one layer up, in `duet-call`'s supervisor. This
//! crate only knows how to open one link and report when it closes.

pub mod channel;
pub mod error;
pub mod memory;
pub mod protocol;
pub mod transport;

pub use channel::SignalingChannel;
pub use error::SignalingError;
pub use protocol::{IceCandidate, Inbound, Role, SdpType, SessionDescription, SignalingMessage};
pub use transport::{Dialer, Link, LinkEvent, WsDialer};
