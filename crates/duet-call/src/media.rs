//! Local media: capture device ownership and track handles.
//!
//! The capture device is exclusive. [`CaptureDevice::acquire`] hands out a
//! [`LocalMedia`] bundle holding a lease on the device; the lease is returned
//! when the bundle is stopped or dropped, and only then can the device be
//! acquired again.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::error::MediaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured track. `enabled = false` sends silence / black frames.
#[derive(Debug)]
pub struct LocalTrack {
    kind: TrackKind,
    enabled: bool,
    live: bool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self { kind, enabled: true, live: true }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    fn stop(&mut self) {
        self.live = false;
        self.enabled = false;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn kinds(&self) -> Vec<TrackKind> {
        let mut kinds = Vec::with_capacity(2);
        if self.audio {
            kinds.push(TrackKind::Audio);
        }
        if self.video {
            kinds.push(TrackKind::Video);
        }
        kinds
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self { audio: true, video: true }
    }
}

/// Exclusive claim on the capture device.
#[derive(Debug)]
pub struct DeviceLease {
    in_use: Arc<AtomicBool>,
    released: bool,
}

impl DeviceLease {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.in_use.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.release();
    }
}

/// The session's captured tracks plus the device lease backing them.
#[derive(Debug)]
pub struct LocalMedia {
    tracks: Vec<LocalTrack>,
    lease: DeviceLease,
}

impl LocalMedia {
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn kinds(&self) -> Vec<TrackKind> {
        self.tracks.iter().map(LocalTrack::kind).collect()
    }

    /// Flip `enabled` on every live track of `kind`.
    ///
    /// Returns whether any track of that kind is enabled afterwards, or `None`
    /// if there is no such track.
    pub fn toggle(&mut self, kind: TrackKind) -> Option<bool> {
        let mut found = false;
        for track in self.tracks.iter_mut().filter(|t| t.kind == kind && t.live) {
            track.enabled = !track.enabled;
            found = true;
        }
        found.then(|| self.is_enabled(kind))
    }

    /// Whether any live track of `kind` is enabled.
    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind && t.live && t.enabled)
    }

    /// Stop every track and release the device. Idempotent.
    pub fn stop(&mut self) {
        if self.lease.released {
            return;
        }
        for track in &mut self.tracks {
            track.stop();
        }
        self.lease.release();
        debug!(tracks = self.tracks.len(), "Local media stopped");
    }
}

/// Source of local media.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError>;
}

/// The local capture device.
///
/// Produces track handles only; frames are the renderer's concern.
#[derive(Debug, Clone)]
pub struct CaptureDevice {
    in_use: Arc<AtomicBool>,
    permitted: Arc<AtomicBool>,
}

impl CaptureDevice {
    pub fn new() -> Self {
        Self {
            in_use: Arc::new(AtomicBool::new(false)),
            permitted: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Grant or revoke capture permission.
    pub fn set_permitted(&self, permitted: bool) {
        self.permitted.store(permitted, Ordering::SeqCst);
    }

    /// Whether some [`LocalMedia`] currently holds the device.
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl Default for CaptureDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for CaptureDevice {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMedia, MediaError> {
        let kinds = constraints.kinds();
        if kinds.is_empty() {
            return Err(MediaError::NothingRequested);
        }
        if !self.permitted.load(Ordering::SeqCst) {
            return Err(MediaError::Denied);
        }
        if self.in_use.swap(true, Ordering::SeqCst) {
            return Err(MediaError::Busy);
        }
        let tracks = kinds.into_iter().map(LocalTrack::new).collect();
        Ok(LocalMedia {
            tracks,
            lease: DeviceLease { in_use: self.in_use.clone(), released: false },
        })
    }
}
