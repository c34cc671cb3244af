//! Local capture and display seams.

pub mod synthetic;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use synthetic::SyntheticMedia;

pub const LOCAL_SURFACE: &str = "local";
pub const REMOTE_SURFACE: &str = "remote";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("capture permission denied: {0}")]
    PermissionDenied(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// A captured track. The payload is whatever the capture backend produced;
/// the matching peer-connection adapter downcasts it.
#[derive(Clone)]
pub struct LocalTrack {
    pub info: TrackInfo,
    source: Arc<dyn Any + Send + Sync>,
}

impl LocalTrack {
    pub fn new(info: TrackInfo, source: Arc<dyn Any + Send + Sync>) -> Self {
        Self { info, source }
    }

    pub fn source<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.source.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack").field("info", &self.info).finish()
    }
}

/// Everything captured for one call. Must be handed back to
/// [`MediaDevices::release_media`].
#[derive(Debug)]
pub struct MediaHandle {
    pub stream_id: String,
    pub tracks: Vec<LocalTrack>,
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_local_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaHandle, MediaError>;

    async fn release_media(&self, handle: MediaHandle);
}

pub trait DisplaySurface: Send + Sync {
    fn attach(&self, surface: &str, track: &TrackInfo);
    fn detach(&self, surface: &str);
}

/// Display that only reports what would be rendered.
#[derive(Debug, Default)]
pub struct LogDisplay;

impl DisplaySurface for LogDisplay {
    fn attach(&self, surface: &str, track: &TrackInfo) {
        tracing::info!(
            target: "tandem::media",
            surface,
            track = %track.id,
            stream = %track.stream_id,
            kind = ?track.kind,
            "attached track to surface"
        );
    }

    fn detach(&self, surface: &str) {
        tracing::info!(target: "tandem::media", surface, "detached surface");
    }
}
