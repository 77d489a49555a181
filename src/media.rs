//! Local media acquisition.
//!
//! Capturing from a microphone or camera is platform specific; the
//! controller only needs something that hands out tracks for a
//! [`MediaKind`] and lets it stop them again.

use async_trait::async_trait;
use callcore::MediaKind;
use log::debug;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("permission denied: {0}")]
    Denied(String),

    #[error("device unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// A captured local track.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    /// Stop capturing. Called exactly once per call by [`LocalTracks`].
    fn stop(&self);
}

/// Tracks acquired for one call. Released exactly once, either explicitly
/// or on drop.
#[derive(Debug)]
pub struct LocalTracks {
    media: MediaKind,
    stream_id: String,
    tracks: Vec<Arc<dyn MediaTrack>>,
    released: AtomicBool,
}

impl LocalTracks {
    pub fn new(media: MediaKind, stream_id: impl Into<String>, tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        Self {
            media,
            stream_id: stream_id.into(),
            tracks,
            released: AtomicBool::new(false),
        }
    }

    pub fn media(&self) -> MediaKind {
        self.media
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Stop every track. Later calls are no-ops.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        debug!(target: "Call/Media", "released {} track(s) of stream {}", self.tracks.len(), self.stream_id);
    }
}

impl Drop for LocalTracks {
    fn drop(&mut self) {
        self.release();
    }
}

/// Obtains local tracks for a call.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, media: MediaKind) -> Result<LocalTracks, MediaError>;
}

#[derive(Debug)]
struct SilentTrack {
    id: String,
    kind: TrackKind,
}

impl MediaTrack for SilentTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {}
}

/// Hands out tracks that never produce samples. Enough to negotiate a call
/// without capture hardware, as the demo binary does.
#[derive(Debug, Default, Clone)]
pub struct SilentMediaSource;

#[async_trait]
impl MediaSource for SilentMediaSource {
    async fn acquire(&self, media: MediaKind) -> Result<LocalTracks, MediaError> {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = vec![Arc::new(SilentTrack {
            id: "audio".into(),
            kind: TrackKind::Audio,
        })];
        if media.has_video() {
            tracks.push(Arc::new(SilentTrack {
                id: "video".into(),
                kind: TrackKind::Video,
            }));
        }
        Ok(LocalTracks::new(media, "peercall", tracks))
    }
}
