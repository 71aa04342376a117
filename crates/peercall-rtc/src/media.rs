//! Local capture and remote playback collaborators.
//!
//! The engine never touches devices or output surfaces directly: capture goes
//! through a [`MediaSource`], and tracks are shown through a [`MediaSink`]
//! supplied by the UI layer.

use async_trait::async_trait;
use peercall_common::MediaAcquisitionError;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

/// Which devices the user currently wants on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }
}

/// Captured local tracks. Must be handed back to [`MediaSource::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle {
    pub id: Uuid,
    pub tracks: Vec<MediaTrack>,
}

impl MediaHandle {
    /// A handle that holds no tracks (both toggles off, or capture failed).
    pub fn empty() -> Self {
        Self {
            id: Uuid::nil(),
            tracks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn has(&self, kind: MediaKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints)
        -> Result<MediaHandle, MediaAcquisitionError>;

    fn release(&self, handle: MediaHandle);
}

/// Result of [`acquire_with_fallback`]: whatever could be captured, plus the
/// error that kept the rest from being captured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquiredMedia {
    pub handle: MediaHandle,
    pub error: Option<MediaAcquisitionError>,
}

/// Capture what `constraints` asks for, degrading instead of failing.
///
/// Nothing is requested when both toggles are off. If audio+video is refused,
/// audio alone is tried before giving up on capture entirely.
pub async fn acquire_with_fallback(
    source: &dyn MediaSource,
    constraints: MediaConstraints,
) -> AcquiredMedia {
    if constraints.is_empty() {
        return AcquiredMedia {
            handle: MediaHandle::empty(),
            error: None,
        };
    }

    let error = match source.acquire(constraints).await {
        Ok(handle) => return AcquiredMedia { handle, error: None },
        Err(e) => e,
    };

    if constraints.audio && constraints.video {
        let audio_only = MediaConstraints {
            audio: true,
            video: false,
        };
        if let Ok(handle) = source.acquire(audio_only).await {
            return AcquiredMedia {
                handle,
                error: Some(error),
            };
        }
    }

    AcquiredMedia {
        handle: MediaHandle::empty(),
        error: Some(error),
    }
}

/// Where the UI shows local preview and remote tracks.
pub trait MediaSink: Send + Sync {
    fn show_local(&self, handle: &MediaHandle);

    fn clear_local(&self);

    fn attach_remote(&self, track: &MediaTrack);

    fn detach_remote(&self);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl MediaSink for NullSink {
    fn show_local(&self, _handle: &MediaHandle) {}

    fn clear_local(&self) {}

    fn attach_remote(&self, _track: &MediaTrack) {}

    fn detach_remote(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SyntheticMediaSource;

    #[tokio::test]
    async fn nothing_requested_touches_no_device() {
        let source = SyntheticMediaSource::new();
        let got = acquire_with_fallback(&source, MediaConstraints::default()).await;
        assert!(got.handle.is_empty());
        assert!(got.error.is_none());
        assert_eq!(source.acquired(), 0);
    }

    #[tokio::test]
    async fn denied_camera_falls_back_to_audio() {
        let source = SyntheticMediaSource::new();
        source.deny(MediaKind::Video, true);

        let got = acquire_with_fallback(
            &source,
            MediaConstraints {
                audio: true,
                video: true,
            },
        )
        .await;

        assert!(got.handle.has(MediaKind::Audio));
        assert!(!got.handle.has(MediaKind::Video));
        assert!(matches!(
            got.error,
            Some(MediaAcquisitionError::PermissionDenied { .. })
        ));
    }

    #[tokio::test]
    async fn everything_denied_yields_empty_handle() {
        let source = SyntheticMediaSource::new();
        source.deny(MediaKind::Audio, true);

        let got = acquire_with_fallback(
            &source,
            MediaConstraints {
                audio: true,
                video: false,
            },
        )
        .await;

        assert!(got.handle.is_empty());
        assert!(got.error.is_some());
    }
}
