//! Local media acquisition and rendering.
//!
//! Camera and microphone mechanics live behind [`CaptureBackend`]; the call
//! only needs to pick a front-facing camera, start it, and stop it again
//! during teardown. Rendering goes through [`RenderSink`].

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;

use super::{MediaStream, MediaTrack};
use crate::calls::CallError;

/// Id of the local media stream.
pub const LOCAL_STREAM_ID: &str = "ls";
pub const LOCAL_AUDIO_TRACK_ID: &str = "a0";
pub const LOCAL_VIDEO_TRACK_ID: &str = "v0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    Front,
    Back,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureDeviceInfo {
    pub name: String,
    pub facing: Facing,
}

impl CaptureDeviceInfo {
    pub fn new(name: impl Into<String>, facing: Facing) -> Self {
        Self {
            name: name.into(),
            facing,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            width: 480,
            height: 360,
            fps: 30,
        }
    }
}

/// An opened capture device.
#[async_trait]
pub trait CaptureSource: Send + Sync {
    fn device(&self) -> &CaptureDeviceInfo;

    async fn start(&self, format: CaptureFormat) -> Result<(), anyhow::Error>;

    /// Stop capturing and release the device. Calling it again is a no-op.
    async fn stop(&self);
}

/// Platform capture layer.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn devices(&self) -> Vec<CaptureDeviceInfo>;

    /// Open a device. `Ok(None)` means the device exists but could not be opened.
    async fn open(
        &self,
        device: &CaptureDeviceInfo,
    ) -> Result<Option<Arc<dyn CaptureSource>>, anyhow::Error>;
}

/// Somewhere to display a media stream.
pub trait RenderSink: Send + Sync {
    fn attach(&self, stream: &MediaStream);

    fn release(&self);
}

/// Backend for hosts without cameras.
#[derive(Debug, Default, Clone)]
pub struct NoCaptureBackend;

#[async_trait]
impl CaptureBackend for NoCaptureBackend {
    fn devices(&self) -> Vec<CaptureDeviceInfo> {
        Vec::new()
    }

    async fn open(
        &self,
        _device: &CaptureDeviceInfo,
    ) -> Result<Option<Arc<dyn CaptureSource>>, anyhow::Error> {
        Ok(None)
    }
}

/// Open the first front-facing device that opens successfully.
pub async fn open_front_camera(
    backend: &dyn CaptureBackend,
) -> Result<Arc<dyn CaptureSource>, CallError> {
    for device in backend
        .devices()
        .into_iter()
        .filter(|d| d.facing == Facing::Front)
    {
        match backend.open(&device).await {
            Ok(Some(source)) => {
                info!("Using front camera {}", device.name);
                return Ok(source);
            }
            Ok(None) => debug!("Front camera {} could not be opened", device.name),
            Err(e) => warn!("Failed to open front camera {}: {e:?}", device.name),
        }
    }
    Err(CallError::NoCaptureSource)
}

/// The local media of one call: the outgoing stream and the camera feeding it.
pub struct LocalMedia {
    stream: MediaStream,
    capture: Option<Arc<dyn CaptureSource>>,
}

impl LocalMedia {
    /// Build the local stream. With video, a front camera is opened and
    /// started first; without one this fails with [`CallError::NoCaptureSource`].
    pub async fn acquire(
        backend: &dyn CaptureBackend,
        video_enabled: bool,
    ) -> Result<Self, CallError> {
        let mut stream = MediaStream::new(LOCAL_STREAM_ID);
        let mut capture = None;

        if video_enabled {
            let source = open_front_camera(backend).await?;
            if let Err(e) = source.start(CaptureFormat::default()).await {
                source.stop().await;
                return Err(CallError::Capture(e.to_string()));
            }
            stream.add_track(MediaTrack::video(LOCAL_VIDEO_TRACK_ID));
            capture = Some(source);
        }
        stream.add_track(MediaTrack::audio(LOCAL_AUDIO_TRACK_ID));

        Ok(Self { stream, capture })
    }

    pub fn stream(&self) -> &MediaStream {
        &self.stream
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.is_some()
    }

    /// Stop and release the camera, if any. Safe to call repeatedly.
    pub async fn release_capture(&mut self) {
        if let Some(source) = self.capture.take() {
            source.stop().await;
            debug!("Released capture device {}", source.device().name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{EventLog, FakeCaptureBackend};

    #[tokio::test]
    async fn test_audio_only_needs_no_camera() {
        let media = LocalMedia::acquire(&NoCaptureBackend, false).await.unwrap();
        assert!(!media.is_capturing());
        assert_eq!(media.stream().id, LOCAL_STREAM_ID);
        assert_eq!(media.stream().tracks(), &[MediaTrack::audio("a0")]);
    }

    #[tokio::test]
    async fn test_video_without_camera_fails() {
        let result = LocalMedia::acquire(&NoCaptureBackend, true).await;
        assert!(matches!(result, Err(CallError::NoCaptureSource)));
    }

    #[tokio::test]
    async fn test_only_front_cameras_are_considered() {
        let log = EventLog::default();
        let backend = FakeCaptureBackend::new(
            log.clone(),
            vec![CaptureDeviceInfo::new("rear", Facing::Back)],
        );
        assert!(matches!(
            open_front_camera(&backend).await,
            Err(CallError::NoCaptureSource)
        ));
        assert!(log.entries().is_empty());
    }

    #[tokio::test]
    async fn test_video_starts_front_camera_and_releases_once() {
        let log = EventLog::default();
        let backend = FakeCaptureBackend::new(
            log.clone(),
            vec![
                CaptureDeviceInfo::new("rear", Facing::Back),
                CaptureDeviceInfo::new("selfie", Facing::Front),
            ],
        );

        let mut media = LocalMedia::acquire(&backend, true).await.unwrap();
        assert!(media.is_capturing());
        assert!(media.stream().has_video());
        assert!(media.stream().has_audio());

        media.release_capture().await;
        media.release_capture().await;
        assert_eq!(
            log.entries(),
            vec!["capture.start:selfie 480x360@30", "capture.stop:selfie"]
        );
    }
}
