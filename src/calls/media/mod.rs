//! Media transport seam for calls.
//!
//! The call session never talks to a peer-connection engine directly. It
//! drives a [`PeerTransport`] created by a [`PeerTransportFactory`] and
//! receives the engine's callbacks as [`PeerEvent`]s on a channel.
//!
//! # Architecture
//!
//! - [`PeerTransport`]: description exchange, candidates, local media, data channel
//! - [`PeerTransportFactory`]: creates one transport session per call
//! - [`capture`]: capture devices, local media and render sinks
//! - [`webrtc`]: the webrtc-rs implementation of the seam

pub mod capture;
pub mod webrtc;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::transport::{IceCandidate, SdpType, SessionDescription};
use crate::config::IceServer;

pub use capture::{
    CaptureBackend, CaptureDeviceInfo, CaptureFormat, CaptureSource, Facing, LocalMedia,
    NoCaptureBackend, RenderSink, open_front_camera,
};
pub use self::webrtc::{WebRtcError, WebRtcPeer, WebRtcTransportFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// A single audio or video track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaTrack {
    pub id: String,
    pub kind: TrackKind,
}

impl MediaTrack {
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Audio,
        }
    }

    pub fn video(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TrackKind::Video,
        }
    }
}

/// A group of tracks sharing a stream id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MediaStream {
    pub id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: MediaTrack) -> Self {
        self.add_track(track);
        self
    }

    /// Adds a track unless one with the same id is already present.
    pub fn add_track(&mut self, track: MediaTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Folds the tracks of `other` into this stream. Returns how many were new.
    pub fn merge(&mut self, other: MediaStream) -> usize {
        other
            .tracks
            .into_iter()
            .map(|t| self.add_track(t))
            .filter(|added| *added)
            .count()
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }

    pub fn has_audio(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Audio)
    }
}

/// Aggregate connection state reported by the transport engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Callbacks from the transport engine, delivered in order on the session's event channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate was gathered and should be trickled to the peer.
    LocalCandidate(IceCandidate),
    /// The remote end announced media in its description, or media arrived.
    /// The same stream may be reported more than once.
    RemoteStreamAdded(MediaStream),
    /// The negotiated data channel is open.
    DataChannelOpen,
    /// A text message arrived on the data channel.
    DataMessage(String),
    ConnectionStateChanged(PeerConnectionState),
}

/// One transport session, driven by the call state machine.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Create (but do not apply) a local offer or answer.
    async fn create_local_description(
        &self,
        sdp_type: SdpType,
    ) -> Result<SessionDescription, anyhow::Error>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error>;

    /// Apply a remote candidate. Implementations hold candidates that arrive
    /// before a remote description until one is applied.
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error>;

    /// Attach the local media stream. Called once, before any description is created.
    async fn add_local_stream(&self, stream: &MediaStream) -> Result<(), anyhow::Error>;

    /// Send a text message on the data channel.
    async fn send_data(&self, text: &str) -> Result<(), anyhow::Error>;

    /// Release all engine resources. Calling it again is a no-op.
    async fn close(&self);
}

/// Creates transport sessions.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create_session(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), anyhow::Error>;
}
