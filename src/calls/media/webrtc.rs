//! WebRTC peer transport built on webrtc-rs.
//!
//! One [`WebRtcPeer`] wraps one `RTCPeerConnection` together with the
//! pre-negotiated data channel both ends create (`dc1`, id 1), so neither
//! side has to announce it in-band.
//!
//! Remote candidates that arrive before a remote description is applied are
//! held here and added right after `set_remote_description` succeeds.
//!
//! Remote streams are announced as soon as the remote description names them
//! (`a=msid` lines on a section the peer sends on). `on_track` only fires once
//! RTP flows, and it reports the same stream again.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, mpsc};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{
    MediaStream, MediaTrack, PeerConnectionState, PeerEvent, PeerTransport, PeerTransportFactory,
    TrackKind,
};
use crate::calls::transport::{IceCandidate, SdpType, SessionDescription};
use crate::config::IceServer;

/// Label of the negotiated data channel.
pub const DATA_CHANNEL_LABEL: &str = "dc1";

/// Stream id of the negotiated data channel.
pub const DATA_CHANNEL_ID: u16 = 1;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Creates [`WebRtcPeer`] sessions.
#[derive(Debug, Default, Clone)]
pub struct WebRtcTransportFactory;

impl WebRtcTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create_session(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        let (peer, events) = WebRtcPeer::connect(ice_servers).await?;
        let transport: Arc<dyn PeerTransport> = peer;
        Ok((transport, events))
    }
}

#[derive(Default)]
struct CandidateQueue {
    remote_description_set: bool,
    pending: Vec<RTCIceCandidateInit>,
}

/// A peer connection plus its negotiated data channel.
pub struct WebRtcPeer {
    peer_connection: Arc<RTCPeerConnection>,
    data_channel: Arc<RTCDataChannel>,
    candidates: Mutex<CandidateQueue>,
    local_tracks: Mutex<Vec<Arc<TrackLocalStaticSample>>>,
    events: mpsc::Sender<PeerEvent>,
    closed: AtomicBool,
}

impl WebRtcPeer {
    /// Create the peer connection and data channel, and wire engine
    /// callbacks to the returned event channel.
    pub async fn connect(
        ice_servers: &[IceServer],
    ) -> Result<(Arc<Self>, mpsc::Receiver<PeerEvent>), WebRtcError> {
        let api = create_api()?;

        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(to_rtc_ice_server).collect(),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await?);

        let data_channel = peer_connection
            .create_data_channel(
                DATA_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    negotiated: Some(DATA_CHANNEL_ID),
                    ..Default::default()
                }),
            )
            .await?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        install_peer_handlers(&peer_connection, event_tx.clone());
        install_data_channel_handlers(&data_channel, event_tx.clone());

        info!(
            "Created peer connection with {} ICE server(s)",
            ice_servers.len()
        );

        let peer = Arc::new(Self {
            peer_connection,
            data_channel,
            candidates: Mutex::new(CandidateQueue::default()),
            local_tracks: Mutex::new(Vec::new()),
            events: event_tx,
            closed: AtomicBool::new(false),
        });
        Ok((peer, event_rx))
    }

    /// Local tracks to feed samples into, in the order they were attached.
    pub async fn local_tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.local_tracks.lock().await.clone()
    }

    /// Number of remote candidates waiting for a remote description.
    pub async fn pending_candidates(&self) -> usize {
        self.candidates.lock().await.pending.len()
    }
}

#[async_trait]
impl PeerTransport for WebRtcPeer {
    async fn create_local_description(
        &self,
        sdp_type: SdpType,
    ) -> Result<SessionDescription, anyhow::Error> {
        let description = match sdp_type {
            SdpType::Offer => self.peer_connection.create_offer(None).await?,
            SdpType::Answer => self.peer_connection.create_answer(None).await?,
        };
        Ok(from_rtc_description(description)?)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_local_description(description)
            .await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        let announced = remote_streams(&description.sdp);
        let description = to_rtc_description(description)?;
        self.peer_connection
            .set_remote_description(description)
            .await?;

        {
            let mut queue = self.candidates.lock().await;
            queue.remote_description_set = true;
            let pending = std::mem::take(&mut queue.pending);
            if !pending.is_empty() {
                debug!("Applying {} queued remote candidate(s)", pending.len());
            }
            for candidate in pending {
                if let Err(e) = self.peer_connection.add_ice_candidate(candidate).await {
                    warn!("Failed to apply queued remote candidate: {e}");
                }
            }
        }

        for stream in announced {
            info!(
                "Remote stream {} announced with {} track(s)",
                stream.id,
                stream.tracks().len()
            );
            if self
                .events
                .send(PeerEvent::RemoteStreamAdded(stream))
                .await
                .is_err()
            {
                debug!("Event receiver dropped before remote stream was reported");
            }
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        let init = to_rtc_candidate(candidate);
        let mut queue = self.candidates.lock().await;
        if !queue.remote_description_set {
            queue.pending.push(init);
            return Ok(());
        }
        self.peer_connection.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_local_stream(&self, stream: &MediaStream) -> Result<(), anyhow::Error> {
        let mut local_tracks = self.local_tracks.lock().await;
        for track in stream.tracks() {
            let mime_type = match track.kind {
                TrackKind::Audio => MIME_TYPE_OPUS,
                TrackKind::Video => MIME_TYPE_VP8,
            };
            let local = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: mime_type.to_owned(),
                    ..Default::default()
                },
                track.id.clone(),
                stream.id.clone(),
            ));
            self.peer_connection
                .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            debug!("Added local {} track {}", track.kind, track.id);
            local_tracks.push(local);
        }
        Ok(())
    }

    async fn send_data(&self, text: &str) -> Result<(), anyhow::Error> {
        if self.data_channel.ready_state() != RTCDataChannelState::Open {
            return Err(WebRtcError::NotConnected.into());
        }
        self.data_channel.send_text(text.to_owned()).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.data_channel.close().await {
            debug!("Data channel close: {e}");
        }
        if let Err(e) = self.peer_connection.close().await {
            warn!("Failed to close peer connection: {e}");
        }
        self.local_tracks.lock().await.clear();
        self.candidates.lock().await.pending.clear();
        info!("WebRTC transport closed");
    }
}

/// Create the WebRTC API with default codecs and interceptors.
fn create_api() -> Result<webrtc::api::API, WebRtcError> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn install_peer_handlers(peer_connection: &RTCPeerConnection, events: mpsc::Sender<PeerEvent>) {
    let candidate_tx = events.clone();
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = candidate_tx.clone();
        Box::pin(async move {
            // None marks the end of gathering.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx
                        .send(PeerEvent::LocalCandidate(from_rtc_candidate(init)))
                        .await;
                }
                Err(e) => warn!("Failed to serialize local candidate: {e}"),
            }
        })
    }));

    let track_tx = events.clone();
    peer_connection.on_track(Box::new(
        move |track: Arc<TrackRemote>,
              _receiver: Arc<RTCRtpReceiver>,
              _transceiver: Arc<RTCRtpTransceiver>| {
            let tx = track_tx.clone();
            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => TrackKind::Audio,
                    RTPCodecType::Video => TrackKind::Video,
                    other => {
                        warn!("Ignoring remote track of kind {other:?}");
                        return;
                    }
                };
                let stream = MediaStream::new(track.stream_id()).with_track(MediaTrack {
                    id: track.id(),
                    kind,
                });
                info!("Remote {} track {} on stream {}", kind, track.id(), stream.id);
                let _ = tx.send(PeerEvent::RemoteStreamAdded(stream)).await;
                tokio::spawn(drain_remote_track(track));
            })
        },
    ));

    let state_tx = events;
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let tx = state_tx.clone();
            Box::pin(async move {
                info!("Peer connection state changed: {state}");
                let _ = tx
                    .send(PeerEvent::ConnectionStateChanged(map_connection_state(
                        state,
                    )))
                    .await;
            })
        },
    ));
}

fn install_data_channel_handlers(data_channel: &RTCDataChannel, events: mpsc::Sender<PeerEvent>) {
    let open_tx = events.clone();
    data_channel.on_open(Box::new(move || {
        let tx = open_tx.clone();
        Box::pin(async move {
            info!("Data channel '{DATA_CHANNEL_LABEL}' open");
            let _ = tx.send(PeerEvent::DataChannelOpen).await;
        })
    }));

    let message_tx = events;
    data_channel.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = message_tx.clone();
        Box::pin(async move {
            let text = String::from_utf8_lossy(&msg.data).into_owned();
            if let Err(e) = tx.send(PeerEvent::DataMessage(text)).await {
                warn!("Failed to forward data channel message: {e}");
            }
        })
    }));
}

/// Keep reading a remote track so the engine's buffers don't fill up.
/// Decoding and playout belong to the render side.
async fn drain_remote_track(track: Arc<TrackRemote>) {
    let mut packets: u64 = 0;
    while track.read_rtp().await.is_ok() {
        packets += 1;
    }
    debug!("Remote track {} ended after {packets} packets", track.id());
}

/// Streams the remote end sends on, grouped by stream id in order of first
/// appearance. Sections that are not audio or video, or that the remote end
/// only receives on, are skipped.
fn remote_streams(sdp: &str) -> Vec<MediaStream> {
    struct Section<'a> {
        kind: Option<TrackKind>,
        sending: bool,
        msid: Option<(&'a str, &'a str)>,
    }

    fn finish(section: Option<Section<'_>>, streams: &mut Vec<MediaStream>) {
        let Some(Section {
            kind: Some(kind),
            sending: true,
            msid: Some((stream_id, track_id)),
        }) = section
        else {
            return;
        };
        let track = MediaTrack {
            id: track_id.to_owned(),
            kind,
        };
        match streams.iter_mut().find(|s| s.id == stream_id) {
            Some(stream) => {
                stream.add_track(track);
            }
            None => streams.push(MediaStream::new(stream_id).with_track(track)),
        }
    }

    fn parse_msid(value: &str) -> Option<(&str, &str)> {
        let mut parts = value.split_whitespace();
        Some((parts.next()?, parts.next()?))
    }

    let mut streams = Vec::new();
    let mut section: Option<Section<'_>> = None;
    for line in sdp.lines().map(str::trim_end) {
        if let Some(media) = line.strip_prefix("m=") {
            finish(section.take(), &mut streams);
            let kind = match media.split_whitespace().next() {
                Some("audio") => Some(TrackKind::Audio),
                Some("video") => Some(TrackKind::Video),
                _ => None,
            };
            section = Some(Section {
                kind,
                sending: true,
                msid: None,
            });
            continue;
        }
        let Some(current) = section.as_mut() else {
            continue;
        };
        match line {
            "a=recvonly" | "a=inactive" => current.sending = false,
            _ => {
                if let Some(value) = line.strip_prefix("a=msid:") {
                    current.msid = current.msid.or(parse_msid(value));
                } else if let Some(value) = line.strip_prefix("a=ssrc:")
                    && let Some((_, attr)) = value.split_once(' ')
                    && let Some(value) = attr.strip_prefix("msid:")
                {
                    current.msid = current.msid.or(parse_msid(value));
                }
            }
        }
    }
    finish(section, &mut streams);
    streams
}

fn to_rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: vec![server.uri.clone()],
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

fn to_rtc_description(description: SessionDescription) -> Result<RTCSessionDescription, WebRtcError> {
    let rtc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
    };
    Ok(rtc)
}

fn from_rtc_description(
    description: RTCSessionDescription,
) -> Result<SessionDescription, WebRtcError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(WebRtcError::UnsupportedDescription(other.to_string())),
    }
}

fn to_rtc_candidate(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: Some(candidate.sdp_mid),
        sdp_mline_index: Some(candidate.sdp_m_line_index),
        ..Default::default()
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init
            .sdp_mid
            .filter(|mid| !mid.is_empty())
            .unwrap_or_else(|| "0".to_string()),
        sdp_m_line_index: init.sdp_mline_index.unwrap_or(0),
    }
}

fn map_connection_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => {
            PeerConnectionState::New
        }
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

/// Errors from WebRTC transport.
#[derive(Debug, thiserror::Error)]
pub enum WebRtcError {
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("Unsupported session description type: {0}")]
    UnsupportedDescription(String),

    #[error("Data channel not open")]
    NotConnected,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ice_servers_keep_order_and_credentials() {
        let servers = [
            IceServer::new("stun:stun.example.com:3478"),
            IceServer {
                uri: "turn:turn.example.com:3478".into(),
                username: Some("user".into()),
                credential: Some("pass".into()),
            },
        ];
        let rtc: Vec<_> = servers.iter().map(to_rtc_ice_server).collect();

        assert_eq!(rtc[0].urls, vec!["stun:stun.example.com:3478".to_string()]);
        assert!(rtc[0].username.is_empty());
        assert_eq!(rtc[1].urls, vec!["turn:turn.example.com:3478".to_string()]);
        assert_eq!(rtc[1].username, "user");
        assert_eq!(rtc[1].credential, "pass");
    }

    #[test]
    fn test_candidate_conversion() {
        let candidate = IceCandidate::new("candidate:1 1 UDP 2130706431 192.0.2.1 5000 typ host")
            .with_sdp_mid("audio")
            .with_sdp_m_line_index(2);
        let init = to_rtc_candidate(candidate.clone());
        assert_eq!(init.sdp_mid.as_deref(), Some("audio"));
        assert_eq!(init.sdp_mline_index, Some(2));
        assert_eq!(from_rtc_candidate(init), candidate);

        let bare = from_rtc_candidate(RTCIceCandidateInit {
            candidate: "candidate:x".into(),
            ..Default::default()
        });
        assert_eq!(bare.sdp_mid, "0");
        assert_eq!(bare.sdp_m_line_index, 0);
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Failed),
            PeerConnectionState::Failed
        );
        assert_eq!(
            map_connection_state(RTCPeerConnectionState::Connected),
            PeerConnectionState::Connected
        );
    }

    #[test]
    fn test_remote_streams_follow_sending_sections() {
        let sdp = "v=0\r\n\
                   o=- 1 1 IN IP4 0.0.0.0\r\n\
                   a=msid-semantic:WMS*\r\n\
                   m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
                   a=mid:0\r\n\
                   a=msid:ls a0\r\n\
                   a=sendrecv\r\n\
                   m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
                   a=mid:1\r\n\
                   a=ssrc:42 msid:ls v0\r\n\
                   a=sendrecv\r\n\
                   m=video 9 UDP/TLS/RTP/SAVPF 96\r\n\
                   a=mid:2\r\n\
                   a=msid:screen s0\r\n\
                   a=inactive\r\n\
                   m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
                   a=mid:3\r\n";

        let streams = remote_streams(sdp);
        assert_eq!(
            streams,
            vec![
                MediaStream::new("ls")
                    .with_track(MediaTrack::audio("a0"))
                    .with_track(MediaTrack::video("v0"))
            ]
        );

        let receive_only = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=recvonly\r\n";
        assert!(remote_streams(receive_only).is_empty());
    }

    async fn next_remote_stream(events: &mut mpsc::Receiver<PeerEvent>) -> MediaStream {
        let wait = async {
            loop {
                match events.recv().await {
                    Some(PeerEvent::RemoteStreamAdded(stream)) => return stream,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(5), wait)
            .await
            .expect("remote stream event")
    }

    #[tokio::test]
    async fn test_both_peers_report_remote_stream_once_descriptions_apply() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (offerer, mut offerer_events) = WebRtcPeer::connect(&[]).await.unwrap();
        let (answerer, mut answerer_events) = WebRtcPeer::connect(&[]).await.unwrap();

        offerer
            .add_local_stream(
                &MediaStream::new("ls")
                    .with_track(MediaTrack::video("v0"))
                    .with_track(MediaTrack::audio("a0")),
            )
            .await
            .unwrap();
        answerer
            .add_local_stream(&MediaStream::new("ls").with_track(MediaTrack::audio("a0")))
            .await
            .unwrap();

        let offer = offerer
            .create_local_description(SdpType::Offer)
            .await
            .unwrap();
        offerer.set_local_description(offer.clone()).await.unwrap();
        answerer.set_remote_description(offer).await.unwrap();

        let seen_by_answerer = next_remote_stream(&mut answerer_events).await;
        assert_eq!(seen_by_answerer.id, "ls");
        assert!(seen_by_answerer.has_video());
        assert!(seen_by_answerer.has_audio());

        let answer = answerer
            .create_local_description(SdpType::Answer)
            .await
            .unwrap();
        answerer.set_local_description(answer.clone()).await.unwrap();
        offerer.set_remote_description(answer).await.unwrap();

        let seen_by_offerer = next_remote_stream(&mut offerer_events).await;
        assert_eq!(
            seen_by_offerer,
            MediaStream::new("ls").with_track(MediaTrack::audio("a0"))
        );

        offerer.close().await;
        answerer.close().await;
    }

    #[tokio::test]
    async fn test_offer_answer_and_candidate_queue() {
        let (offerer, _offerer_events) = WebRtcPeer::connect(&[]).await.unwrap();
        let (answerer, _answerer_events) = WebRtcPeer::connect(&[]).await.unwrap();

        let stream = MediaStream::new("ls").with_track(MediaTrack::audio("a0"));
        offerer.add_local_stream(&stream).await.unwrap();
        assert_eq!(offerer.local_tracks().await.len(), 1);

        let offer = offerer
            .create_local_description(SdpType::Offer)
            .await
            .unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        offerer.set_local_description(offer.clone()).await.unwrap();

        // Held until the offer is applied.
        answerer
            .add_remote_candidate(IceCandidate::new(
                "candidate:1 1 UDP 2130706431 192.0.2.1 5000 typ host",
            ))
            .await
            .unwrap();
        assert_eq!(answerer.pending_candidates().await, 1);

        answerer.set_remote_description(offer).await.unwrap();
        assert_eq!(answerer.pending_candidates().await, 0);

        let answer = answerer
            .create_local_description(SdpType::Answer)
            .await
            .unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);

        assert!(answerer.send_data("too early").await.is_err());

        offerer.close().await;
        offerer.close().await;
        answerer.close().await;
    }
}
