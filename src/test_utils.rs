//! Recording fakes for the call collaborators.
//!
//! Every fake writes what it was asked to do into a shared [`EventLog`], so
//! tests can assert on call order across collaborators.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};

use crate::calls::media::{
    CaptureBackend, CaptureDeviceInfo, CaptureFormat, CaptureSource, MediaStream, PeerEvent,
    PeerTransport, PeerTransportFactory, RenderSink,
};
use crate::calls::{
    CallListener, IceCandidate, SdpType, SessionDescription, SignalPayload, SignalPhase,
    StopReason, decode_request, encode_response,
};
use crate::config::{IceServer, RawSessionConfig};
use crate::transport::{ChannelEvent, ChannelFactory, SignalingChannel};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const POLL_ATTEMPTS: usize = 1000;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Poll `condition` until it holds or about five seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..POLL_ATTEMPTS {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    condition()
}

/// A valid configuration pointing at a test relay.
pub fn raw_config(local_id: &str, remote_id: &str) -> RawSessionConfig {
    RawSessionConfig {
        local_id: local_id.into(),
        remote_id: remote_id.into(),
        signaling_endpoint: "ws://relay.test:8080/".into(),
        stun_server_uri: Some("stun:stun.test:3478".into()),
        ..Default::default()
    }
}

/// An inbound relay frame.
pub fn relay_frame(phase: SignalPhase, success: bool, message: &str, data: &str) -> ChannelEvent {
    let bytes = encode_response(phase, success, message, data).unwrap_or_default();
    ChannelEvent::MessageReceived(Bytes::from(bytes))
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl EventLog {
    pub fn push(&self, entry: impl Into<String>) {
        lock(&self.entries).push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        lock(&self.entries).clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.entries)
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }

    /// Index of the first entry starting with `prefix`.
    pub fn position(&self, prefix: &str) -> Option<usize> {
        lock(&self.entries)
            .iter()
            .position(|e| e.starts_with(prefix))
    }
}

// Signaling channel

pub struct FakeChannel {
    log: EventLog,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_sends: Arc<AtomicBool>,
}

#[async_trait]
impl SignalingChannel for FakeChannel {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("socket is closed"));
        }
        lock(&self.sent).push(data.to_vec());
        Ok(())
    }

    async fn close(&self) {
        self.log.push("channel.close");
    }
}

/// Hands out one channel whose inbound events are driven by the test.
pub struct FakeChannelFactory {
    log: EventLog,
    events_tx: mpsc::Sender<ChannelEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<ChannelEvent>>>,
    endpoints: Mutex<Vec<String>>,
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_sends: Arc<AtomicBool>,
    connect_error: Mutex<Option<String>>,
}

impl FakeChannelFactory {
    pub fn new(log: EventLog) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            log,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            endpoints: Mutex::new(Vec::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            fail_sends: Arc::new(AtomicBool::new(false)),
            connect_error: Mutex::new(None),
        }
    }

    /// Make the next connect fail with `reason`.
    pub fn fail_connect(&self, reason: &str) {
        *lock(&self.connect_error) = Some(reason.to_string());
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Queue an event for the session. Events sent before connect are
    /// delivered once it happens.
    pub async fn emit(&self, event: ChannelEvent) {
        let _ = self.events_tx.send(event).await;
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.endpoints).len()
    }

    pub fn endpoints(&self) -> Vec<String> {
        lock(&self.endpoints).clone()
    }

    /// Everything the session sent, decoded as outbound frames.
    pub fn sent(&self) -> Vec<SignalPayload> {
        lock(&self.sent)
            .iter()
            .filter_map(|bytes| decode_request(bytes).ok().map(|(payload, _)| payload))
            .collect()
    }

    pub fn sent_phases(&self) -> Vec<SignalPhase> {
        self.sent().iter().map(SignalPayload::phase).collect()
    }

    /// Wait until at least `count` messages were sent and return them.
    pub async fn wait_for_sent(&self, count: usize) -> Vec<SignalPayload> {
        wait_until(|| lock(&self.sent).len() >= count).await;
        self.sent()
    }
}

#[async_trait]
impl ChannelFactory for FakeChannelFactory {
    async fn connect(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<ChannelEvent>), anyhow::Error> {
        lock(&self.endpoints).push(endpoint.to_string());
        self.log.push("channel.connect");
        if let Some(reason) = lock(&self.connect_error).take() {
            return Err(anyhow::anyhow!(reason));
        }
        let events = lock(&self.events_rx)
            .take()
            .ok_or_else(|| anyhow::anyhow!("fake channel already connected"))?;
        let channel: Arc<dyn SignalingChannel> = Arc::new(FakeChannel {
            log: self.log.clone(),
            sent: Arc::clone(&self.sent),
            fail_sends: Arc::clone(&self.fail_sends),
        });
        Ok((channel, events))
    }
}

// Peer transport

#[derive(Debug, Clone, Copy, Default)]
pub struct FakeTransportBehavior {
    pub fail_create_session: bool,
    pub fail_create_description: bool,
    pub fail_set_remote: bool,
    /// Block `create_local_description` until [`FakePeerTransportFactory::release_descriptions`].
    pub hold_descriptions: bool,
}

pub struct FakePeerTransport {
    log: EventLog,
    behavior: FakeTransportBehavior,
    gate: Arc<Semaphore>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    sent_data: Mutex<Vec<String>>,
    local_streams: Mutex<Vec<MediaStream>>,
    closed: AtomicBool,
}

impl FakePeerTransport {
    pub fn new(log: EventLog) -> Self {
        Self::with_behavior(
            log,
            FakeTransportBehavior::default(),
            Arc::new(Semaphore::new(0)),
        )
    }

    fn with_behavior(log: EventLog, behavior: FakeTransportBehavior, gate: Arc<Semaphore>) -> Self {
        Self {
            log,
            behavior,
            gate,
            remote_candidates: Mutex::new(Vec::new()),
            sent_data: Mutex::new(Vec::new()),
            local_streams: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.remote_candidates).clone()
    }

    pub fn sent_data(&self) -> Vec<String> {
        lock(&self.sent_data).clone()
    }

    pub fn local_streams(&self) -> Vec<MediaStream> {
        lock(&self.local_streams).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for FakePeerTransport {
    async fn create_local_description(
        &self,
        sdp_type: SdpType,
    ) -> Result<SessionDescription, anyhow::Error> {
        self.log
            .push(format!("transport.create_local_description:{sdp_type}"));
        if self.behavior.hold_descriptions {
            self.gate.acquire().await?.forget();
        }
        if self.behavior.fail_create_description {
            return Err(anyhow::anyhow!("cannot create {sdp_type}"));
        }
        Ok(SessionDescription {
            sdp_type,
            sdp: format!("v=0\r\ns=fake-{sdp_type}\r\n"),
        })
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.log.push(format!(
            "transport.set_local_description:{}",
            description.sdp_type
        ));
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error> {
        self.log.push(format!(
            "transport.set_remote_description:{}",
            description.sdp_type
        ));
        if self.behavior.fail_set_remote {
            return Err(anyhow::anyhow!("bad remote {}", description.sdp_type));
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error> {
        self.log.push("transport.add_remote_candidate");
        lock(&self.remote_candidates).push(candidate);
        Ok(())
    }

    async fn add_local_stream(&self, stream: &MediaStream) -> Result<(), anyhow::Error> {
        self.log.push("transport.add_local_stream");
        lock(&self.local_streams).push(stream.clone());
        Ok(())
    }

    async fn send_data(&self, text: &str) -> Result<(), anyhow::Error> {
        lock(&self.sent_data).push(text.to_string());
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.log.push("transport.close");
        }
    }
}

/// Creates [`FakePeerTransport`]s and lets the test play the engine's side.
pub struct FakePeerTransportFactory {
    log: EventLog,
    behavior: FakeTransportBehavior,
    gate: Arc<Semaphore>,
    sessions: Mutex<Vec<Arc<FakePeerTransport>>>,
    events: Mutex<Option<mpsc::Sender<PeerEvent>>>,
    ice_servers: Mutex<Vec<IceServer>>,
}

impl FakePeerTransportFactory {
    pub fn new(log: EventLog) -> Self {
        Self::with_behavior(log, FakeTransportBehavior::default())
    }

    pub fn with_behavior(log: EventLog, behavior: FakeTransportBehavior) -> Self {
        Self {
            log,
            behavior,
            gate: Arc::new(Semaphore::new(0)),
            sessions: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            ice_servers: Mutex::new(Vec::new()),
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// The most recently created transport.
    pub fn transport(&self) -> Option<Arc<FakePeerTransport>> {
        lock(&self.sessions).last().cloned()
    }

    pub fn ice_servers(&self) -> Vec<IceServer> {
        lock(&self.ice_servers).clone()
    }

    /// Let `count` held description requests proceed.
    pub fn release_descriptions(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Deliver an engine callback to the session. No-op before a session exists.
    pub async fn emit(&self, event: PeerEvent) {
        let sender = lock(&self.events).clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }
}

#[async_trait]
impl PeerTransportFactory for FakePeerTransportFactory {
    async fn create_session(
        &self,
        ice_servers: &[IceServer],
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), anyhow::Error> {
        self.log.push("transport.create_session");
        if self.behavior.fail_create_session {
            return Err(anyhow::anyhow!("engine unavailable"));
        }
        *lock(&self.ice_servers) = ice_servers.to_vec();
        let transport = Arc::new(FakePeerTransport::with_behavior(
            self.log.clone(),
            self.behavior,
            Arc::clone(&self.gate),
        ));
        let (tx, rx) = mpsc::channel(64);
        *lock(&self.events) = Some(tx);
        lock(&self.sessions).push(Arc::clone(&transport));
        let session: Arc<dyn PeerTransport> = transport;
        Ok((session, rx))
    }
}

// Capture and rendering

pub struct FakeCaptureSource {
    log: EventLog,
    device: CaptureDeviceInfo,
    stopped: AtomicBool,
}

#[async_trait]
impl CaptureSource for FakeCaptureSource {
    fn device(&self) -> &CaptureDeviceInfo {
        &self.device
    }

    async fn start(&self, format: CaptureFormat) -> Result<(), anyhow::Error> {
        self.log.push(format!(
            "capture.start:{} {}x{}@{}",
            self.device.name, format.width, format.height, format.fps
        ));
        Ok(())
    }

    async fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.log.push(format!("capture.stop:{}", self.device.name));
        }
    }
}

pub struct FakeCaptureBackend {
    log: EventLog,
    devices: Vec<CaptureDeviceInfo>,
}

impl FakeCaptureBackend {
    pub fn new(log: EventLog, devices: Vec<CaptureDeviceInfo>) -> Self {
        Self { log, devices }
    }
}

#[async_trait]
impl CaptureBackend for FakeCaptureBackend {
    fn devices(&self) -> Vec<CaptureDeviceInfo> {
        self.devices.clone()
    }

    async fn open(
        &self,
        device: &CaptureDeviceInfo,
    ) -> Result<Option<Arc<dyn CaptureSource>>, anyhow::Error> {
        Ok(Some(Arc::new(FakeCaptureSource {
            log: self.log.clone(),
            device: device.clone(),
            stopped: AtomicBool::new(false),
        })))
    }
}

pub struct FakeRenderSink {
    log: EventLog,
    name: &'static str,
}

impl FakeRenderSink {
    pub fn new(log: EventLog, name: &'static str) -> Self {
        Self { log, name }
    }
}

impl RenderSink for FakeRenderSink {
    fn attach(&self, stream: &MediaStream) {
        self.log
            .push(format!("sink.attach:{}:{}", self.name, stream.id));
    }

    fn release(&self) {
        self.log.push(format!("sink.release:{}", self.name));
    }
}

// Listener

pub struct RecordingListener {
    log: EventLog,
    connected: AtomicUsize,
    data: Mutex<Vec<String>>,
    stopped: Mutex<Vec<StopReason>>,
}

impl RecordingListener {
    pub fn new(log: EventLog) -> Self {
        Self {
            log,
            connected: AtomicUsize::new(0),
            data: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
        }
    }

    pub fn connected_count(&self) -> usize {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn data_messages(&self) -> Vec<String> {
        lock(&self.data).clone()
    }

    pub fn stop_reasons(&self) -> Vec<StopReason> {
        lock(&self.stopped).clone()
    }
}

impl CallListener for RecordingListener {
    fn on_connected(&self) {
        self.connected.fetch_add(1, Ordering::SeqCst);
        self.log.push("listener.connected");
    }

    fn on_data_message(&self, message: &str) {
        lock(&self.data).push(message.to_string());
    }

    fn on_stopped(&self, reason: &StopReason) {
        lock(&self.stopped).push(reason.clone());
        self.log.push("listener.stopped");
    }
}
