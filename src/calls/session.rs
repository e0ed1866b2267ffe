//! One call attempt, from `start()` to teardown.
//!
//! After [`CallSession::start`] the session is owned by a single tokio task
//! that processes one event at a time: commands from [`CallHandle`]s,
//! signaling channel events, transport events, and the results of
//! description work running in spawned tasks. Every transition therefore
//! runs to completion before the next event is looked at.
//!
//! Description results carry the negotiation generation they were started
//! under. Teardown bumps the generation, so results that land after the
//! call ended are dropped.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use super::CallError;
use super::data_channel::DataChannelBridge;
use super::envelope::{self, DialRequest, SignalEnvelope, SignalPayload};
use super::media::{
    CaptureBackend, LocalMedia, MediaStream, PeerConnectionState, PeerEvent, PeerTransport,
    PeerTransportFactory, RenderSink,
};
use super::signaling::SignalPhase;
use super::state::{CallState, CallTransition, StopReason};
use super::transport::{IceCandidate, SdpType, SessionDescription};
use crate::config::{RawSessionConfig, SessionConfig};
use crate::transport::{ChannelEvent, ChannelFactory, SignalingChannel};

const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Close code reported when the channel's event stream ends without a close frame.
const ABNORMAL_CLOSE: u16 = 1006;

/// Notifications from a call. Methods are called from the call's task and
/// should return quickly.
pub trait CallListener: Send + Sync {
    /// Remote media arrived. Fires at most once per call.
    fn on_connected(&self) {}

    fn on_data_message(&self, _message: &str) {}

    /// The call ended and every resource was released. Fires exactly once
    /// for a call that got past configuration and capture.
    fn on_stopped(&self, _reason: &StopReason) {}
}

#[derive(Debug, Clone)]
pub struct CallOptions {
    /// End the call when creating or applying a description fails.
    /// When false such failures are only logged.
    pub escalate_negotiation_failures: bool,
    /// Open the data channel bridge once connected.
    pub data_channel: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            escalate_negotiation_failures: true,
            data_channel: true,
        }
    }
}

/// Collaborators a call is built from.
pub struct CallDeps {
    pub channels: Arc<dyn ChannelFactory>,
    pub transports: Arc<dyn PeerTransportFactory>,
    pub capture: Arc<dyn CaptureBackend>,
    pub local_sink: Option<Arc<dyn RenderSink>>,
    pub remote_sink: Option<Arc<dyn RenderSink>>,
}

enum Command {
    Stop {
        done: oneshot::Sender<()>,
    },
    SendData {
        text: String,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
}

/// Result of description work done off the event loop.
enum Completion {
    /// A local offer or answer was created and applied.
    LocalDescription {
        generation: u64,
        result: Result<SessionDescription, String>,
    },
    /// A remote answer was applied.
    RemoteDescription {
        generation: u64,
        sdp_type: SdpType,
        result: Result<(), String>,
    },
}

impl Completion {
    fn generation(&self) -> u64 {
        match self {
            Self::LocalDescription { generation, .. }
            | Self::RemoteDescription { generation, .. } => *generation,
        }
    }
}

/// The call state machine and everything it owns.
pub struct CallSession {
    deps: CallDeps,
    listener: Arc<dyn CallListener>,
    options: CallOptions,
    config: Option<SessionConfig>,
    state: CallState,
    state_tx: watch::Sender<CallState>,
    channel: Option<Arc<dyn SignalingChannel>>,
    transport: Option<Arc<dyn PeerTransport>>,
    bridge: Option<DataChannelBridge>,
    local_media: Option<LocalMedia>,
    remote_streams: Vec<MediaStream>,
    remote_sink_attached: bool,
    /// Remote candidates received before the transport session existed.
    pending_candidates: Vec<IceCandidate>,
    data_channel_open: bool,
    generation: u64,
    completion_tx: mpsc::UnboundedSender<Completion>,
    completion_rx: Option<mpsc::UnboundedReceiver<Completion>>,
}

impl CallSession {
    pub fn new(deps: CallDeps, listener: Arc<dyn CallListener>, options: CallOptions) -> Self {
        let (state_tx, _) = watch::channel(CallState::Idle);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        Self {
            deps,
            listener,
            options,
            config: None,
            state: CallState::Idle,
            state_tx,
            channel: None,
            transport: None,
            bridge: None,
            local_media: None,
            remote_streams: Vec::new(),
            remote_sink_attached: false,
            pending_candidates: Vec::new(),
            data_channel_open: false,
            generation: 0,
            completion_tx,
            completion_rx: Some(completion_rx),
        }
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    /// Validate the configuration, acquire local media and start connecting.
    ///
    /// Configuration and capture failures are returned here, before any
    /// network activity, and produce no `on_stopped`. Everything after that
    /// is reported through the listener and the returned handle.
    pub async fn start(mut self, raw: &RawSessionConfig) -> Result<CallHandle, CallError> {
        if !self.state.is_idle() {
            return Err(CallError::SessionClosed);
        }

        let config = SessionConfig::validate(raw)?;
        let local_media =
            LocalMedia::acquire(self.deps.capture.as_ref(), config.video_enabled()).await?;
        if local_media.is_capturing()
            && let Some(sink) = &self.deps.local_sink
        {
            sink.attach(local_media.stream());
        }

        info!(
            "Starting call {} -> {} via {}",
            config.local_id(),
            config.remote_id(),
            config.signaling_endpoint()
        );
        self.config = Some(config);
        self.local_media = Some(local_media);
        self.apply(CallTransition::Start);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let handle = CallHandle {
            commands: command_tx,
            state: self.state_tx.subscribe(),
        };
        tokio::spawn(self.run(command_rx));
        Ok(handle)
    }

    /// Marks a session that was never started as closed, without notifying
    /// the listener. `start` consumes the session, so a running call is
    /// stopped through [`CallHandle::stop`] instead.
    pub async fn stop(&mut self) {
        self.teardown(StopReason::LocalStop).await;
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let Some(mut completions) = self.completion_rx.take() else {
            return;
        };
        let Some(mut channel_events) = self.connect_channel(&mut commands).await else {
            return;
        };
        let mut peer_events: Option<mpsc::Receiver<PeerEvent>> = None;

        while !self.state.is_closed() {
            tokio::select! {
                command = commands.recv() => self.handle_command(command).await,
                event = channel_events.recv() => {
                    if let Some(events) = self.handle_channel_event(event).await {
                        peer_events = Some(events);
                    }
                }
                event = next_peer_event(&mut peer_events) => match event {
                    Some(event) => self.handle_peer_event(event).await,
                    None => {
                        debug!("Transport event stream ended");
                        peer_events = None;
                    }
                },
                Some(completion) = completions.recv() => self.handle_completion(completion).await,
            }
        }
        debug!("Call task finished");
    }

    /// Open the signaling channel while still answering commands.
    async fn connect_channel(
        &mut self,
        commands: &mut mpsc::Receiver<Command>,
    ) -> Option<mpsc::Receiver<ChannelEvent>> {
        let Some(endpoint) = self
            .config
            .as_ref()
            .map(|c| c.signaling_endpoint().to_string())
        else {
            self.teardown(StopReason::ConnectFailed("no configuration".into()))
                .await;
            return None;
        };

        let channels = Arc::clone(&self.deps.channels);
        let connect = channels.connect(&endpoint);
        tokio::pin!(connect);

        loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok((channel, events)) => {
                        debug!("Signaling channel to {endpoint} connected");
                        self.channel = Some(channel);
                        return Some(events);
                    }
                    Err(e) => {
                        error!("Failed to connect to {endpoint}: {e:?}");
                        self.teardown(StopReason::ConnectFailed(e.to_string())).await;
                        return None;
                    }
                },
                command = commands.recv() => {
                    self.handle_command(command).await;
                    if self.state.is_closed() {
                        return None;
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Option<Command>) {
        match command {
            Some(Command::Stop { done }) => {
                self.teardown(StopReason::LocalStop).await;
                let _ = done.send(());
            }
            Some(Command::SendData { text, reply }) => {
                let result = match &self.bridge {
                    Some(bridge) => bridge.send(&text).await,
                    None => Err(CallError::DataChannelClosed),
                };
                let _ = reply.send(result);
            }
            None => {
                info!("All call handles dropped, stopping");
                self.teardown(StopReason::LocalStop).await;
            }
        }
    }

    async fn handle_channel_event(
        &mut self,
        event: Option<ChannelEvent>,
    ) -> Option<mpsc::Receiver<PeerEvent>> {
        match event {
            Some(ChannelEvent::Opened) => {
                self.on_channel_open().await;
                None
            }
            Some(ChannelEvent::MessageReceived(bytes)) => match envelope::decode(&bytes) {
                Ok(envelope) => self.handle_envelope(envelope).await,
                Err(e) => {
                    warn!("Dropping signaling message: {e}");
                    None
                }
            },
            Some(ChannelEvent::Closed { code, reason }) => {
                info!("Signaling channel closed ({code}): {reason}");
                self.teardown(StopReason::ChannelClosed { code, reason })
                    .await;
                None
            }
            Some(ChannelEvent::Error(e)) => {
                error!("Signaling channel error: {e}");
                self.teardown(StopReason::ChannelError(e)).await;
                None
            }
            None => {
                self.teardown(StopReason::ChannelClosed {
                    code: ABNORMAL_CLOSE,
                    reason: "event stream ended".into(),
                })
                .await;
                None
            }
        }
    }

    async fn on_channel_open(&mut self) {
        if !self.apply(CallTransition::ChannelOpened) {
            return;
        }
        let Some(config) = &self.config else {
            return;
        };
        let dial = SignalPayload::DialRequest(DialRequest {
            local_id: config.local_id().to_string(),
            remote_id: config.remote_id().to_string(),
        });
        self.send_signal(&dial).await;
    }

    /// Returns the transport's event stream when this message created the
    /// transport session.
    async fn handle_envelope(
        &mut self,
        envelope: SignalEnvelope,
    ) -> Option<mpsc::Receiver<PeerEvent>> {
        debug!("Received {} message", envelope.phase);
        if envelope.phase == SignalPhase::Dial {
            return self.on_dial_response(envelope).await;
        }
        if !envelope.success {
            warn!(
                "Relay refused {} message: {}",
                envelope.phase, envelope.message
            );
            return None;
        }

        match envelope.payload {
            Some(SignalPayload::Offer(offer)) => self.on_remote_offer(offer),
            Some(SignalPayload::Answer(answer)) => self.on_remote_answer(answer),
            Some(SignalPayload::Candidate(candidate)) => self.on_remote_candidate(candidate).await,
            Some(SignalPayload::Stop) => {
                info!("Peer ended the call");
                self.teardown(StopReason::RemoteStop).await;
            }
            other => debug!("Ignoring {} message: {other:?}", envelope.phase),
        }
        None
    }

    async fn on_dial_response(
        &mut self,
        envelope: SignalEnvelope,
    ) -> Option<mpsc::Receiver<PeerEvent>> {
        if !matches!(self.state, CallState::AwaitingDial { .. }) {
            warn!("Ignoring dial response in state {}", self.state.name());
            return None;
        }
        if !envelope.success {
            warn!("Dial rejected: {}", envelope.message);
            self.teardown(StopReason::DialRejected(envelope.message))
                .await;
            return None;
        }
        let Some(SignalPayload::DialResponse { initiator }) = envelope.payload else {
            warn!("Dial response without payload");
            return None;
        };

        let ice_servers = self
            .config
            .as_ref()
            .map(|c| c.ice_servers().to_vec())
            .unwrap_or_default();
        let transports = Arc::clone(&self.deps.transports);
        let (transport, events) = match transports.create_session(&ice_servers).await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create transport session: {e:?}");
                self.teardown(StopReason::NegotiationFailed(format!(
                    "transport session: {e}"
                )))
                .await;
                return None;
            }
        };
        self.transport = Some(Arc::clone(&transport));
        self.apply(CallTransition::DialAccepted { initiator });
        info!("Paired with peer, initiator: {initiator}");

        let attached = match &self.local_media {
            Some(media) => transport.add_local_stream(media.stream()).await,
            None => Ok(()),
        };
        if let Err(e) = attached {
            error!("Failed to attach local media: {e:?}");
            self.teardown(StopReason::NegotiationFailed(format!("local media: {e}")))
                .await;
            return None;
        }

        let queued = std::mem::take(&mut self.pending_candidates);
        if !queued.is_empty() {
            debug!("Applying {} queued remote candidate(s)", queued.len());
        }
        for candidate in queued {
            apply_remote_candidate(transport.as_ref(), candidate).await;
        }

        if initiator {
            self.spawn_local_description(SdpType::Offer, None);
        }
        Some(events)
    }

    fn on_remote_offer(&mut self, offer: SessionDescription) {
        if self.transport.is_none() {
            warn!("Dropping offer received before pairing");
            return;
        }
        self.spawn_local_description(SdpType::Answer, Some(offer));
    }

    fn on_remote_answer(&mut self, answer: SessionDescription) {
        let Some(transport) = self.transport.clone() else {
            warn!("Dropping answer received before pairing");
            return;
        };
        let generation = self.generation;
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = transport
                .set_remote_description(answer)
                .await
                .map_err(|e| e.to_string());
            let _ = completions.send(Completion::RemoteDescription {
                generation,
                sdp_type: SdpType::Answer,
                result,
            });
        });
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        match &self.transport {
            Some(transport) => apply_remote_candidate(transport.as_ref(), candidate).await,
            None => {
                debug!("Queueing remote candidate until the transport exists");
                self.pending_candidates.push(candidate);
            }
        }
    }

    /// Create and apply a local description, after applying `remote` if given,
    /// then report back to the loop.
    fn spawn_local_description(&self, sdp_type: SdpType, remote: Option<SessionDescription>) {
        let Some(transport) = self.transport.clone() else {
            return;
        };
        let generation = self.generation;
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let result = async {
                if let Some(remote) = remote {
                    transport.set_remote_description(remote).await?;
                }
                let local = transport.create_local_description(sdp_type).await?;
                transport.set_local_description(local.clone()).await?;
                Ok::<_, anyhow::Error>(local)
            }
            .await;
            let _ = completions.send(Completion::LocalDescription {
                generation,
                result: result.map_err(|e| e.to_string()),
            });
        });
    }

    async fn handle_completion(&mut self, completion: Completion) {
        if completion.generation() != self.generation || self.state.is_closed() {
            debug!("Dropping stale negotiation result");
            return;
        }
        match completion {
            Completion::LocalDescription {
                result: Ok(description),
                ..
            } => {
                let payload = SignalPayload::description(description);
                self.send_signal(&payload).await;
            }
            Completion::LocalDescription { result: Err(e), .. } => {
                self.negotiation_failed(format!("local description: {e}"))
                    .await;
            }
            Completion::RemoteDescription {
                sdp_type,
                result: Ok(()),
                ..
            } => debug!("Applied remote {sdp_type}"),
            Completion::RemoteDescription {
                sdp_type,
                result: Err(e),
                ..
            } => {
                self.negotiation_failed(format!("remote {sdp_type}: {e}"))
                    .await;
            }
        }
    }

    async fn negotiation_failed(&mut self, reason: String) {
        if self.options.escalate_negotiation_failures {
            error!("Negotiation failed: {reason}");
            self.teardown(StopReason::NegotiationFailed(reason)).await;
        } else {
            warn!("Negotiation failed, continuing: {reason}");
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send_signal(&SignalPayload::Candidate(candidate)).await;
            }
            PeerEvent::RemoteStreamAdded(stream) => self.on_remote_stream(stream),
            PeerEvent::DataChannelOpen => {
                self.data_channel_open = true;
                if let Some(bridge) = &mut self.bridge {
                    bridge.mark_ready();
                }
            }
            PeerEvent::DataMessage(text) => match &self.bridge {
                Some(bridge) => bridge.deliver(&text, self.listener.as_ref()),
                None => debug!("Dropping data message received before the call connected"),
            },
            PeerEvent::ConnectionStateChanged(state) => {
                info!("Transport connection {state}");
                if state == PeerConnectionState::Failed {
                    self.negotiation_failed("transport connection failed".into())
                        .await;
                }
            }
        }
    }

    fn on_remote_stream(&mut self, stream: MediaStream) {
        let index = match self.remote_streams.iter().position(|s| s.id == stream.id) {
            Some(index) => {
                let added = self.remote_streams[index].merge(stream);
                debug!("Merged {added} new track(s) into remote stream");
                index
            }
            None => {
                self.remote_streams.push(stream);
                self.remote_streams.len() - 1
            }
        };
        self.attach_remote_video(index);

        if self.state.is_active() {
            return;
        }
        if !self.transition(CallTransition::RemoteStreamAdded) {
            return;
        }
        if self.options.data_channel
            && let Some(transport) = &self.transport
        {
            self.bridge = Some(DataChannelBridge::open(
                Arc::clone(transport),
                self.data_channel_open,
            ));
        }
        info!("Call connected");
        self.listener.on_connected();
        self.publish();
    }

    fn attach_remote_video(&mut self, index: usize) {
        let video_enabled = self.config.as_ref().is_some_and(|c| c.video_enabled());
        if self.remote_sink_attached || !video_enabled {
            return;
        }
        let Some(stream) = self.remote_streams.get(index) else {
            return;
        };
        if let Some(sink) = &self.deps.remote_sink
            && stream.has_video()
        {
            sink.attach(stream);
            self.remote_sink_attached = true;
        }
    }

    /// Send one message to the relay. A failed send ends the call.
    async fn send_signal(&mut self, payload: &SignalPayload) {
        let phase = payload.phase();
        let bytes = match envelope::encode(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("{e}");
                return;
            }
        };
        let Some(channel) = self.channel.clone() else {
            debug!("No signaling channel, dropping {phase} message");
            return;
        };
        match channel.send(&bytes).await {
            Ok(()) => debug!("Sent {phase} message"),
            Err(e) => {
                error!("Failed to send {phase} message: {e:?}");
                self.teardown(StopReason::ChannelError(e.to_string())).await;
            }
        }
    }

    /// Release everything in order and report `reason`, exactly once.
    async fn teardown(&mut self, reason: StopReason) {
        if self.state.is_closed() {
            return;
        }
        self.generation += 1;
        let notify = !self.state.is_idle();
        info!("Ending call in state {}: {reason}", self.state.name());

        if reason == StopReason::LocalStop
            && let Some(channel) = &self.channel
            && let Ok(bytes) = envelope::encode(&SignalPayload::Stop)
            && let Err(e) = channel.send(&bytes).await
        {
            debug!("Could not tell the peer we stopped: {e}");
        }

        if let Some(mut bridge) = self.bridge.take() {
            bridge.close();
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await;
        }
        if let Some(media) = &mut self.local_media {
            media.release_capture().await;
        }
        if let Some(sink) = self.deps.local_sink.take() {
            sink.release();
        }
        if let Some(sink) = self.deps.remote_sink.take() {
            sink.release();
        }
        self.local_media = None;
        self.remote_streams.clear();
        self.pending_candidates.clear();

        self.transition(CallTransition::Terminated {
            reason: reason.clone(),
        });
        if notify {
            self.listener.on_stopped(&reason);
        }
        self.publish();
    }

    fn apply(&mut self, transition: CallTransition) -> bool {
        let applied = self.transition(transition);
        if applied {
            self.publish();
        }
        applied
    }

    /// Move to the next state without telling handles yet.
    fn transition(&mut self, transition: CallTransition) -> bool {
        match self.state.apply(transition) {
            Ok(next) => {
                debug!("Call state {} -> {}", self.state.name(), next.name());
                self.state = next;
                true
            }
            Err(e) => {
                warn!("{e}");
                false
            }
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }
}

async fn apply_remote_candidate(transport: &dyn PeerTransport, candidate: IceCandidate) {
    if let Err(e) = transport.add_remote_candidate(candidate).await {
        warn!("Failed to apply remote candidate: {e:?}");
    }
}

async fn next_peer_event(events: &mut Option<mpsc::Receiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

/// Controls a running call. Cheap to clone; dropping every handle stops the call.
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<CallState>,
}

impl CallHandle {
    /// Stop the call and wait for teardown to finish. Repeated calls are no-ops.
    pub async fn stop(&self) {
        let (done, finished) = oneshot::channel();
        if self.commands.send(Command::Stop { done }).await.is_ok() {
            let _ = finished.await;
        }
    }

    /// Send text over the data channel.
    pub async fn send_data(&self, text: &str) -> Result<(), CallError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::SendData {
                text: text.to_owned(),
                reply,
            })
            .await
            .map_err(|_| CallError::SessionClosed)?;
        response.await.map_err(|_| CallError::SessionClosed)?
    }

    pub fn state(&self) -> CallState {
        self.state.borrow().clone()
    }

    /// Wait until the call state satisfies `predicate`, or the call task exits.
    pub async fn wait_for_state(&self, predicate: impl Fn(&CallState) -> bool) -> CallState {
        let mut state = self.state.clone();
        let result = state.wait_for(|s| predicate(s)).await.map(|s| s.clone());
        match result {
            Ok(reached) => reached,
            Err(_) => state.borrow().clone(),
        }
    }

    /// Wait for the call to end and return why it did. The listener has
    /// already seen `on_stopped` when this returns.
    pub async fn closed(&self) -> StopReason {
        self.wait_for_state(CallState::is_closed)
            .await
            .stop_reason()
            .cloned()
            .unwrap_or(StopReason::LocalStop)
    }
}
