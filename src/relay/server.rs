use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

use super::RelayError;
use super::registry::{DialOutcome, Registry};
use crate::calls::{DialRequest, SignalPayload, SignalPhase, decode_request, encode_response};

const NULL_DATA: &str = "null";
const INCORRECT_PHASE: &str = "incorrect phase";

type Outbound = mpsc::UnboundedSender<Message>;

struct RelayState {
    registry: Mutex<Registry>,
    connections: DashMap<String, Outbound>,
}

impl RelayState {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn send_to(&self, uid: &str, frame: Message) -> bool {
        match self.connections.get(uid) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Drops `uid` and the connection `own` that claimed it, then tells the
    /// partner to stop. The registry lock is held until the sender is gone so
    /// a new dialer cannot claim `uid` in between.
    fn release(&self, uid: &str, own: &Outbound) {
        let partner = {
            let mut registry = self.registry();
            let partner = registry.leave(uid);
            self.connections.remove_if(uid, |_, tx| tx.same_channel(own));
            partner
        };
        info!("Released user {uid}");

        if let Some(partner) = partner
            && let Some(frame) = response(SignalPhase::Stop, true, "", NULL_DATA)
            && !self.send_to(&partner, frame)
        {
            debug!("Partner {partner} of {uid} is already gone");
        }
    }
}

/// What one WebSocket connection has claimed.
#[derive(Debug, Default)]
struct Binding {
    uid: Option<String>,
    partner: Option<String>,
}

/// The signaling relay. Pairs two dialers and forwards their negotiation
/// messages to each other.
#[derive(Clone)]
pub struct RelayServer {
    state: Arc<RelayState>,
}

impl Default for RelayServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RelayState {
                registry: Mutex::new(Registry::new()),
                connections: DashMap::new(),
            }),
        }
    }

    /// Number of users currently known to the registry, placeholders included.
    pub fn user_count(&self) -> usize {
        self.state.registry().len()
    }

    /// Binds `addr` and serves until the listener fails.
    pub async fn listen(self, addr: impl ToSocketAddrs) -> Result<(), RelayError> {
        let listener = TcpListener::bind(addr).await.map_err(RelayError::Bind)?;
        self.serve(listener).await
    }

    pub async fn serve(self, listener: TcpListener) -> Result<(), RelayError> {
        if let Ok(addr) = listener.local_addr() {
            info!("Relay listening on {addr}");
        }
        loop {
            let (stream, peer) = listener.accept().await.map_err(RelayError::Accept)?;
            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(state, stream, peer).await {
                    warn!("Connection {peer} ended with error: {e}");
                }
            });
        }
    }
}

async fn handle_connection(
    state: Arc<RelayState>,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), RelayError> {
    let ws = accept_async(stream).await?;
    debug!("Accepted websocket from {peer}");
    let (mut sink, mut source) = ws.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!("Write to {peer} failed: {e}");
                break;
            }
        }
        let _ = sink.close().await;
    });

    let cleanup_state = state.clone();
    let cleanup_tx = tx.clone();
    let mut binding = scopeguard::guard(Binding::default(), move |binding| {
        if let Some(uid) = binding.uid {
            cleanup_state.release(&uid, &cleanup_tx);
        }
    });

    let result = loop {
        let bytes = match source.next().await {
            Some(Ok(Message::Text(text))) => text.as_str().as_bytes().to_vec(),
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => continue,
            Some(Err(e)) => break Err(RelayError::WebSocket(e)),
        };
        handle_frame(&state, &mut binding, &tx, &bytes);
    };

    // Release before the writer stops so the partner hears STOP promptly.
    drop(binding);
    drop(tx);
    let _ = writer.await;
    debug!("Connection {peer} closed");
    result
}

fn handle_frame(state: &RelayState, binding: &mut Binding, tx: &Outbound, bytes: &[u8]) {
    let (payload, data) = match decode_request(bytes) {
        Ok(decoded) => decoded,
        Err(e) => {
            warn!("Skipping malformed frame: {e}");
            return;
        }
    };

    let phase = payload.phase();
    if phase.is_forwarded() {
        forward(state, binding, tx, phase, &data);
        return;
    }

    match payload {
        SignalPayload::DialRequest(request) => on_dial(state, binding, tx, request),
        SignalPayload::Stop => {
            if let Some(uid) = binding.uid.take() {
                binding.partner = None;
                state.release(&uid, tx);
            }
        }
        _ => debug!("Ignoring {phase} frame"),
    }
}

fn on_dial(state: &RelayState, binding: &mut Binding, tx: &Outbound, request: DialRequest) {
    let DialRequest {
        local_id,
        remote_id,
    } = request;

    if binding.uid.is_some() {
        reply_failure(tx, SignalPhase::Dial, "invalid local uid");
        return;
    }

    // Registry and connection map change together under the registry lock,
    // so the initiator's sender is always in place before anyone pairs with it.
    let mut registry = state.registry();
    match registry.dial(&local_id, &remote_id) {
        DialOutcome::Waiting => {
            info!("{local_id} is dialing {remote_id}");
            state.connections.insert(local_id.clone(), tx.clone());
            binding.uid = Some(local_id);
            binding.partner = Some(remote_id);
        }
        DialOutcome::Paired { initiator } => {
            info!("Paired {local_id} with {initiator}");
            state.connections.insert(local_id.clone(), tx.clone());
            binding.uid = Some(local_id);
            binding.partner = Some(initiator.clone());

            if let Some(frame) = response(SignalPhase::Dial, true, "", "false") {
                let _ = tx.send(frame);
            }
            if let Some(frame) = response(SignalPhase::Dial, true, "", "true")
                && !state.send_to(&initiator, frame)
            {
                warn!("Initiator {initiator} has no connection");
            }
        }
        DialOutcome::Rejected(reason) => {
            debug!("Rejected dial {local_id} -> {remote_id}: {reason}");
            reply_failure(tx, SignalPhase::Dial, &reason.to_string());
        }
    }
}

fn forward(state: &RelayState, binding: &Binding, tx: &Outbound, phase: SignalPhase, data: &str) {
    let delivered = binding.partner.as_deref().is_some_and(|partner| {
        response(phase, true, "", data).is_some_and(|frame| state.send_to(partner, frame))
    });
    if !delivered {
        reply_failure(tx, phase, INCORRECT_PHASE);
    }
}

fn reply_failure(tx: &Outbound, phase: SignalPhase, message: &str) {
    if let Some(frame) = response(phase, false, message, NULL_DATA) {
        let _ = tx.send(frame);
    }
}

fn response(phase: SignalPhase, success: bool, message: &str, data: &str) -> Option<Message> {
    match encode_response(phase, success, message, data) {
        Ok(bytes) => String::from_utf8(bytes).ok().map(Message::text),
        Err(e) => {
            warn!("{e}");
            None
        }
    }
}
