use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use peercall::calls::media::{
    MediaStream, MediaTrack, NoCaptureBackend, PeerEvent, PeerTransportFactory,
    WebRtcTransportFactory,
};
use peercall::calls::{
    CallDeps, CallHandle, CallOptions, CallSession, CallState, DialRequest, IceCandidate,
    SessionDescription, SignalEnvelope, SignalPayload, SignalPhase, StopReason, decode, encode,
    payload_data,
};
use peercall::relay::RelayServer;
use peercall::test_utils::{
    EventLog, FakePeerTransportFactory, RecordingListener, raw_config, wait_until,
};
use peercall::transport::TokioWebSocketChannelFactory;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(150);

async fn start_relay() -> (String, RelayServer) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RelayServer::new();
    tokio::spawn(server.clone().serve(listener));
    (format!("ws://{addr}/"), server)
}

/// A bare relay client speaking the wire format directly.
struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Client {
    async fn connect(url: &str) -> Self {
        let (ws, _) = connect_async(url).await.unwrap();
        Self { ws }
    }

    async fn send_text(&mut self, text: &str) {
        self.ws.send(Message::text(text.to_owned())).await.unwrap();
    }

    async fn send(&mut self, payload: &SignalPayload) {
        let bytes = encode(payload).unwrap();
        self.send_text(&String::from_utf8(bytes).unwrap()).await;
    }

    async fn dial(&mut self, uid: &str, ruid: &str) {
        self.send(&SignalPayload::DialRequest(DialRequest {
            local_id: uid.into(),
            remote_id: ruid.into(),
        }))
        .await;
    }

    async fn next_text(&mut self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, self.ws.next()).await.ok()?;
            match next {
                Some(Ok(Message::Text(text))) => return Some(text.as_str().to_owned()),
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
                Some(Ok(_)) => continue,
            }
        }
    }

    async fn recv_raw(&mut self) -> serde_json::Value {
        let text = self.next_text(RECV_TIMEOUT).await.expect("relay frame");
        serde_json::from_str(&text).unwrap()
    }

    async fn recv(&mut self) -> SignalEnvelope {
        let text = self.next_text(RECV_TIMEOUT).await.expect("relay frame");
        decode(text.as_bytes()).unwrap()
    }

    async fn expect_quiet(&mut self) {
        if let Some(text) = self.next_text(QUIET_PERIOD).await {
            panic!("unexpected frame: {text}");
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

async fn paired(url: &str) -> (Client, Client) {
    let mut alice = Client::connect(url).await;
    let mut bob = Client::connect(url).await;
    alice.dial("alice", "bob").await;
    alice.expect_quiet().await;
    bob.dial("bob", "alice").await;
    bob.recv().await;
    alice.recv().await;
    (alice, bob)
}

fn assert_failure(envelope: &SignalEnvelope, phase: SignalPhase, message: &str) {
    assert_eq!(envelope.phase, phase);
    assert!(!envelope.success);
    assert_eq!(envelope.message, message);
    assert_eq!(envelope.payload, None);
}

#[tokio::test]
async fn test_first_dialer_is_told_to_initiate() {
    let (url, server) = start_relay().await;
    let mut alice = Client::connect(&url).await;
    let mut bob = Client::connect(&url).await;

    alice.dial("alice", "bob").await;
    alice.expect_quiet().await;
    assert_eq!(server.user_count(), 2);

    bob.dial("bob", "alice").await;
    assert_eq!(
        bob.recv().await.payload,
        Some(SignalPayload::DialResponse { initiator: false })
    );
    assert_eq!(
        alice.recv().await.payload,
        Some(SignalPayload::DialResponse { initiator: true })
    );
}

#[tokio::test]
async fn test_busy_users_are_rejected() {
    let (url, _server) = start_relay().await;
    let (_alice, _bob) = paired(&url).await;

    let mut carol = Client::connect(&url).await;
    carol.dial("carol", "alice").await;
    assert_failure(&carol.recv().await, SignalPhase::Dial, "invalid remote uid");

    let mut impostor = Client::connect(&url).await;
    impostor.dial("alice", "dave").await;
    assert_failure(&impostor.recv().await, SignalPhase::Dial, "invalid local uid");
}

#[tokio::test]
async fn test_dialing_the_wrong_partner_is_rejected() {
    let (url, _server) = start_relay().await;
    let mut alice = Client::connect(&url).await;
    let mut bob = Client::connect(&url).await;

    alice.dial("alice", "bob").await;
    bob.dial("bob", "carol").await;

    assert_failure(&bob.recv().await, SignalPhase::Dial, "invalid remote uid");
    alice.expect_quiet().await;
}

#[tokio::test]
async fn test_negotiation_frames_are_forwarded_verbatim() {
    let (url, _server) = start_relay().await;
    let (mut alice, mut bob) = paired(&url).await;

    let spaced = r#"{"type": "offer",  "sdp": "v=0\r\n"}"#;
    let frame = serde_json::json!({ "phase": 2, "data": spaced }).to_string();
    alice.send_text(&frame).await;
    let forwarded = bob.recv_raw().await;
    assert_eq!(forwarded["phase"], 2);
    assert_eq!(forwarded["success"], true);
    assert_eq!(forwarded["data"], spaced);

    let answer = SignalPayload::Answer(SessionDescription::answer("v=0\r\ns=bob\r\n"));
    bob.send(&answer).await;
    let received = alice.recv_raw().await;
    assert_eq!(received["data"], payload_data(&answer).unwrap());

    let candidate = SignalPayload::Candidate(
        IceCandidate::new("candidate:1 1 UDP 2130706431 10.0.0.2 9000 typ host")
            .with_sdp_mid("0")
            .with_sdp_m_line_index(0),
    );
    bob.send(&candidate).await;
    assert_eq!(alice.recv().await.payload, Some(candidate));
}

#[tokio::test]
async fn test_forwarding_without_partner_fails() {
    let (url, _server) = start_relay().await;
    let mut alice = Client::connect(&url).await;

    alice
        .send(&SignalPayload::Offer(SessionDescription::offer("v=0\r\n")))
        .await;
    assert_failure(&alice.recv().await, SignalPhase::Offer, "incorrect phase");

    // dialed, but the partner has not connected yet
    alice.dial("alice", "bob").await;
    alice
        .send(&SignalPayload::Candidate(IceCandidate::new("candidate:1")))
        .await;
    assert_failure(&alice.recv().await, SignalPhase::Candidate, "incorrect phase");
}

#[tokio::test]
async fn test_disconnect_sends_stop_to_partner() {
    let (url, server) = start_relay().await;
    let (alice, mut bob) = paired(&url).await;

    alice.close().await;

    let stop = bob.recv().await;
    assert_eq!(stop.phase, SignalPhase::Stop);
    assert!(stop.success);
    assert!(wait_until(|| server.user_count() == 1).await);

    bob.close().await;
    assert!(wait_until(|| server.user_count() == 0).await);
}

#[tokio::test]
async fn test_client_stop_is_relayed() {
    let (url, server) = start_relay().await;
    let (mut alice, mut bob) = paired(&url).await;

    alice.send(&SignalPayload::Stop).await;

    assert_eq!(bob.recv().await.payload, Some(SignalPayload::Stop));
    assert!(wait_until(|| server.user_count() == 1).await);

    // alice is free again and can start a new pairing
    alice.dial("alice", "carol").await;
    alice.expect_quiet().await;
}

#[tokio::test]
async fn test_waiting_dialer_leaving_frees_both_ids() {
    let (url, server) = start_relay().await;
    let mut alice = Client::connect(&url).await;
    alice.dial("alice", "bob").await;
    alice.expect_quiet().await;
    assert_eq!(server.user_count(), 2);

    alice.close().await;
    assert!(wait_until(|| server.user_count() == 0).await);
}

#[tokio::test]
async fn test_simultaneous_dials_pair_every_couple() {
    let (url, server) = start_relay().await;

    let couples = (0..16).map(|i| {
        let url = url.clone();
        tokio::spawn(async move {
            let (left, right) = (format!("left{i}"), format!("right{i}"));
            let mut a = Client::connect(&url).await;
            let mut b = Client::connect(&url).await;
            tokio::join!(a.dial(&left, &right), b.dial(&right, &left));
            let (a_resp, b_resp) = tokio::join!(a.recv(), b.recv());
            (a_resp.payload, b_resp.payload, a, b)
        })
    });

    let mut clients = Vec::new();
    for couple in futures_util::future::join_all(couples).await {
        let (a_payload, b_payload, a, b) = couple.unwrap();
        let flags = [a_payload, b_payload].map(|payload| match payload {
            Some(SignalPayload::DialResponse { initiator }) => initiator,
            other => panic!("expected a dial response, got {other:?}"),
        });
        assert_eq!(flags.iter().filter(|initiator| **initiator).count(), 1);
        clients.push((a, b));
    }
    assert_eq!(server.user_count(), 32);
}

#[tokio::test]
async fn test_reclaimed_uid_keeps_its_new_connection() {
    let (url, server) = start_relay().await;

    for _ in 0..8 {
        let mut old = Client::connect(&url).await;
        old.dial("alice", "bob").await;
        old.expect_quiet().await;
        old.close().await;

        // the old release may still be running; retry until the id is free
        let mut alice = Client::connect(&url).await;
        loop {
            alice.dial("alice", "bob").await;
            match alice.next_text(QUIET_PERIOD).await {
                None => break,
                Some(text) => {
                    let envelope = decode(text.as_bytes()).unwrap();
                    assert_failure(&envelope, SignalPhase::Dial, "invalid local uid");
                }
            }
        }

        let mut bob = Client::connect(&url).await;
        bob.dial("bob", "alice").await;
        assert_eq!(
            bob.recv().await.payload,
            Some(SignalPayload::DialResponse { initiator: false })
        );
        assert_eq!(
            alice.recv().await.payload,
            Some(SignalPayload::DialResponse { initiator: true })
        );

        alice.close().await;
        bob.close().await;
        assert!(wait_until(|| server.user_count() == 0).await);
    }
}

#[tokio::test]
async fn test_malformed_frames_are_skipped() {
    let (url, _server) = start_relay().await;
    let mut alice = Client::connect(&url).await;
    let mut bob = Client::connect(&url).await;

    alice.send_text("garbage").await;
    alice.send_text(r#"{"phase":9,"data":"null"}"#).await;
    alice.send_text(r#"{"phase":1,"data":"{\"uid\":1}"}"#).await;
    alice.expect_quiet().await;

    alice.dial("alice", "bob").await;
    bob.dial("bob", "alice").await;
    assert_eq!(
        alice.recv().await.payload,
        Some(SignalPayload::DialResponse { initiator: true })
    );
}

struct Peer {
    log: EventLog,
    transports: Arc<FakePeerTransportFactory>,
    listener: Arc<RecordingListener>,
    handle: CallHandle,
}

async fn start_peer(url: &str, local: &str, remote: &str) -> Peer {
    let log = EventLog::default();
    let transports = Arc::new(FakePeerTransportFactory::new(log.clone()));
    let (listener, handle) = start_call(url, local, remote, transports.clone(), &log).await;
    Peer {
        log,
        transports,
        listener,
        handle,
    }
}

async fn start_call(
    url: &str,
    local: &str,
    remote: &str,
    transports: Arc<dyn PeerTransportFactory>,
    log: &EventLog,
) -> (Arc<RecordingListener>, CallHandle) {
    let listener = Arc::new(RecordingListener::new(log.clone()));
    let deps = CallDeps {
        channels: Arc::new(TokioWebSocketChannelFactory::new()),
        transports,
        capture: Arc::new(NoCaptureBackend),
        local_sink: None,
        remote_sink: None,
    };
    let mut raw = raw_config(local, remote);
    raw.signaling_endpoint = url.to_string();

    let handle = CallSession::new(deps, listener.clone(), CallOptions::default())
        .start(&raw)
        .await
        .expect("call should start");
    (listener, handle)
}

#[tokio::test]
async fn test_two_calls_connect_through_relay() {
    let (url, server) = start_relay().await;

    let alice = start_peer(&url, "alice", "bob").await;
    alice
        .handle
        .wait_for_state(|s| matches!(s, CallState::AwaitingDial { .. }))
        .await;
    assert!(wait_until(|| server.user_count() == 2).await);

    let bob = start_peer(&url, "bob", "alice").await;

    // alice dialed first, so she offers and bob answers
    assert!(wait_until(|| bob.log.count("transport.set_local_description:answer") == 1).await);
    assert!(wait_until(|| alice.log.count("transport.set_remote_description:answer") == 1).await);
    assert_eq!(alice.log.count("transport.create_local_description:offer"), 1);
    assert_eq!(bob.log.count("transport.set_remote_description:offer"), 1);
    assert_eq!(bob.log.count("transport.create_local_description:offer"), 0);

    let candidate = IceCandidate::new("candidate:7 1 UDP 2130706431 10.0.0.7 9000 typ host")
        .with_sdp_mid("0")
        .with_sdp_m_line_index(0);
    bob.transports
        .emit(PeerEvent::LocalCandidate(candidate.clone()))
        .await;
    let alice_transport = alice.transports.transport().expect("alice has a transport");
    assert!(wait_until(|| alice_transport.remote_candidates() == vec![candidate.clone()]).await);

    for peer in [&alice, &bob] {
        peer.transports.emit(PeerEvent::DataChannelOpen).await;
        peer.transports
            .emit(PeerEvent::RemoteStreamAdded(
                MediaStream::new("ls").with_track(MediaTrack::audio("a0")),
            ))
            .await;
        peer.handle.wait_for_state(CallState::is_active).await;
        assert_eq!(peer.listener.connected_count(), 1);
    }

    alice.handle.stop().await;

    assert_eq!(bob.handle.closed().await, StopReason::RemoteStop);
    assert_eq!(bob.listener.stop_reasons(), vec![StopReason::RemoteStop]);
    assert_eq!(alice.listener.stop_reasons(), vec![StopReason::LocalStop]);
    assert!(wait_until(|| server.user_count() == 0).await);
}

#[tokio::test]
async fn test_webrtc_calls_go_active_and_exchange_data() {
    let (url, _server) = start_relay().await;
    let transports: Arc<dyn PeerTransportFactory> = Arc::new(WebRtcTransportFactory::new());

    let alice_log = EventLog::default();
    let (alice_listener, alice) =
        start_call(&url, "alice", "bob", transports.clone(), &alice_log).await;
    alice
        .wait_for_state(|s| matches!(s, CallState::AwaitingDial { .. }))
        .await;
    let bob_log = EventLog::default();
    let (bob_listener, bob) = start_call(&url, "bob", "alice", transports, &bob_log).await;

    for handle in [&alice, &bob] {
        tokio::time::timeout(
            Duration::from_secs(10),
            handle.wait_for_state(CallState::is_active),
        )
        .await
        .expect("call should go active");
    }
    assert_eq!(alice_listener.connected_count(), 1);
    assert_eq!(bob_listener.connected_count(), 1);

    // The data channel opens once ICE and DTLS finish over loopback.
    let sent = tokio::time::timeout(Duration::from_secs(20), async {
        while alice.send_data("hello bob").await.is_err() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    assert!(sent.is_ok(), "data channel never opened");
    let delivered = tokio::time::timeout(Duration::from_secs(10), async {
        while bob_listener.data_messages().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "message never arrived");
    assert_eq!(bob_listener.data_messages(), vec!["hello bob".to_string()]);

    alice.stop().await;
    assert_eq!(bob.closed().await, StopReason::RemoteStop);
}
