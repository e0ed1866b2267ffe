/// Tokio-based WebSocket signaling channel for peercall
///
/// This crate provides the channel seam the call session talks through
/// (`SignalingChannel` / `ChannelFactory`) and a concrete implementation
/// using tokio-tungstenite.
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

/// An event produced by the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The channel is open and ready to send.
    Opened,
    /// A text or binary message arrived from the relay.
    MessageReceived(Bytes),
    /// The channel closed. Emitted at most once, and never together with `Error`.
    Closed { code: u16, reason: String },
    /// The channel failed. Emitted at most once, and never together with `Closed`.
    Error(String),
}

/// Represents an open duplex message channel to the relay.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Sends one message to the relay.
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error>;

    /// Closes the channel. Calling it again is a no-op.
    async fn close(&self);
}

/// A factory responsible for opening channels.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Connects to `endpoint` and returns the channel with its event stream.
    /// The first event on a successful connect is `ChannelEvent::Opened`.
    async fn connect(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<ChannelEvent>), anyhow::Error>;
}

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Tokio-based WebSocket channel
pub struct TokioWebSocketChannel {
    ws_sink: Arc<Mutex<Option<WsSink>>>,
}

impl TokioWebSocketChannel {
    fn new(sink: WsSink) -> Self {
        Self {
            ws_sink: Arc::new(Mutex::new(Some(sink))),
        }
    }
}

#[async_trait]
impl SignalingChannel for TokioWebSocketChannel {
    async fn send(&self, data: &[u8]) -> Result<(), anyhow::Error> {
        let mut sink_guard = self.ws_sink.lock().await;
        let sink = sink_guard
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Socket is closed"))?;

        let text = std::str::from_utf8(data)
            .map_err(|e| anyhow::anyhow!("Signaling frames must be UTF-8: {}", e))?;

        debug!("--> Sending message: {} bytes", data.len());
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket send error: {}", e))?;
        Ok(())
    }

    async fn close(&self) {
        let sink = self.ws_sink.lock().await.take();
        if let Some(mut sink) = sink {
            if let Err(e) = sink.close().await {
                debug!("WebSocket close: {}", e);
            }
        }
    }
}

/// Factory for creating Tokio WebSocket channels
pub struct TokioWebSocketChannelFactory;

impl TokioWebSocketChannelFactory {
    /// Create a new factory instance
    pub fn new() -> Self {
        Self
    }
}

impl Default for TokioWebSocketChannelFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChannelFactory for TokioWebSocketChannelFactory {
    async fn connect(
        &self,
        endpoint: &str,
    ) -> Result<(Arc<dyn SignalingChannel>, mpsc::Receiver<ChannelEvent>), anyhow::Error> {
        info!("Dialing {endpoint}");
        let (client, _response) = connect_async(endpoint)
            .await
            .map_err(|e| anyhow::anyhow!("WebSocket connect failed: {}", e))?;

        let (sink, stream) = client.split();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let channel = Arc::new(TokioWebSocketChannel::new(sink));

        // Opened must be queued before the read pump can report anything.
        event_tx
            .send(ChannelEvent::Opened)
            .await
            .map_err(|_| anyhow::anyhow!("Event receiver dropped"))?;

        tokio::task::spawn(read_pump(stream, event_tx));

        Ok((channel, event_rx))
    }
}

async fn read_pump(mut stream: WsStream, event_tx: mpsc::Sender<ChannelEvent>) {
    let terminal = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                debug!("<-- Received text message: {} bytes", text.len());
                let data = Bytes::copy_from_slice(text.as_bytes());
                if event_tx
                    .send(ChannelEvent::MessageReceived(data))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    return;
                }
            }
            Some(Ok(Message::Binary(data))) => {
                debug!("<-- Received binary message: {} bytes", data.len());
                if event_tx
                    .send(ChannelEvent::MessageReceived(data))
                    .await
                    .is_err()
                {
                    warn!("Event receiver dropped, closing read pump");
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => {
                trace!("Received close frame: {:?}", frame);
                break match frame {
                    Some(frame) => ChannelEvent::Closed {
                        code: u16::from(frame.code),
                        reason: frame.reason.as_str().to_owned(),
                    },
                    None => ChannelEvent::Closed {
                        code: u16::from(CloseCode::Status),
                        reason: String::new(),
                    },
                };
            }
            Some(Ok(_)) => {
                // ping/pong are answered by tungstenite
            }
            Some(Err(e)) => {
                warn!("Error reading from websocket: {e}");
                break ChannelEvent::Error(e.to_string());
            }
            None => {
                trace!("Websocket stream ended");
                break ChannelEvent::Closed {
                    code: u16::from(CloseCode::Abnormal),
                    reason: "stream ended".to_string(),
                };
            }
        }
    };

    let _ = event_tx.send(terminal).await;
}
