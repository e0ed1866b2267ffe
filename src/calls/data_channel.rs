//! In-band text channel between the two peers.

use log::debug;
use std::sync::Arc;

use super::CallError;
use super::media::PeerTransport;
use super::session::CallListener;

/// Forwards opaque text payloads between the transport's data channel and
/// the call listener. Opened when the call becomes active.
pub struct DataChannelBridge {
    transport: Arc<dyn PeerTransport>,
    ready: bool,
    closed: bool,
}

impl DataChannelBridge {
    /// `ready` is whether the transport already reported the channel open.
    pub fn open(transport: Arc<dyn PeerTransport>, ready: bool) -> Self {
        Self {
            transport,
            ready,
            closed: false,
        }
    }

    pub fn mark_ready(&mut self) {
        self.ready = true;
    }

    pub fn is_ready(&self) -> bool {
        self.ready && !self.closed
    }

    pub async fn send(&self, text: &str) -> Result<(), CallError> {
        if !self.is_ready() {
            return Err(CallError::DataChannelClosed);
        }
        self.transport
            .send_data(text)
            .await
            .map_err(|e| CallError::Transport(e.to_string()))
    }

    /// Hand an inbound payload to the listener.
    pub fn deliver(&self, text: &str, listener: &dyn CallListener) {
        if self.closed {
            debug!("Dropping data message after bridge close");
            return;
        }
        listener.on_data_message(text);
    }

    pub fn close(&mut self) {
        self.closed = true;
        self.ready = false;
    }
}
