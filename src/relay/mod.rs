//! WebSocket signaling relay.
//!
//! Two users dial each other by id. The first DIAL parks the caller; the
//! matching DIAL from the other side pairs them and tells the first dialer to
//! send the offer. From then on OFFER, ANSWER and CANDIDATE frames are
//! forwarded to the partner untouched. Leaving, either by STOP or by closing
//! the socket, sends STOP to the partner.

mod registry;
mod server;

pub use registry::{DialOutcome, DialRejection, Registry, UserState};
pub use server::RelayServer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to bind relay listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
