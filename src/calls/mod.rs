//! Two-party calls set up over a signaling relay.
//!
//! A call exchanges session descriptions and ICE candidates with the remote
//! peer through the relay, then hands over to a peer-to-peer transport.
//!
//! # Architecture
//!
//! - [`SignalPhase`]: the six phases every relay message is tagged with
//! - [`envelope`]: encoding and decoding of relay messages
//! - [`CallState`] & [`CallTransition`]: the call state machine
//! - [`CallSession`] & [`CallHandle`]: one running call and its controls
//! - [`DataChannelBridge`]: in-band text between the peers
//! - [`media`]: the peer transport seam, capture and the webrtc-rs transport
//!
//! # Call flow
//!
//! 1. The signaling channel opens and a DIAL names both parties
//! 2. The relay pairs the two dialers and tells the first one to initiate
//! 3. The initiator sends an OFFER, the other side replies with an ANSWER
//! 4. Candidates trickle both ways in any order
//! 5. Remote media arrives and the call is connected
//! 6. STOP, a closed channel or a local stop ends the call

pub mod data_channel;
pub mod envelope;
mod error;
pub mod media;
pub mod session;
mod signaling;
mod state;
mod transport;

pub use data_channel::DataChannelBridge;
pub use envelope::{
    DecodeError, DialRequest, EncodeError, SignalEnvelope, SignalPayload, decode, decode_request,
    encode, encode_response, payload_data,
};
pub use error::CallError;
pub use session::{CallDeps, CallHandle, CallListener, CallOptions, CallSession};
pub use signaling::{SignalPhase, UnknownPhase};
pub use state::{CallState, CallTransition, InvalidTransition, StopReason};
pub use transport::{IceCandidate, SdpType, SessionDescription};
