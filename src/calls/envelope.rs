//! Signaling envelope encoding and decoding.
//!
//! Frames on the relay channel are JSON objects whose `data` field is itself
//! a JSON document serialized into a string:
//!
//! ```text
//! client -> relay: { "phase": 1, "data": "{\"uid\":\"a\",\"ruid\":\"b\"}" }
//! relay -> client: { "phase": 1, "success": true, "message": "", "data": "true" }
//! ```
//!
//! The shape of `data` depends on the phase; decoding matches on the phase
//! and parses the payload into the corresponding [`SignalPayload`] variant.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::signaling::SignalPhase;
use super::transport::{IceCandidate, SdpType, SessionDescription};

/// Data sent with phases that carry no payload.
const EMPTY_DATA: &str = "null";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("unknown signaling phase {0}")]
    UnknownPhase(i64),

    #[error("invalid {phase} payload: {source}")]
    InvalidPayload {
        phase: SignalPhase,
        #[source]
        source: serde_json::Error,
    },

    #[error("{phase} message carries a description of type {found}")]
    DescriptionMismatch { phase: SignalPhase, found: SdpType },
}

#[derive(Debug, Error)]
#[error("failed to encode {phase} message: {source}")]
pub struct EncodeError {
    pub phase: SignalPhase,
    #[source]
    pub source: serde_json::Error,
}

/// Pairing request sent to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialRequest {
    #[serde(rename = "uid")]
    pub local_id: String,
    #[serde(rename = "ruid")]
    pub remote_id: String,
}

/// Phase-specific payload of a signaling message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalPayload {
    Init,
    /// Client to relay: who we are and who we want to talk to.
    DialRequest(DialRequest),
    /// Relay to client: pairing done; `initiator` tells whether we send the offer.
    DialResponse { initiator: bool },
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
    Stop,
}

impl SignalPayload {
    pub fn phase(&self) -> SignalPhase {
        match self {
            Self::Init => SignalPhase::Init,
            Self::DialRequest(_) | Self::DialResponse { .. } => SignalPhase::Dial,
            Self::Offer(_) => SignalPhase::Offer,
            Self::Answer(_) => SignalPhase::Answer,
            Self::Candidate(_) => SignalPhase::Candidate,
            Self::Stop => SignalPhase::Stop,
        }
    }

    /// Wrap a local description in the payload matching its type.
    pub fn description(description: SessionDescription) -> Self {
        match description.sdp_type {
            SdpType::Offer => Self::Offer(description),
            SdpType::Answer => Self::Answer(description),
        }
    }
}

/// A decoded message from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub phase: SignalPhase,
    pub success: bool,
    /// Human-readable reason set by the relay, usually only on failure.
    pub message: String,
    /// Present only when `success` is true.
    pub payload: Option<SignalPayload>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RequestFrame {
    phase: i64,
    data: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ResponseFrame {
    phase: i64,
    success: bool,
    #[serde(default)]
    message: String,
    data: String,
}

/// Serialize a payload into the string carried in the `data` field.
pub fn payload_data(payload: &SignalPayload) -> Result<String, EncodeError> {
    let phase = payload.phase();
    let wrap = |source| EncodeError { phase, source };
    match payload {
        SignalPayload::Init | SignalPayload::Stop => Ok(EMPTY_DATA.to_string()),
        SignalPayload::DialRequest(req) => serde_json::to_string(req).map_err(wrap),
        SignalPayload::DialResponse { initiator } => {
            serde_json::to_string(initiator).map_err(wrap)
        }
        SignalPayload::Offer(desc) | SignalPayload::Answer(desc) => {
            serde_json::to_string(desc).map_err(wrap)
        }
        SignalPayload::Candidate(candidate) => serde_json::to_string(candidate).map_err(wrap),
    }
}

/// Encode a client-to-relay frame.
pub fn encode(payload: &SignalPayload) -> Result<Vec<u8>, EncodeError> {
    let phase = payload.phase();
    let frame = RequestFrame {
        phase: i64::from(phase.as_u8()),
        data: payload_data(payload)?,
    };
    serde_json::to_vec(&frame).map_err(|source| EncodeError { phase, source })
}

/// Encode a relay-to-client frame. `data` is already the serialized payload.
pub fn encode_response(
    phase: SignalPhase,
    success: bool,
    message: &str,
    data: &str,
) -> Result<Vec<u8>, EncodeError> {
    let frame = ResponseFrame {
        phase: i64::from(phase.as_u8()),
        success,
        message: message.to_string(),
        data: data.to_string(),
    };
    serde_json::to_vec(&frame).map_err(|source| EncodeError { phase, source })
}

/// Decode a relay-to-client frame.
pub fn decode(bytes: &[u8]) -> Result<SignalEnvelope, DecodeError> {
    let frame: ResponseFrame = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
    let phase =
        SignalPhase::from_wire(frame.phase).ok_or(DecodeError::UnknownPhase(frame.phase))?;

    let payload = if frame.success {
        Some(decode_payload(phase, &frame.data, Direction::FromRelay)?)
    } else {
        None
    };

    Ok(SignalEnvelope {
        phase,
        success: frame.success,
        message: frame.message,
        payload,
    })
}

/// Decode a client-to-relay frame. Returns the phase and the raw `data`
/// string alongside the payload so the relay can forward it untouched.
pub fn decode_request(bytes: &[u8]) -> Result<(SignalPayload, String), DecodeError> {
    let frame: RequestFrame = serde_json::from_slice(bytes).map_err(DecodeError::Malformed)?;
    let phase =
        SignalPhase::from_wire(frame.phase).ok_or(DecodeError::UnknownPhase(frame.phase))?;
    let payload = decode_payload(phase, &frame.data, Direction::ToRelay)?;
    Ok((payload, frame.data))
}

#[derive(Clone, Copy)]
enum Direction {
    ToRelay,
    FromRelay,
}

fn decode_payload(
    phase: SignalPhase,
    data: &str,
    direction: Direction,
) -> Result<SignalPayload, DecodeError> {
    match phase {
        SignalPhase::Init => Ok(SignalPayload::Init),
        SignalPhase::Stop => Ok(SignalPayload::Stop),
        SignalPhase::Dial => match direction {
            Direction::ToRelay => parse(phase, data).map(SignalPayload::DialRequest),
            Direction::FromRelay => {
                parse(phase, data).map(|initiator| SignalPayload::DialResponse { initiator })
            }
        },
        SignalPhase::Offer => parse_description(phase, data, SdpType::Offer).map(SignalPayload::Offer),
        SignalPhase::Answer => {
            parse_description(phase, data, SdpType::Answer).map(SignalPayload::Answer)
        }
        SignalPhase::Candidate => parse(phase, data).map(SignalPayload::Candidate),
    }
}

fn parse<T: DeserializeOwned>(phase: SignalPhase, data: &str) -> Result<T, DecodeError> {
    serde_json::from_str(data).map_err(|source| DecodeError::InvalidPayload { phase, source })
}

fn parse_description(
    phase: SignalPhase,
    data: &str,
    expected: SdpType,
) -> Result<SessionDescription, DecodeError> {
    let desc: SessionDescription = parse(phase, data)?;
    if desc.sdp_type != expected {
        return Err(DecodeError::DescriptionMismatch {
            phase,
            found: desc.sdp_type,
        });
    }
    Ok(desc)
}
