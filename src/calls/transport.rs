//! Session descriptions and ICE candidates as exchanged with the peer.
//!
//! These are both the wire payloads of OFFER/ANSWER/CANDIDATE messages and
//! the values handed to the peer transport.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the offer/answer exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A session description (SDP) with its offer/answer role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// An ICE candidate received from or to be sent to the peer.
///
/// The candidate string follows RFC 8839, e.g.
/// `candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    /// Media stream identification tag of the m-line this candidate belongs to.
    #[serde(rename = "sdpMid")]
    pub sdp_mid: String,
    /// Index of that m-line in the description.
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_m_line_index: u16,
}

impl IceCandidate {
    /// Create a candidate for the first m-line.
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: "0".to_string(),
            sdp_m_line_index: 0,
        }
    }

    /// Set the SDP media ID.
    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = sdp_mid.into();
        self
    }

    /// Set the SDP media line index.
    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = index;
        self
    }
}
