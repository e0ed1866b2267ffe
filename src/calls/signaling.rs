//! Signaling phase definitions.
//!
//! Every message on the relay channel is tagged with one of these phases,
//! and every inbound message drives the call state machine by its phase.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Signaling phases, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "i64")]
#[repr(u8)]
pub enum SignalPhase {
    /// Placeholder phase; never sent by either side.
    #[default]
    Init = 0,

    /// Pairing request to the relay, and the relay's pairing answer.
    Dial = 1,

    /// Session description offer from the initiating peer.
    Offer = 2,

    /// Session description answer to an offer.
    Answer = 3,

    /// Trickled ICE candidate.
    Candidate = 4,

    /// Call is over. Carries no payload.
    Stop = 5,
}

impl SignalPhase {
    /// All phases in wire order.
    pub const ALL: [SignalPhase; 6] = [
        Self::Init,
        Self::Dial,
        Self::Offer,
        Self::Answer,
        Self::Candidate,
        Self::Stop,
    ];

    /// The integer sent on the wire.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_wire(value: i64) -> Option<Self> {
        Self::ALL.into_iter().find(|p| i64::from(p.as_u8()) == value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Dial => "dial",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Stop => "stop",
        }
    }

    /// Whether the relay passes this phase through to the partner untouched.
    pub fn is_forwarded(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::Candidate)
    }
}

impl From<SignalPhase> for u8 {
    fn from(phase: SignalPhase) -> Self {
        phase.as_u8()
    }
}

impl TryFrom<i64> for SignalPhase {
    type Error = UnknownPhase;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::from_wire(value).ok_or(UnknownPhase(value))
    }
}

impl fmt::Display for SignalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownPhase(pub i64);

impl fmt::Display for UnknownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown signaling phase {}", self.0)
    }
}

impl std::error::Error for UnknownPhase {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        for (i, phase) in SignalPhase::ALL.iter().enumerate() {
            assert_eq!(phase.as_u8() as usize, i);
            assert_eq!(SignalPhase::from_wire(i as i64), Some(*phase));
        }
        assert_eq!(SignalPhase::from_wire(6), None);
        assert_eq!(SignalPhase::from_wire(-1), None);
    }

    #[test]
    fn test_serde_uses_integers() {
        assert_eq!(serde_json::to_string(&SignalPhase::Candidate).unwrap(), "4");
        let phase: SignalPhase = serde_json::from_str("2").unwrap();
        assert_eq!(phase, SignalPhase::Offer);
        assert!(serde_json::from_str::<SignalPhase>("9").is_err());
    }

    #[test]
    fn test_forwarded_phases() {
        let forwarded: Vec<_> = SignalPhase::ALL
            .into_iter()
            .filter(|p| p.is_forwarded())
            .collect();
        assert_eq!(
            forwarded,
            vec![SignalPhase::Offer, SignalPhase::Answer, SignalPhase::Candidate]
        );
    }
}
