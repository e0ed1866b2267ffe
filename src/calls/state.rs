//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Why a call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StopReason {
    /// `stop()` was called locally.
    LocalStop,
    /// The peer (through the relay) sent STOP.
    RemoteStop,
    /// The relay refused to pair us; carries the relay's message.
    DialRejected(String),
    /// The signaling channel closed under us.
    ChannelClosed { code: u16, reason: String },
    /// The signaling channel failed, or a send on it did.
    ChannelError(String),
    /// Connecting the signaling channel failed.
    ConnectFailed(String),
    /// Creating or applying a session description failed, or the transport failed.
    NegotiationFailed(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalStop => f.write_str("stopped locally"),
            Self::RemoteStop => f.write_str("stopped by peer"),
            Self::DialRejected(message) => write!(f, "dial rejected: {message}"),
            Self::ChannelClosed { code, reason } => {
                write!(f, "signaling channel closed ({code}): {reason}")
            }
            Self::ChannelError(e) => write!(f, "signaling channel error: {e}"),
            Self::ConnectFailed(e) => write!(f, "signaling connect failed: {e}"),
            Self::NegotiationFailed(e) => write!(f, "negotiation failed: {e}"),
        }
    }
}

/// Current state of a call.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Constructed, `start()` not called yet.
    #[default]
    Idle,
    /// Config validated, local media acquired, channel opening.
    Connecting { started_at: DateTime<Utc> },
    /// Channel open, DIAL sent, waiting for the relay to pair us.
    AwaitingDial { opened_at: DateTime<Utc> },
    /// Paired; transport session exists and descriptions are being exchanged.
    Negotiating {
        initiator: bool,
        paired_at: DateTime<Utc>,
    },
    /// Remote media is flowing.
    Active {
        initiator: bool,
        connected_at: DateTime<Utc>,
    },
    /// Call over. Terminal.
    Closed {
        reason: StopReason,
        closed_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed { .. })
    }

    /// Whether the transport session exists in this state.
    pub fn has_transport(&self) -> bool {
        matches!(self, Self::Negotiating { .. } | Self::Active { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Connecting { .. } => "Connecting",
            Self::AwaitingDial { .. } => "AwaitingDial",
            Self::Negotiating { .. } => "Negotiating",
            Self::Active { .. } => "Active",
            Self::Closed { .. } => "Closed",
        }
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        match self {
            Self::Closed { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    Start,
    ChannelOpened,
    DialAccepted { initiator: bool },
    RemoteStreamAdded,
    Terminated { reason: StopReason },
}

impl CallState {
    /// Compute the state after `transition`, or reject it.
    pub fn apply(&self, transition: CallTransition) -> Result<CallState, InvalidTransition> {
        let next = match (self, transition) {
            (Self::Idle, CallTransition::Start) => Self::Connecting {
                started_at: Utc::now(),
            },
            (Self::Connecting { .. }, CallTransition::ChannelOpened) => Self::AwaitingDial {
                opened_at: Utc::now(),
            },
            (Self::AwaitingDial { .. }, CallTransition::DialAccepted { initiator }) => {
                Self::Negotiating {
                    initiator,
                    paired_at: Utc::now(),
                }
            }
            (Self::Negotiating { initiator, .. }, CallTransition::RemoteStreamAdded) => {
                Self::Active {
                    initiator: *initiator,
                    connected_at: Utc::now(),
                }
            }
            (Self::Active { .. }, CallTransition::RemoteStreamAdded) => self.clone(),
            (Self::Active { connected_at, .. }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now()
                    .signed_duration_since(*connected_at)
                    .num_seconds();
                Self::Closed {
                    reason,
                    closed_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (Self::Closed { .. }, transition) => {
                return Err(InvalidTransition {
                    current_state: self.name().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
            (_, CallTransition::Terminated { reason }) => Self::Closed {
                reason,
                closed_at: Utc::now(),
                duration_secs: None,
            },
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: current.name().to_string(),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        Ok(next)
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
