//! Call-related error types.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid call configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("camera not found")]
    NoCaptureSource,

    #[error("failed to open media capture: {0}")]
    Capture(String),

    #[error("data channel is not open")]
    DataChannelClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("call session has ended")]
    SessionClosed,
}
