//! Call configuration: the raw, user-supplied fields and their validated form.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::Uri;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid uid")]
    InvalidIdentity,

    #[error("invalid stun/turn server")]
    InvalidIceServers,

    #[error("invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Configuration fields as entered by the user, before validation.
///
/// Empty strings count as absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSessionConfig {
    #[serde(default)]
    pub local_id: String,
    #[serde(default)]
    pub remote_id: String,
    #[serde(default)]
    pub signaling_endpoint: String,
    pub stun_server_uri: Option<String>,
    pub turn_server_uri: Option<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    #[serde(default)]
    pub video_enabled: bool,
}

impl RawSessionConfig {
    /// Load raw fields from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn validate(&self) -> Result<SessionConfig, ConfigError> {
        SessionConfig::validate(self)
    }
}

/// A STUN or TURN server handed to the peer transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub uri: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            username: None,
            credential: None,
        }
    }
}

/// Validated parameters of one call attempt. Immutable once built.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    local_id: String,
    remote_id: String,
    signaling_endpoint: Uri,
    ice_servers: Vec<IceServer>,
    video_enabled: bool,
}

fn non_empty(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

impl SessionConfig {
    /// Validate raw fields. Checks run in a fixed order and the first failure wins:
    /// identities, then ICE servers, then the endpoint.
    pub fn validate(raw: &RawSessionConfig) -> Result<Self, ConfigError> {
        if raw.local_id.is_empty() || raw.remote_id.is_empty() {
            return Err(ConfigError::InvalidIdentity);
        }

        let stun = non_empty(&raw.stun_server_uri);
        let turn = non_empty(&raw.turn_server_uri);
        if stun.is_none() && turn.is_none() {
            return Err(ConfigError::InvalidIceServers);
        }

        let signaling_endpoint = parse_endpoint(&raw.signaling_endpoint)?;

        // Order matters: some transports prefer earlier entries.
        let mut ice_servers = Vec::with_capacity(2);
        if let Some(uri) = stun {
            ice_servers.push(IceServer::new(uri));
        }
        if let Some(uri) = turn {
            ice_servers.push(IceServer {
                uri: uri.to_string(),
                username: non_empty(&raw.turn_username).map(str::to_string),
                credential: non_empty(&raw.turn_credential).map(str::to_string),
            });
        }

        Ok(Self {
            local_id: raw.local_id.clone(),
            remote_id: raw.remote_id.clone(),
            signaling_endpoint,
            ice_servers,
            video_enabled: raw.video_enabled,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn signaling_endpoint(&self) -> &Uri {
        &self.signaling_endpoint
    }

    pub fn ice_servers(&self) -> &[IceServer] {
        &self.ice_servers
    }

    pub fn video_enabled(&self) -> bool {
        self.video_enabled
    }
}

fn parse_endpoint(endpoint: &str) -> Result<Uri, ConfigError> {
    let uri: Uri = endpoint
        .parse()
        .map_err(|e| ConfigError::InvalidEndpoint(format!("{endpoint:?}: {e}")))?;

    match uri.scheme_str() {
        Some("ws") | Some("wss") => {}
        _ => {
            return Err(ConfigError::InvalidEndpoint(format!(
                "{endpoint:?}: scheme must be ws or wss"
            )));
        }
    }
    if uri.host().is_none_or(str::is_empty) {
        return Err(ConfigError::InvalidEndpoint(format!(
            "{endpoint:?}: missing host"
        )));
    }

    Ok(uri)
}
