use chrono::Local;
use clap::Parser;
use log::{info, warn};
use peercall::calls::media::{NoCaptureBackend, WebRtcTransportFactory};
use peercall::calls::{CallDeps, CallListener, CallOptions, CallSession, StopReason};
use peercall::config::RawSessionConfig;
use peercall::transport::TokioWebSocketChannelFactory;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

// Place one call through a relay and chat over its data channel.
//
// Usage:
//   cargo run -- --local-id alice --remote-id bob --endpoint ws://127.0.0.1:8080/ \
//       --stun stun:stun.l.google.com:19302
//   cargo run -- --config call.json

#[derive(Parser, Debug)]
#[command(name = "peercall")]
#[command(about = "Two-party call client for a peercall relay")]
struct Cli {
    /// JSON file with the call configuration. Flags override its fields.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    local_id: Option<String>,

    #[arg(long)]
    remote_id: Option<String>,

    /// Relay WebSocket URL
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long)]
    stun: Option<String>,

    #[arg(long)]
    turn: Option<String>,

    #[arg(long)]
    turn_user: Option<String>,

    #[arg(long)]
    turn_credential: Option<String>,

    /// Send video from the front camera
    #[arg(long)]
    video: bool,
}

impl Cli {
    fn raw_config(self) -> Result<RawSessionConfig, anyhow::Error> {
        let mut raw = match &self.config {
            Some(path) => RawSessionConfig::from_json_file(path)?,
            None => RawSessionConfig::default(),
        };
        if let Some(local_id) = self.local_id {
            raw.local_id = local_id;
        }
        if let Some(remote_id) = self.remote_id {
            raw.remote_id = remote_id;
        }
        if let Some(endpoint) = self.endpoint {
            raw.signaling_endpoint = endpoint;
        }
        raw.stun_server_uri = self.stun.or(raw.stun_server_uri);
        raw.turn_server_uri = self.turn.or(raw.turn_server_uri);
        raw.turn_username = self.turn_user.or(raw.turn_username);
        raw.turn_credential = self.turn_credential.or(raw.turn_credential);
        raw.video_enabled |= self.video;
        Ok(raw)
    }
}

struct ConsoleListener;

impl CallListener for ConsoleListener {
    fn on_connected(&self) {
        println!("* connected, type to chat");
    }

    fn on_data_message(&self, message: &str) {
        println!("< {message}");
    }

    fn on_stopped(&self, reason: &StopReason) {
        println!("* call ended: {reason}");
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let raw = Cli::parse().raw_config()?;

    let deps = CallDeps {
        channels: Arc::new(TokioWebSocketChannelFactory::new()),
        transports: Arc::new(WebRtcTransportFactory::new()),
        capture: Arc::new(NoCaptureBackend),
        local_sink: None,
        remote_sink: None,
    };
    let handle = CallSession::new(deps, Arc::new(ConsoleListener), CallOptions::default())
        .start(&raw)
        .await?;

    let input = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.is_empty() {
                    continue;
                }
                if let Err(e) = handle.send_data(&line).await {
                    warn!("Message not sent: {e}");
                }
            }
        })
    };

    tokio::select! {
        reason = handle.closed() => info!("Call finished: {reason}"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, stopping call");
            handle.stop().await;
        }
    }

    input.abort();
    Ok(())
}
