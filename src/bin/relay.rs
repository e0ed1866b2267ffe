use chrono::Local;
use clap::Parser;
use peercall::relay::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "peercall-relay")]
#[command(about = "Signaling relay pairing peercall clients")]
struct Cli {
    /// Address to accept WebSocket connections on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,
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

    let cli = Cli::parse();
    RelayServer::new().listen(cli.listen.as_str()).await?;
    Ok(())
}
