use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use chordal::Peer;

#[derive(Parser, Debug)]
#[command(name = "chordal")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to serve on, as IP:PORT.
    #[arg(short, long, default_value = "127.0.0.1:5055")]
    bind: String,

    /// Existing ring member to join through (IP:PORT). Without this the
    /// peer starts a fresh ring.
    #[arg(short, long)]
    gateway: Option<String>,

    /// Seconds between status log lines.
    #[arg(short, long, default_value = "30")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let (addr, port) = args
        .bind
        .rsplit_once(':')
        .context("--bind must be IP:PORT")?;
    let port: u16 = port.parse().context("--bind port is not a number")?;

    let peer = Peer::new(addr, port);
    info!("peer identity: {}", peer.id());

    match &args.gateway {
        Some(gateway) => peer.join(gateway).await?,
        None => peer.start_chord().await?,
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));
    interval.tick().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                match peer.leave().await {
                    Ok(()) => info!("left the ring"),
                    Err(err) => {
                        info!(error = %err, "graceful leave failed, killing");
                        peer.kill();
                    }
                }
                break;
            }
            _ = interval.tick() => {
                info!(
                    stored_keys = peer.stored_key_count(),
                    successors = peer.successor_count(),
                    predecessor = ?peer.predecessor().map(|p| p.id.to_hex()),
                    "status"
                );
            }
        }
    }

    Ok(())
}
