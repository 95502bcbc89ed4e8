//! Standalone relay binary.
//!
//! Runs the SOCKS5 ingress and the egress peer in one process, linked by
//! the in-process transport pair. Useful for local testing without a real
//! peer connection.
//!
//! Usage: sprelay-standalone [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to JSON configuration file
//!   -p, --port <PORT>    Listen on 127.0.0.1:<PORT> with defaults
//!   -h, --help           Print help information

use std::env;

use sprelay::egress::Egress;
use sprelay::peer::pair;
use sprelay::{Endpoint, Relay, RelayConfig, RelayConfigFile};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    let config = match args.get(1).map(String::as_str) {
        Some("-h") | Some("--help") | None => {
            print_usage();
            return Ok(());
        }
        Some("-c") | Some("--config") => {
            let path = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("--config requires a file path"))?;
            load_config(path)?
        }
        Some("-p") | Some("--port") => {
            let port: u16 = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("--port requires a port number"))?
                .parse()?;
            RelayConfig::new(Endpoint::new("127.0.0.1", port))
        }
        Some(other) => {
            eprintln!("Unknown option: {}", other);
            print_usage();
            return Ok(());
        }
    };

    run_relay(config).await
}

fn print_usage() {
    println!(
        r#"sprelay-standalone - SOCKS5 relay with in-process egress

USAGE:
    sprelay-standalone [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Path to JSON configuration file
    -p, --port <PORT>    Listen on 127.0.0.1:<PORT> with defaults
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "listen_addr": "127.0.0.1",
        "listen_port": 1080,
        "max_connections": 1048576,
        "obfuscate": false
    }}

EXAMPLES:
    Quick start on port 1080:
        sprelay-standalone --port 1080

    With a config file:
        sprelay-standalone --config relay.json
"#
    );
}

fn load_config(path: &str) -> anyhow::Result<RelayConfig> {
    let content = std::fs::read_to_string(path)?;
    let file: RelayConfigFile = serde_json::from_str(&content)?;
    file.to_config().map_err(|e| anyhow::anyhow!(e))
}

async fn run_relay(config: RelayConfig) -> anyhow::Result<()> {
    let (ingress_transport, egress_transport) = pair();
    let _egress = Egress::start(egress_transport)?;

    let relay = Relay::open(&config, ingress_transport)?;
    let bound = relay.once_ready().await?;
    tracing::info!("SOCKS5 relay ready on {}", bound);
    tracing::info!("Press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
        _ = relay.once_stopped() => {}
    }

    relay.stop().await;
    let metrics = relay.metrics();
    tracing::info!(
        "totals: {} bytes to peer, {} bytes from peer",
        metrics.bytes_sent_to_peer.total(),
        metrics.bytes_received_from_peer.total()
    );
    Ok(())
}
