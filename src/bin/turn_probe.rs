use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use turn_relay::{init_logging, Candidate, RelayConfig, RelayEvent, RelayPort};

#[derive(Parser, Debug)]
#[command(author, version, about = "TURN relay probe", long_about = None)]
struct Args {
    /// TURN server (host, host:port, or [ipv6]:port)
    #[arg(required_unless_present = "config")]
    server: Option<String>,

    /// Long-term credential username
    #[arg(short, long, required_unless_present = "config")]
    username: Option<String>,

    /// Long-term credential password
    #[arg(short, long, required_unless_present = "config")]
    password: Option<String>,

    /// JSON file with the full relay configuration; replaces the
    /// server/credential/port flags
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Peer to open a relayed connection to
    #[arg(long)]
    peer: Option<SocketAddr>,

    /// Payload sent to the peer once the relay is up
    #[arg(long, default_value = "ping")]
    message: String,

    /// Lowest local port to bind (0 = OS-assigned)
    #[arg(long, default_value_t = 0)]
    min_port: u16,

    /// Highest local port to bind (0 = OS-assigned)
    #[arg(long, default_value_t = 0)]
    max_port: u16,

    /// Seconds to wait for relayed data before giving up
    #[arg(long, default_value_t = 10)]
    wait: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<RelayConfig> {
    if let Some(path) = &args.config {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        return serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display()));
    }
    // clap requires these when --config is absent.
    let server = args.server.as_deref().unwrap_or_default();
    let username = args.username.as_deref().unwrap_or_default();
    let password = args.password.as_deref().unwrap_or_default();
    Ok(RelayConfig::new(server, username, password)
        .with_port_range(args.min_port, args.max_port))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    let config = load_config(&args)?;

    let (mut port, mut events) = RelayPort::bind(config).await?;
    println!("Local socket: {}", port.local_addr());

    port.prepare_address().await;
    let handle = port.handle();
    tokio::spawn(async move {
        if let Err(e) = port.run().await {
            tracing::warn!("Relay port stopped: {}", e);
        }
    });

    // Wait for the allocation verdict.
    let relayed = loop {
        match events.recv().await {
            Some(RelayEvent::AddressReady { relayed }) => break relayed,
            Some(RelayEvent::AddressError) => anyhow::bail!("relay allocation failed"),
            Some(other) => {
                println!("Event before allocation: {:?}", other);
            }
            None => anyhow::bail!("relay port closed unexpectedly"),
        }
    };
    println!("Relayed address: {}", relayed);

    if let Some(peer) = args.peer {
        let connection = handle
            .create_connection(Candidate::udp(peer))
            .await?
            .ok_or_else(|| anyhow::anyhow!("candidate {} was rejected", peer))?;

        connection.send(args.message.as_bytes())?;
        println!(
            "Sent {} bytes to {} through the relay",
            args.message.len(),
            peer
        );

        let mut connection = connection;
        match tokio::time::timeout(Duration::from_secs(args.wait), connection.recv()).await {
            Ok(Some(data)) => println!(
                "Received {} bytes: {}",
                data.len(),
                String::from_utf8_lossy(&data)
            ),
            Ok(None) => println!("Connection closed"),
            Err(_) => println!("No relayed data within {}s", args.wait),
        }
    } else {
        println!("Holding the allocation; press Ctrl-C to release it");
        tokio::signal::ctrl_c().await?;
    }

    handle.close();
    Ok(())
}
