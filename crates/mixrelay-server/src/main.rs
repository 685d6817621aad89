//! Mixrelay server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate (development)
//! mixrelay-server --bind 0.0.0.0:8080
//!
//! # Start with TLS certificate (production)
//! mixrelay-server --bind 0.0.0.0:8080 --cert cert.pem --key key.pem --pool-size 5
//! ```

use std::{path::PathBuf, time::Duration};

use clap::Parser;
use mixrelay_server::{PoolCapacity, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Mixrelay pool relay server
#[derive(Parser, Debug)]
#[command(name = "mixrelay-server")]
#[command(about = "Pool/session relay server for coin-shuffle clients")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// Path to TLS certificate chain (PEM format)
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Seats per pool (at least 2)
    #[arg(long, default_value = "5")]
    pool_size: u32,

    /// Largest accepted packet in bytes
    #[arg(long, default_value = "65536")]
    max_frame_size: usize,

    /// Seconds allowed for a TLS handshake
    #[arg(long, default_value = "10")]
    handshake_timeout_secs: u64,

    /// Seconds allowed for writing one packet to a peer
    #[arg(long, default_value = "10")]
    write_timeout_secs: u64,

    /// Outbound packets queued per peer before it is dropped
    #[arg(long, default_value = "256")]
    mailbox_capacity: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Mixrelay server starting");
    tracing::info!("Binding to {}", args.bind);

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        pool_capacity: PoolCapacity::try_from(args.pool_size)?,
        max_frame_len: args.max_frame_size,
        handshake_timeout: Duration::from_secs(args.handshake_timeout_secs),
        write_timeout: Duration::from_secs(args.write_timeout_secs),
        mailbox_capacity: args.mailbox_capacity,
    };

    tracing::info!("Pools seat {} peers", config.pool_capacity.get());

    let server = Server::bind(config).await?;

    tracing::info!("Server listening on {}", server.local_addr()?);

    server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}
