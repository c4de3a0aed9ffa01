// SPDX-License-Identifier: MIT OR Apache-2.0

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use stateres_core::RoomVersion;
use stateres_shim::{Config, Server};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

pub fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .ok();
}

/// Resolve room state for a remote peer over a WebSocket.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Address to listen on.
    #[arg(short = 'b', long, value_name = "ADDR", default_value = "0.0.0.0:1234")]
    bind: SocketAddr,

    /// Seconds to wait for the remote to answer a single event request.
    #[arg(long, value_name = "SECONDS", default_value_t = 30)]
    fetch_timeout_secs: u64,

    /// Maximum number of resolution tasks running at once per connection.
    #[arg(long, value_name = "COUNT", default_value_t = 128)]
    max_concurrent_resolutions: usize,

    /// Room version assumed for requests naming an unknown one.
    #[arg(long, value_name = "VERSION", default_value = "10")]
    default_room_version: RoomVersion,

    /// Reject fetched events whose content doesn't match their id.
    #[arg(long, action)]
    verify_event_ids: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();

    let args = Args::parse();

    match std::env::var("COMMIT") {
        Ok(commit) => info!(%commit, "starting stateres-shim"),
        Err(_) => info!("starting stateres-shim"),
    }

    let config = Config::new()
        .bind_addr(args.bind)
        .fetch_timeout(Duration::from_secs(args.fetch_timeout_secs))
        .max_concurrent_resolutions(args.max_concurrent_resolutions)
        .default_room_version(args.default_room_version)
        .verify_event_ids(args.verify_event_ids);

    let server = Server::bind(config).await?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(%err, "could not listen for ctrl-c");
                return;
            }
            info!("received ctrl-c, shutting down");
            shutdown.cancel();
        });
    }

    server.run(shutdown).await?;

    Ok(())
}
