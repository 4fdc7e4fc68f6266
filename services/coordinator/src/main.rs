use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use rescuenet_coordination::Coordinator;
use rescuenet_core::logging;
use rescuenet_link::{WsServer, PROTOCOL_VERSION};

mod cli;

use cli::Args;

#[derive(Debug, Serialize)]
struct VersionHandshake {
    version: &'static str,
    protocol_version: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.version_json {
        let handshake = VersionHandshake {
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: PROTOCOL_VERSION,
        };
        println!("{}", serde_json::to_string(&handshake)?);
        return Ok(());
    }

    let config = args.load_config().context("loading configuration")?;
    if config.json_logs {
        logging::init_json(&args.log_level);
    } else {
        logging::init(&args.log_level);
    }

    info!(
        listen = %config.listen_addr,
        claim_grace_ms = config.claim_grace_ms,
        participant_timeout_ms = config.participant_timeout_ms,
        sweep_interval_ms = config.sweep_interval_ms,
        "Starting RescueNet coordinator"
    );

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    let coordinator = Arc::new(Coordinator::new(config)?);
    let sweeper = tokio::spawn(coordinator.clone().run_sweeper());

    let server = Arc::new(WsServer::new(coordinator));
    server
        .run_with_shutdown(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    sweeper.abort();
    info!("Coordinator stopped");
    Ok(())
}
