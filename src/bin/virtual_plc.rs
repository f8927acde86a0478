/// Virtual PLC
///
/// Serves a simulated controller for any supported protocol.
///
/// ```text
/// virtual_plc <config.yaml|config.json>
/// virtual_plc <protocol> [bind address]
/// ```

use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info};
use tokio::signal;
use tokio::time::interval;

use voltage_plc::{PlcServer, ProtocolKind, ServerConfig};

fn usage() -> String {
    let protocols: Vec<&str> = ProtocolKind::ALL.iter().map(|kind| kind.as_str()).collect();
    format!(
        "usage: virtual_plc <config.yaml|config.json>\n       virtual_plc <protocol> [bind address]\nprotocols: {}",
        protocols.join(", ")
    )
}

fn load_config() -> Result<ServerConfig> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let first = match args.first() {
        Some(first) => first,
        None => bail!(usage()),
    };

    if first.ends_with(".yaml") || first.ends_with(".yml") || first.ends_with(".json") {
        return ServerConfig::from_file(first).with_context(|| format!("loading {}", first));
    }

    let protocol: ProtocolKind = first.parse().with_context(usage)?;
    let bind = args.get(1).cloned().unwrap_or_else(|| match protocol {
        ProtocolKind::FinsTcp | ProtocolKind::FinsUdp => "0.0.0.0:9600".to_string(),
        _ => "0.0.0.0:5000".to_string(),
    });
    Ok(ServerConfig {
        protocol,
        bind,
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let config = load_config()?;
    let mut server = config.build_server()?;

    info!("🚀 Starting {} virtual PLC", config.protocol);
    let local = server.start().await?;
    info!("📍 Listening on {} ({:?})", local, config.transport());
    info!("   Device regions: {:?}", server.memory().codes());
    if !config.read_only.is_empty() {
        info!("   Read-only devices: {}", config.read_only.join(", "));
    }
    if !config.writes_enabled {
        info!("   Writes disabled");
    }

    let mut ticker = interval(Duration::from_secs(30));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = server.get_stats();
                info!(
                    "📊 connections {} requests {} ok {} closed {} rx {} B tx {} B",
                    stats.connections_count,
                    stats.total_requests,
                    stats.successful_requests,
                    stats.failed_requests,
                    stats.bytes_received,
                    stats.bytes_sent
                );
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("🛑 Received interrupt signal, stopping server..."),
                    Err(err) => error!("Failed to listen for interrupt signal: {}", err),
                }
                break;
            }
        }
    }

    server.stop().await?;

    let stats = server.get_stats();
    info!("📊 Final server statistics:");
    info!("   Total connections: {}", stats.connections_count);
    info!("   Rejected connections: {}", stats.rejected_connections);
    info!("   Total requests: {}", stats.total_requests);
    info!("   Successful requests: {}", stats.successful_requests);
    info!("   Closed sessions: {}", stats.failed_requests);
    info!("   Bytes received: {} bytes", stats.bytes_received);
    info!("   Bytes sent: {} bytes", stats.bytes_sent);
    info!("   Uptime: {} seconds", stats.uptime_seconds);
    Ok(())
}
