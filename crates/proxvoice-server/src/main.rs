use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use proxvoice_server::{ServerConfig, VoiceServer};

#[derive(Parser)]
#[command(name = "proxvoice-server", about = "Positional voice coordination server")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address (IP), overrides config
    #[arg(long)]
    host: Option<String>,

    /// UDP port, overrides config
    #[arg(long)]
    port: Option<u16>,

    /// TeamSpeak server unique identifier, overrides config
    #[arg(long)]
    teamspeak_server_id: Option<String>,

    /// TeamSpeak channel id, overrides config
    #[arg(long)]
    teamspeak_channel_id: Option<u64>,

    /// TeamSpeak channel password, overrides config
    #[arg(long)]
    teamspeak_channel_password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "proxvoice_server=info".into()),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        toml::from_str(&content)?
    } else {
        ServerConfig::default()
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(server_id) = args.teamspeak_server_id {
        config.teamspeak_server_id = server_id;
    }
    if let Some(channel_id) = args.teamspeak_channel_id {
        config.teamspeak_channel_id = channel_id;
    }
    if let Some(password) = args.teamspeak_channel_password {
        config.teamspeak_channel_password = password;
    }

    info!(
        host = %config.host,
        port = config.port,
        teamspeak_channel_id = config.teamspeak_channel_id,
        "proxvoice server starting"
    );

    let server = VoiceServer::create(&config).await?;

    // Standalone mode has no game host attached: accept every client
    // and log the lifecycle.
    server.register_client_connecting_callback(|game_id, identity| {
        info!(game_id, identity, "client connecting");
        true
    });
    server.register_client_connected_callback(|game_id| {
        info!(game_id, "client connected");
    });
    server.register_client_disconnected_callback(|game_id| {
        info!(game_id, "client disconnected");
    });
    server.register_client_talking_changed_callback(|game_id, talking| {
        info!(game_id, talking, "talking changed");
    });

    info!("server ready");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    server.close().await;

    Ok(())
}
