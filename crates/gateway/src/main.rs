use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::net::TcpListener;

use seabridge_gateway::{status, ChannelConfig, ChannelEmulator};

/// Emulated acoustic channel serving Evologics-style modem connections
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address modem sessions connect to
    #[arg(long, default_value = "0.0.0.0:9200")]
    modems: SocketAddr,

    /// Address of the status page
    #[arg(long, default_value = "0.0.0.0:8080")]
    http: SocketAddr,

    /// Channel settings as JSON; missing fields keep their defaults
    #[arg(short, long)]
    config: Option<PathBuf>,
}

fn load_config(path: Option<&PathBuf>) -> Result<ChannelConfig> {
    let Some(path) = path else {
        return Ok(ChannelConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;
    info!("channel config: {:?}", config);
    let emulator = ChannelEmulator::start(config)?;

    let modems = TcpListener::bind(args.modems).await?;
    tokio::spawn(emulator.clone().serve_modems(modems));

    let listener = TcpListener::bind(args.http).await?;
    info!("status page on http://{}", args.http);
    axum::serve(listener, status::router(emulator)).await?;

    Ok(())
}
