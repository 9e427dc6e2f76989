use clap::Parser;
use log::info;
use server::config::{GameMode, ServerConfig};
use server::Server;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON config file; command-line flags override its values
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to bind both channels to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// UDP port of the game channel
    #[arg(short = 'g', long)]
    game_port: Option<u16>,

    /// TCP port of the chat relay
    #[arg(short = 'p', long)]
    chat_port: Option<u16>,

    /// Simulation steps per second
    #[arg(short = 't', long)]
    tick_rate: Option<u32>,

    /// Who moves the paddles
    #[arg(short = 'm', long, value_enum)]
    mode: Option<GameMode>,

    /// Maximum number of players (1-4)
    #[arg(short = 'r', long)]
    room_cap: Option<u32>,

    /// Evict players silent for this many ticks
    #[arg(long = "idle-timeout")]
    idle_timeout_ticks: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.game_port {
            config.game_port = port;
        }
        if let Some(port) = self.chat_port {
            config.chat_port = port;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(room_cap) = self.room_cap {
            config.room_cap = room_cap;
        }
        if self.idle_timeout_ticks.is_some() {
            config.idle_timeout_ticks = self.idle_timeout_ticks;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=debug for detailed logging");
    }

    let config = Args::parse().into_config()?;

    info!("Starting server...");
    info!(
        "Game channel on {}, chat on {}",
        config.game_addr(),
        config.chat_addr()
    );
    info!(
        "Mode {:?}, room of {}, {} Hz",
        config.mode, config.room_cap, config.tick_rate
    );

    let server = Server::bind(config).await?;
    server.run().await?;

    Ok(())
}
