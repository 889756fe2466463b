mod card;
mod config;
mod connection;
mod lobby;
mod player;
mod protocol;
mod room;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::server::start_server;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    info!("starting blackjack server");

    tokio::select! {
        result = start_server(config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, stopping server");
            Ok(())
        }
    }
}
