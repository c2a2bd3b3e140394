mod chat;
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use cli::{Cli, Command};
use driftwood::ConnectionSession;
use driftwood::telemetry::logging;
use driftwood::transport::webrtc::WebRtcConnector;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("initialising logging")?;

    let config = cli.network.to_config();
    tracing::debug!(
        ice_servers = config.ice_servers.len(),
        gather_timeout = ?config.gather_timeout,
        "starting session"
    );
    let connector = Arc::new(WebRtcConnector::new(&config));
    let session = ConnectionSession::new(connector, config);
    let connect_timeout = cli.network.connect_timeout();
    let mut input = chat::stdin_lines();

    let result = match cli.command {
        Command::Offer => chat::offer(&session, &mut input, connect_timeout).await,
        Command::Join(args) => chat::join(&session, &mut input, args.token, connect_timeout).await,
    };
    session.close().await;
    result
}
