use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use driftwood::config::{IceServer, SessionConfig};
use driftwood::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "driftwood",
    about = "Serverless peer-to-peer chat over copy-pasted WebRTC tokens",
    author,
    version
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(flatten)]
    pub network: NetworkArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create an offer token, then wait for the peer's answer token on stdin
    Offer,
    /// Answer a peer's offer token
    Join(JoinArgs),
}

#[derive(Args, Debug)]
pub struct JoinArgs {
    /// Offer token; read from stdin when omitted
    pub token: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "DRIFTWOOD_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "DRIFTWOOD_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct NetworkArgs {
    #[arg(
        long = "ice-server",
        value_name = "URL",
        global = true,
        help = "STUN/TURN server url; repeat for several (overrides DRIFTWOOD_ICE_SERVERS)"
    )]
    pub ice_servers: Vec<String>,

    #[arg(
        long = "host-only",
        global = true,
        conflicts_with = "ice_servers",
        help = "Skip STUN/TURN and gather host candidates only"
    )]
    pub host_only: bool,

    #[arg(
        long = "gather-timeout-ms",
        value_name = "MS",
        global = true,
        help = "Give up on candidate gathering after this many milliseconds"
    )]
    pub gather_timeout_ms: Option<u64>,

    #[arg(
        long = "connect-timeout-secs",
        value_name = "SECS",
        global = true,
        default_value_t = 60,
        help = "How long to wait for the data channel to open"
    )]
    pub connect_timeout_secs: u64,
}

impl NetworkArgs {
    pub fn to_config(&self) -> SessionConfig {
        let mut config = if self.host_only {
            SessionConfig::localhost()
        } else {
            SessionConfig::from_env()
        };
        if !self.ice_servers.is_empty() {
            config = config.with_ice_servers(
                self.ice_servers.iter().map(IceServer::new).collect(),
            );
        }
        if let Some(ms) = self.gather_timeout_ms.filter(|ms| *ms > 0) {
            config = config.with_gather_timeout(Duration::from_millis(ms));
        }
        config
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
