use std::{net::IpAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::server::ServerConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, accepting WebSocket connections on /ws.
    Serve(ServeArgs),
    /// Connect to a relay and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind to.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Browser origin allowed by CORS. Any origin is allowed when unset.
    #[arg(long, env = "FRONTEND_URL")]
    pub frontend_url: Option<String>,

    /// Refuse new connections once this many are live.
    #[arg(long, env = "MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,

    /// Events buffered per connection before further events are dropped for it.
    #[arg(long, default_value_t = 128)]
    pub outbox_capacity: usize,

    /// Seconds between keepalive pings.
    #[arg(long, default_value_t = 25)]
    pub heartbeat_secs: u64,

    /// Seconds of client silence before the connection is considered dead.
    #[arg(long, default_value_t = 45)]
    pub idle_timeout_secs: u64,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            frontend_url: args.frontend_url,
            max_connections: args.max_connections,
            outbox_capacity: args.outbox_capacity.max(1),
            heartbeat_interval: Duration::from_secs(args.heartbeat_secs.max(1)),
            idle_timeout: Duration::from_secs(args.idle_timeout_secs.max(1)),
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// WebSocket URL of the relay.
    #[arg(long, env = "RELAY_URL", default_value = "ws://127.0.0.1:8000/ws")]
    pub server: String,

    /// Room to join right after connecting.
    #[arg(long)]
    pub room: Option<String>,
}
