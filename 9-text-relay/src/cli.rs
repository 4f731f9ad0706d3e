use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::{
    codec::DEFAULT_MAX_FRAME_LEN,
    config::{ServerConfig, SessionConfig},
    connection::DEFAULT_OUTBOUND_CAPACITY,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server, rebroadcasting every message to all clients.
    Server(ServerArgs),
    /// Connect to a relay server and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address the server should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "0.0.0.0:3200")]
    pub listen: SocketAddr,

    /// Do not send a client's own messages back to it.
    #[arg(long)]
    pub no_echo: bool,

    /// Largest frame accepted from or sent to a client.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,

    /// Frames queued for a client before it is dropped as too slow.
    #[arg(long, default_value_t = DEFAULT_OUTBOUND_CAPACITY)]
    pub outbound_queue: usize,

    /// Seconds a disconnecting client gets to receive already queued frames.
    #[arg(long, default_value_t = 10)]
    pub drain_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Server to connect to: `ip:port`, a bare IP (port 3200), or `host[:port]`.
    #[arg(long, default_value = "127.0.0.1:3200")]
    pub server: String,

    /// Seconds to wait for the connection to be established.
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Seconds to wait for the server to close after disconnecting.
    #[arg(long, default_value_t = 10)]
    pub disconnect_timeout_secs: u64,

    /// Largest frame accepted from or sent to the server.
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    pub max_frame_bytes: usize,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            listen: args.listen,
            echo_to_sender: !args.no_echo,
            max_frame_len: args.max_frame_bytes,
            outbound_capacity: args.outbound_queue,
            drain_timeout: Duration::from_secs(args.drain_timeout_secs),
        }
    }
}

impl From<&ClientArgs> for SessionConfig {
    fn from(args: &ClientArgs) -> Self {
        Self {
            connect_timeout: Duration::from_secs(args.connect_timeout_secs),
            disconnect_timeout: Duration::from_secs(args.disconnect_timeout_secs),
            max_frame_len: args.max_frame_bytes,
        }
    }
}
