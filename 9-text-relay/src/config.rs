use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::{Context, Result};

use crate::{codec::DEFAULT_MAX_FRAME_LEN, connection::DEFAULT_OUTBOUND_CAPACITY};

/// Well-known relay port.
pub const DEFAULT_PORT: u16 = 3200;

/// Bound applied to both dialing out and graceful disconnects.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Whether a sender receives its own messages back.
    pub echo_to_sender: bool,
    pub max_frame_len: usize,
    /// Frames held for a client before it is dropped as too slow.
    pub outbound_capacity: usize,
    /// How long a closing client gets to receive what is already queued.
    pub drain_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            echo_to_sender: true,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            drain_timeout: DEFAULT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_TIMEOUT,
            disconnect_timeout: DEFAULT_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Resolves a user supplied server address.
///
/// Accepts `ip:port`, a bare IP address (the well-known port is implied), or
/// a host name with an optional port.
pub async fn resolve_server_address(input: &str) -> Result<SocketAddr> {
    let input = input.trim();
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    let target = if input.contains(':') {
        input.to_string()
    } else {
        format!("{input}:{DEFAULT_PORT}")
    };
    tokio::net::lookup_host(&target)
        .await
        .with_context(|| format!("failed to resolve {target}"))?
        .next()
        .with_context(|| format!("{target} did not resolve to any address"))
}
