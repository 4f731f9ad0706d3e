//! Multi-client text relay over TCP.
//!
//! A server accepts connections and rebroadcasts every message it receives
//! to all connected clients; a client keeps one outbound connection behind a
//! small lifecycle state machine. Front ends drive the client through
//! commands and observe it through [`session::SessionEvent`]s.
//!
//! - [`codec`] frames messages as `[u32 length][sender tag][0x00][payload]`.
//! - [`connection`] owns one TCP session: a reader plus a queued writer task.
//! - [`registry`] is the server's set of open connections, keyed by minted ids.
//! - [`server`] accepts clients and fans messages out over registry snapshots.
//! - [`session`] is the client state machine and its event stream.
//! - [`cli`], [`config`] and [`client`] wire the terminal front end.

pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod registry;
pub mod server;
pub mod session;

pub use error::{ErrorKind, FramingError, RelayError};
pub use message::Message;
