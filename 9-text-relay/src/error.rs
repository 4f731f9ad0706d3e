use std::{fmt, io, net::SocketAddr, time::Duration};

use thiserror::Error;

use crate::session::ConnectionState;

/// Coarse classification of every failure the relay can report to a front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Refused,
    HostUnreachable,
    Timeout,
    Framing,
    TransportClosed,
    Bind,
    UnsupportedOperation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Refused => "connection refused",
            ErrorKind::HostUnreachable => "host unreachable",
            ErrorKind::Timeout => "timed out",
            ErrorKind::Framing => "malformed frame",
            ErrorKind::TransportClosed => "connection closed",
            ErrorKind::Bind => "bind failed",
            ErrorKind::UnsupportedOperation => "unsupported operation",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },

    #[error("frame is missing the sender tag separator")]
    MissingSeparator,

    #[error("sender tag is not valid UTF-8")]
    InvalidSenderTag,

    #[error("sender tag must not contain a NUL byte")]
    NulInSenderTag,
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("connection to {0} was refused")]
    Refused(SocketAddr),

    #[error("host {addr} is unreachable: {source}")]
    HostUnreachable {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("{operation} timed out after {}s", .timeout.as_secs_f32())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("malformed frame: {0}")]
    Framing(#[from] FramingError),

    #[error("connection closed by peer")]
    TransportClosed,

    #[error("{peer} is not reading; {capacity} frames already queued")]
    Backlogged { peer: SocketAddr, capacity: usize },

    #[error("couldn't listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("cannot {operation} while {state}")]
    UnsupportedOperation {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Classifies an error returned by an outbound dial bounded by `timeout`.
    pub fn from_dial(addr: SocketAddr, err: io::Error, timeout: Duration) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => RelayError::Refused(addr),
            io::ErrorKind::TimedOut => RelayError::Timeout {
                operation: "connect",
                timeout,
            },
            _ => RelayError::HostUnreachable { addr, source: err },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Refused(_) => ErrorKind::Refused,
            RelayError::HostUnreachable { .. } => ErrorKind::HostUnreachable,
            RelayError::Timeout { .. } => ErrorKind::Timeout,
            RelayError::Framing(_) => ErrorKind::Framing,
            RelayError::TransportClosed | RelayError::Backlogged { .. } | RelayError::Io(_) => {
                ErrorKind::TransportClosed
            }
            RelayError::Bind { .. } => ErrorKind::Bind,
            RelayError::UnsupportedOperation { .. } => ErrorKind::UnsupportedOperation,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
