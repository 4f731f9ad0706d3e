//! Client side connection lifecycle.
//!
//! ```text
//! Disconnected --connect--> Connecting --dial ok--> Connected
//!      ^                        |                      |
//!      +---- error / cancel ----+                 disconnect
//!      |                                               v
//!      +--------- peer closed / timeout ------- Disconnecting
//! ```
//!
//! Commands return immediately; outcomes are reported on the event channel
//! handed out by [`ClientSession::new`]. Errors are always emitted before the
//! state change they cause.

use std::{fmt, net::SocketAddr, sync::Arc};

use tokio::{
    net::TcpStream,
    select,
    sync::{Mutex, mpsc},
    time,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::SessionConfig,
    connection::{Connection, ConnectionReader},
    error::{ErrorKind, RelayError, Result},
    message::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(label)
    }
}

/// Everything a front end needs to render a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    MessageReceived(Message),
    Error { kind: ErrorKind, detail: String },
}

#[derive(Clone)]
pub struct ClientSession {
    shared: Arc<Shared>,
}

struct Shared {
    config: SessionConfig,
    inner: Mutex<SessionInner>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

struct SessionInner {
    state: ConnectionState,
    /// Bumped on every connect so stale dial and reader tasks can tell they
    /// belong to an earlier session.
    generation: u64,
    connection: Option<Connection>,
    dial: Option<CancellationToken>,
}

impl ClientSession {
    pub fn new(config: SessionConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let session = Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(SessionInner {
                    state: ConnectionState::Disconnected,
                    generation: 0,
                    connection: None,
                    dial: None,
                }),
                events,
            }),
        };
        (session, receiver)
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.inner.lock().await.state
    }

    /// Local address of the live connection, which doubles as the sender tag.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let inner = self.shared.inner.lock().await;
        inner.connection.as_ref().map(Connection::local_addr)
    }

    /// Starts dialing `addr`. Ignored unless the session is disconnected.
    pub async fn connect(&self, addr: SocketAddr) -> bool {
        let mut inner = self.shared.inner.lock().await;
        if inner.state != ConnectionState::Disconnected {
            debug!(state = %inner.state, %addr, "connect ignored");
            return false;
        }

        inner.generation += 1;
        let generation = inner.generation;
        let cancel = CancellationToken::new();
        inner.dial = Some(cancel.clone());
        self.shared.transition(&mut inner, ConnectionState::Connecting);
        drop(inner);

        tokio::spawn(dial(Arc::clone(&self.shared), addr, generation, cancel));
        true
    }

    /// Cancels a dial in progress or gracefully closes a live connection.
    pub async fn disconnect(&self) -> bool {
        let mut inner = self.shared.inner.lock().await;
        match inner.state {
            ConnectionState::Connecting => {
                if let Some(cancel) = inner.dial.take() {
                    cancel.cancel();
                }
                info!("connect cancelled");
                self.shared
                    .transition(&mut inner, ConnectionState::Disconnected);
                true
            }
            ConnectionState::Connected => {
                self.shared
                    .transition(&mut inner, ConnectionState::Disconnecting);
                if let Some(connection) = &inner.connection {
                    connection.finish();
                }
                tokio::spawn(disconnect_deadline(
                    Arc::clone(&self.shared),
                    inner.generation,
                ));
                true
            }
            state => {
                debug!(%state, "disconnect ignored");
                false
            }
        }
    }

    /// Queues `text` for the server. A silent no-op unless connected, or when
    /// `text` is empty.
    pub async fn send(&self, text: &str) -> bool {
        match self.try_send(text).await {
            Ok(()) => true,
            Err(RelayError::UnsupportedOperation { state, .. }) => {
                debug!(%state, "send ignored");
                false
            }
            Err(error) => {
                warn!(%error, "failed to queue message");
                if error.kind() == ErrorKind::Framing {
                    self.shared.emit_error(&error);
                }
                false
            }
        }
    }

    /// Like [`send`](Self::send) but reports why nothing was queued.
    pub async fn try_send(&self, text: &str) -> Result<()> {
        let inner = self.shared.inner.lock().await;
        let connection = match (&inner.connection, inner.state) {
            (Some(connection), ConnectionState::Connected) if !text.is_empty() => connection,
            _ => {
                return Err(RelayError::UnsupportedOperation {
                    operation: "send",
                    state: inner.state,
                });
            }
        };

        let message = Message::text(connection.local_addr().to_string(), text);
        connection.send(&message)
    }
}

impl Shared {
    fn transition(&self, inner: &mut SessionInner, next: ConnectionState) {
        if inner.state == next {
            return;
        }
        debug!(from = %inner.state, to = %next, "session state changed");
        inner.state = next;
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit_error(&self, error: &RelayError) {
        self.emit(SessionEvent::Error {
            kind: error.kind(),
            detail: error.to_string(),
        });
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("session event dropped; no subscriber");
        }
    }
}

async fn dial(shared: Arc<Shared>, addr: SocketAddr, generation: u64, cancel: CancellationToken) {
    let timeout = shared.config.connect_timeout;
    let outcome = select! {
        biased;
        _ = cancel.cancelled() => return,
        outcome = time::timeout(timeout, TcpStream::connect(addr)) => outcome,
    };

    let result = match outcome {
        Ok(Ok(stream)) => Connection::open(stream, shared.config.max_frame_len),
        Ok(Err(err)) => Err(RelayError::from_dial(addr, err, timeout)),
        Err(_) => Err(RelayError::Timeout {
            operation: "connect",
            timeout,
        }),
    };

    let mut inner = shared.inner.lock().await;
    if inner.generation != generation || inner.state != ConnectionState::Connecting {
        if let Ok((connection, _)) = &result {
            connection.close();
        }
        return;
    }
    inner.dial = None;

    match result {
        Ok((connection, reader)) => {
            info!(%addr, local = %connection.local_addr(), "connected");
            inner.connection = Some(connection.clone());
            shared.transition(&mut inner, ConnectionState::Connected);
            drop(inner);
            tokio::spawn(drive_connection(
                Arc::clone(&shared),
                connection,
                reader,
                generation,
            ));
        }
        Err(error) => {
            warn!(%addr, %error, "connect failed");
            shared.emit_error(&error);
            shared.transition(&mut inner, ConnectionState::Disconnected);
        }
    }
}

/// Delivers inbound messages until the connection ends, then settles the
/// session back into `Disconnected`.
async fn drive_connection(
    shared: Arc<Shared>,
    connection: Connection,
    mut reader: ConnectionReader,
    generation: u64,
) {
    let failure = loop {
        match reader.next_message().await {
            Some(Ok(message)) => shared.emit(SessionEvent::MessageReceived(message)),
            Some(Err(error)) => break Some(error),
            None => break None,
        }
    };
    connection.close();

    let mut inner = shared.inner.lock().await;
    if inner.generation != generation {
        return;
    }

    match inner.state {
        ConnectionState::Connected => {
            let error = failure.unwrap_or(RelayError::TransportClosed);
            warn!(%error, "connection lost");
            shared.emit_error(&error);
        }
        ConnectionState::Disconnecting => {
            if let Some(error) = failure {
                debug!(%error, "error while disconnecting");
            }
            info!("disconnected");
        }
        _ => return,
    }
    inner.connection = None;
    shared.transition(&mut inner, ConnectionState::Disconnected);
}

async fn disconnect_deadline(shared: Arc<Shared>, generation: u64) {
    let timeout = shared.config.disconnect_timeout;
    time::sleep(timeout).await;

    let inner = shared.inner.lock().await;
    if inner.generation != generation || inner.state != ConnectionState::Disconnecting {
        return;
    }

    let error = RelayError::Timeout {
        operation: "disconnect",
        timeout,
    };
    warn!(%error, "peer did not close in time");
    shared.emit_error(&error);
    if let Some(connection) = &inner.connection {
        connection.close();
    }
}
