use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{
    codec::MessageCodec,
    config::ServerConfig,
    connection::{Connection, ConnectionReader},
    error::{RelayError, Result},
    message::Message,
    registry::{ConnectionId, ConnectionRegistry},
};

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<ServerState>,
    handlers: TaskTracker,
}

impl RelayServer {
    /// Binds the listening socket. Failure here is fatal for the server.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.listen,
                source,
            })?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            state: Arc::new(ServerState::new(config)),
            handlers: TaskTracker::new(),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Accepts clients until `shutdown` resolves, then closes every
    /// connection and waits for their handlers to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            listener,
            state,
            handlers,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&state).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &handlers);
                }
            }
        }

        handlers.close();
        handlers.wait().await;
        debug!("all connection handlers finished");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Read-only view of a running server.
#[derive(Clone)]
pub struct ServerHandle {
    state: Arc<ServerState>,
}

impl ServerHandle {
    pub async fn connection_count(&self) -> usize {
        self.state.registry.len().await
    }
}

async fn handle_shutdown(state: &ServerState) {
    info!("relay shutting down");
    let closed = state
        .registry
        .for_each(|_, connection| connection.close())
        .await;
    debug!(closed, "closed open connections");
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<ServerState>,
    handlers: &TaskTracker,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, state, handlers),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<ServerState>,
    handlers: &TaskTracker,
) {
    let state = Arc::clone(state);
    handlers.spawn(async move {
        if let Err(err) = handle_connection(stream, &state).await {
            warn!(%peer, error = %err, "connection closed with error");
        }
    });
}

struct ServerState {
    registry: ConnectionRegistry<Connection>,
    codec: MessageCodec,
    echo_to_sender: bool,
    outbound_capacity: usize,
    drain_timeout: Duration,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            codec: MessageCodec::new(config.max_frame_len),
            echo_to_sender: config.echo_to_sender,
            outbound_capacity: config.outbound_capacity,
            drain_timeout: config.drain_timeout,
        }
    }

    /// Delivers `message` to every member of a registry snapshot and returns
    /// how many connections it was queued on.
    async fn broadcast(&self, sender: ConnectionId, message: &Message) -> usize {
        let frame = match self.codec.encode_frame(message) {
            Ok(frame) => frame,
            Err(error) => {
                warn!(%sender, %error, "dropping message that cannot be re-encoded");
                return 0;
            }
        };

        let mut delivered = 0;
        self.registry
            .for_each(|id, connection| {
                if id == sender && !self.echo_to_sender {
                    return;
                }
                match connection.send_frame(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(error) => debug!(%id, %error, "skipping closed connection"),
                }
            })
            .await;
        delivered
    }
}

async fn handle_connection(stream: TcpStream, state: &ServerState) -> Result<()> {
    let (connection, mut reader) = Connection::open_with_capacity(
        stream,
        state.codec.max_frame_len(),
        state.outbound_capacity,
    )?;
    let peer = connection.peer_addr();
    let id = state.registry.insert(connection.clone()).await;
    let clients = state.registry.len().await;
    info!(%id, %peer, clients, "client connected");

    let outcome = relay_messages(state, id, &mut reader).await;
    cleanup_connection(state, id, &connection, outcome.is_ok()).await;

    outcome
}

async fn relay_messages(
    state: &ServerState,
    id: ConnectionId,
    reader: &mut ConnectionReader,
) -> Result<()> {
    while let Some(frame) = reader.next_message().await {
        let message = frame?;
        debug!(
            %id,
            sender_tag = %message.sender_tag,
            bytes = message.payload.len(),
            "relaying message"
        );
        state.broadcast(id, &message).await;
    }
    Ok(())
}

/// Unregisters first so no later broadcast pass can target the connection.
/// A peer that closed cleanly still gets the frames already queued for it.
async fn cleanup_connection(
    state: &ServerState,
    id: ConnectionId,
    connection: &Connection,
    graceful: bool,
) {
    if state.registry.remove(id).await.is_some() {
        let clients = state.registry.len().await;
        info!(
            %id,
            peer = %connection.peer_addr(),
            clients,
            "client disconnected"
        );
    }
    if graceful {
        connection.shutdown(state.drain_timeout).await;
    } else {
        connection.close();
    }
}
