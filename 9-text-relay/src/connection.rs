//! One live TCP session, seen from either end.
//!
//! The socket is split in two: a spawned writer task owns the write half and
//! drains a bounded outbound queue, while the owner of the
//! [`ConnectionReader`] pulls decoded messages off the read half. Both halves
//! stop as soon as the connection is closed.
//!
//! A peer that stops reading is closed once its queue is full rather than
//! left to buffer without limit.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::StreamExt;
use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
    sync::mpsc::{self, error::TrySendError},
    time,
};
use tokio_util::{codec::FramedRead, sync::CancellationToken};
use tracing::{debug, trace, warn};

use crate::{
    codec::MessageCodec,
    error::{RelayError, Result},
    message::Message,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl LinkState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => LinkState::Open,
            1 => LinkState::Closing,
            _ => LinkState::Closed,
        }
    }
}

/// Frames a connection may hold for a slow peer before it is dropped.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 128;

/// Cheap, cloneable handle to a connection's outbound side.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    codec: MessageCodec,
    outbound: mpsc::Sender<Bytes>,
    outbound_capacity: usize,
    state: AtomicU8,
    cancel: CancellationToken,
    /// Tells the writer to shut down the write half once the queue is empty.
    finish: CancellationToken,
    /// Cancelled once the writer task has exited.
    writer_done: CancellationToken,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("peer_addr", &self.inner.peer_addr)
            .field("local_addr", &self.inner.local_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Takes ownership of `stream` and starts its writer task.
    pub fn open(stream: TcpStream, max_frame_len: usize) -> Result<(Self, ConnectionReader)> {
        Self::open_with_capacity(stream, max_frame_len, DEFAULT_OUTBOUND_CAPACITY)
    }

    /// Like [`Connection::open`], holding at most `outbound_capacity` frames
    /// for the peer.
    pub fn open_with_capacity(
        stream: TcpStream,
        max_frame_len: usize,
        outbound_capacity: usize,
    ) -> Result<(Self, ConnectionReader)> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        if let Err(error) = stream.set_nodelay(true) {
            debug!(peer = %peer_addr, ?error, "failed to disable nagle");
        }

        let codec = MessageCodec::new(max_frame_len);
        let (reader, writer) = stream.into_split();
        let outbound_capacity = outbound_capacity.max(1);
        let (outbound, queue) = mpsc::channel(outbound_capacity);
        let cancel = CancellationToken::new();
        let finish = CancellationToken::new();
        let writer_done = CancellationToken::new();

        tokio::spawn(write_loop(
            writer,
            queue,
            cancel.clone(),
            finish.clone(),
            writer_done.clone(),
            peer_addr,
        ));

        let connection = Self {
            inner: Arc::new(Inner {
                peer_addr,
                local_addr,
                codec,
                outbound,
                outbound_capacity,
                state: AtomicU8::new(LinkState::Open as u8),
                cancel: cancel.clone(),
                finish,
                writer_done,
            }),
        };
        let reader = ConnectionReader {
            frames: FramedRead::new(reader, codec),
            cancel,
        };

        Ok((connection, reader))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == LinkState::Open
    }

    /// Encodes `message` and queues it for transmission.
    pub fn send(&self, message: &Message) -> Result<()> {
        let frame = self.inner.codec.encode_frame(message)?;
        self.send_frame(frame)
    }

    /// Queues an already encoded frame. Never waits for the socket.
    ///
    /// When the queue is full the peer is considered stuck: the connection is
    /// closed and [`RelayError::Backlogged`] returned.
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(RelayError::TransportClosed);
        }
        match self.inner.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    peer = %self.inner.peer_addr,
                    capacity = self.inner.outbound_capacity,
                    "outbound queue full, dropping connection"
                );
                self.close();
                Err(RelayError::Backlogged {
                    peer: self.inner.peer_addr,
                    capacity: self.inner.outbound_capacity,
                })
            }
            Err(TrySendError::Closed(_)) => Err(RelayError::TransportClosed),
        }
    }

    /// Starts a graceful close: frames already queued are still written, then
    /// the write half is shut down. Reading continues until the peer closes.
    ///
    /// Returns `false` if the connection was not open.
    pub fn finish(&self) -> bool {
        let swapped = self.inner.state.compare_exchange(
            LinkState::Open as u8,
            LinkState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_err() {
            return false;
        }
        self.inner.finish.cancel();
        true
    }

    /// Flushes queued frames, waits up to `within` for the writer to finish,
    /// then closes.
    pub async fn shutdown(&self, within: Duration) {
        self.finish();
        if time::timeout(within, self.inner.writer_done.cancelled())
            .await
            .is_err()
        {
            debug!(peer = %self.inner.peer_addr, "outbound queue not flushed in time");
        }
        self.close();
    }

    /// Closes the connection and releases the socket. Calling it again has
    /// no further effect.
    pub fn close(&self) {
        let previous = self
            .inner
            .state
            .swap(LinkState::Closed as u8, Ordering::AcqRel);
        if LinkState::from_u8(previous) != LinkState::Closed {
            trace!(peer = %self.inner.peer_addr, "closing connection");
            self.inner.cancel.cancel();
        }
    }
}

/// Read side of a [`Connection`].
pub struct ConnectionReader {
    frames: FramedRead<OwnedReadHalf, MessageCodec>,
    cancel: CancellationToken,
}

impl ConnectionReader {
    /// Waits for the next decoded message.
    ///
    /// Returns `None` once the peer closes its side or the connection is
    /// closed locally. Cancel safe.
    pub async fn next_message(&mut self) -> Option<Result<Message>> {
        select! {
            biased;
            _ = self.cancel.cancelled() => None,
            frame = self.frames.next() => frame,
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    finish: CancellationToken,
    writer_done: CancellationToken,
    peer: SocketAddr,
) {
    let _done = writer_done.drop_guard();
    loop {
        // Queued frames win over `finish` so a graceful close drains first.
        let frame = select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = finish.cancelled() => {
                if let Err(error) = writer.shutdown().await {
                    debug!(%peer, ?error, "failed to shut down write half");
                }
                break;
            }
        };

        let written = select! {
            _ = cancel.cancelled() => break,
            written = writer.write_all(&frame) => written,
        };
        if let Err(error) = written {
            debug!(%peer, ?error, "failed to write frame");
            cancel.cancel();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    use super::*;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (client, _server) = socket_pair().await;
        let (connection, mut reader) = Connection::open(client, 1024).unwrap();

        connection.close();
        connection.close();

        assert_eq!(connection.state(), LinkState::Closed);
        assert!(reader.next_message().await.is_none());
        assert!(!connection.finish());
    }

    #[tokio::test]
    async fn send_after_close_is_rejected() {
        let (client, _server) = socket_pair().await;
        let (connection, _reader) = Connection::open(client, 1024).unwrap();

        connection.close();
        let result = connection.send(&Message::text("me", "too late"));
        assert!(matches!(result, Err(RelayError::TransportClosed)));
    }

    #[tokio::test]
    async fn messages_arrive_in_enqueue_order() {
        let (client, server) = socket_pair().await;
        let (sender, _sender_reader) = Connection::open(client, 1024).unwrap();
        let (_receiver, mut receiver_reader) = Connection::open(server, 1024).unwrap();

        for index in 0..20 {
            sender
                .send(&Message::text("sender", &format!("message {index}")))
                .unwrap();
        }

        for index in 0..20 {
            let message = timeout(Duration::from_secs(1), receiver_reader.next_message())
                .await
                .expect("message within a second")
                .expect("stream open")
                .expect("valid frame");
            assert_eq!(message.payload_text(), format!("message {index}"));
        }
    }

    #[tokio::test]
    async fn finish_flushes_queued_frames_before_eof() {
        let (client, mut server) = socket_pair().await;
        let (connection, _reader) = Connection::open(client, 1024).unwrap();

        let message = Message::text("a", "last words");
        let expected = MessageCodec::new(1024).encode_frame(&message).unwrap();
        connection.send(&message).unwrap();
        assert!(connection.finish());
        assert_eq!(connection.state(), LinkState::Closing);
        assert!(connection.send(&message).is_err());

        let mut received = Vec::new();
        timeout(Duration::from_secs(1), server.read_to_end(&mut received))
            .await
            .expect("eof within a second")
            .unwrap();
        assert_eq!(received, expected.to_vec());
    }

    #[tokio::test]
    async fn a_peer_that_stops_reading_is_dropped_once_its_queue_fills() {
        let (client, _silent_peer) = socket_pair().await;
        let (connection, mut reader) = Connection::open_with_capacity(client, 1 << 20, 4).unwrap();

        let frame = Bytes::from(vec![0u8; 64 * 1024]);
        let mut result = Ok(());
        for _ in 0..4096 {
            result = connection.send_frame(frame.clone());
            if result.is_err() {
                break;
            }
        }

        assert!(
            matches!(result, Err(RelayError::Backlogged { capacity: 4, .. })),
            "expected backlog error, got {result:?}"
        );
        assert_eq!(connection.state(), LinkState::Closed);
        assert!(matches!(
            connection.send_frame(frame),
            Err(RelayError::TransportClosed)
        ));
        assert!(reader.next_message().await.is_none());
    }

    #[tokio::test]
    async fn shutdown_flushes_then_closes() {
        let (client, mut server) = socket_pair().await;
        let (connection, _reader) = Connection::open(client, 1024).unwrap();

        connection.send(&Message::text("a", "flushed")).unwrap();
        connection.shutdown(Duration::from_secs(1)).await;
        assert_eq!(connection.state(), LinkState::Closed);

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert!(received.ends_with(b"flushed"));
    }
}
