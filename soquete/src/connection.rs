use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::shutdown::Shutdown;
use crate::socket::Socket;

/// Unique identifier of a connection within the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ConnectionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Represent a single TCP connection, either accepted by a server or established by a client.
///
/// This is only a handle, cloning it is cheap and every clone writes to the same peer. The
/// connection is received through the [`crate::Args`] of each event, and writing back to it is
/// the way to answer a specific peer when a server has many connections open.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,

    // Data queued here is written by the writer task, in order.
    tx: mpsc::UnboundedSender<Bytes>,

    // Cancelled once the reader stops, the writer stops with it.
    closed: CancellationToken,
}

/// The half of the connection that reads from the stream.
///
/// Only a single reader task owns this structure, so there is no concurrent reads.
pub(crate) struct ConnectionReader {
    stream: OwnedReadHalf,

    // Reused between reads. Each chunk handed to the events is copied out of it, so the next
    // read never touches bytes that were already delivered.
    buffer: BytesMut,
}

/// The half of the connection that writes to the stream.
pub(crate) struct ConnectionWriter {
    stream: OwnedWriteHalf,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl Connection {
    /// Wraps the established stream, splitting it into the handle and the two halves that are
    /// driven by the reader and writer tasks.
    pub(crate) fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        buffer_size: usize,
    ) -> std::io::Result<(Connection, ConnectionReader, ConnectionWriter)> {
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();

        let connection = Connection {
            inner: Arc::new(ConnectionInner {
                id: ConnectionId::next(),
                local_addr,
                peer_addr,
                tx,
                closed: CancellationToken::new(),
            }),
        };
        let reader = ConnectionReader {
            stream: read_half,
            buffer: BytesMut::with_capacity(buffer_size),
        };
        let writer = ConnectionWriter {
            stream: write_half,
            rx,
        };
        Ok((connection, reader, writer))
    }

    /// The identifier of the connection, unique within the process.
    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The local side of the connection.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The address of the remote peer.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Whether the connection stopped reading. Nothing else can be written after this.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Queue the data to be written to the peer.
    ///
    /// This never blocks, so it can be called from any callback. A failure while writing the
    /// data is reported later through the `error` event.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotConnected`] if the connection was already closed.
    pub fn write(&self, data: impl Into<Bytes>) -> crate::Result<()> {
        if self.is_closed() {
            return Err(crate::Error::NotConnected);
        }

        self.inner
            .tx
            .send(data.into())
            .map_err(|_| crate::Error::NotConnected)
    }

    pub(crate) fn mark_closed(&self) {
        self.inner.closed.cancel();
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("local_addr", &self.inner.local_addr)
            .field("peer_addr", &self.inner.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ConnectionReader {
    /// Read a single chunk of at most `size` bytes from the underlying socket.
    ///
    /// Returns `None` when the peer closed the connection. The returned bytes are exactly the
    /// ones read, never the whole buffer.
    pub(crate) async fn read(&mut self, size: usize) -> std::io::Result<Option<Bytes>> {
        self.buffer.resize(size, 0);
        let read = self.stream.read(&mut self.buffer[..]).await?;
        if read == 0 {
            return Ok(None);
        }

        Ok(Some(Bytes::copy_from_slice(&self.buffer[..read])))
    }
}

impl ConnectionWriter {
    /// Writes everything queued through [`Connection::write`] until the connection is closed or
    /// the socket shuts down.
    ///
    /// Data already queued is written before the shutdown is observed, as long as the peer
    /// accepts it without blocking. A write still pending when the connection closes or the
    /// socket shuts down is dropped. A write failure is reported through the `error` event and
    /// stops the writer, the remaining data is discarded.
    pub(crate) async fn run(mut self, socket: Socket, connection: Connection, shutdown: Shutdown) {
        loop {
            let data = tokio::select! {
                biased;
                data = self.rx.recv() => data,
                _ = connection.inner.closed.cancelled() => None,
                _ = shutdown.wait_shutdown() => None,
            };

            let data = match data {
                Some(v) => v,
                None => break,
            };

            // The peer may stop reading, a pending write must not hold the shutdown.
            let written = tokio::select! {
                biased;
                res = self.write(&data) => res,
                _ = connection.inner.closed.cancelled() => break,
                _ = shutdown.wait_shutdown() => break,
            };

            if let Err(e) = written {
                socket.events().error(
                    &socket,
                    Some(&connection),
                    crate::Error::Write {
                        peer: connection.peer_addr(),
                        source: e,
                    },
                );
                break;
            }
        }

        debug!("Writer for {} stopped", connection.id());
    }

    async fn write(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
