use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::{SocketBuilder, SocketConfig, SocketOption};
use crate::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::handler::Dispatcher;
use crate::reason;
use crate::shutdown::{Shutdown, ShutdownGroup};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Whether the socket is listening or connecting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

/// The event driven socket.
///
/// The same structure is used for both servers, through [`Socket::listen`], and clients,
/// through [`Socket::dial`]. Everything that happens is reported to the [`crate::EventHandler`]
/// given at construction, none of the lifecycle operations return errors.
///
/// This is a handle, cloning it is cheap and all clones refer to the same socket. A socket can
/// only be used once, after [`Socket::close`] it can not listen or dial again.
#[derive(Clone)]
pub struct Socket {
    inner: Arc<SocketInner>,
}

struct SocketInner {
    // The `host:port` string used to bind or connect.
    address: String,

    // Set by the last call to `listen` or `dial`.
    role: Mutex<Option<Role>>,

    // Checked by every reader before each read, so it can change at any time.
    buffer_size: Mutex<usize>,

    events: Dispatcher,
    shutdown: Shutdown,
    group: ShutdownGroup,

    // The connection `Socket::write` writes to. For a client this is the dialed connection, for
    // a server the most recently accepted one that is still open.
    current: Mutex<Option<Connection>>,

    // The bound or connected local address, once available.
    local_addr: Mutex<Option<SocketAddr>>,

    // Number of connections that did not fire `close` yet.
    connections: AtomicUsize,
}

impl Socket {
    /// Create a new socket applying each option in order over the default values.
    ///
    /// This never fails, problems with the address are only found on [`Socket::listen`] or
    /// [`Socket::dial`] and reported through the `error` event.
    pub fn new(options: impl IntoIterator<Item = SocketOption>) -> Self {
        let config = SocketConfig::from_options(options);
        Socket {
            inner: Arc::new(SocketInner {
                address: format!("{}:{}", config.host, config.port),
                role: Mutex::new(None),
                buffer_size: Mutex::new(config.buffer_size),
                events: Dispatcher::new(config.handler),
                shutdown: Shutdown::new(),
                group: config.group,
                current: Mutex::new(None),
                local_addr: Mutex::new(None),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Creates a new [`SocketBuilder`].
    pub fn builder() -> SocketBuilder {
        SocketBuilder::new()
    }

    /// Start listening and accepting connections.
    ///
    /// Fires `open` once the listener is bound, then `connection` for each accepted connection,
    /// each one served by its own reader task. This only returns after the socket is closed, or
    /// right away if not possible to bind, in which case `error` is fired instead of `open`.
    ///
    /// A failure to accept a single connection fires `error` and the socket keeps accepting,
    /// waiting a little longer after each consecutive failure.
    pub async fn listen(&self) {
        // Counted before the role is visible, so `close` always waits for the bind.
        self.inner.group.track(self.bind_and_accept()).await;
    }

    /// Connects to the remote address.
    ///
    /// Fires `open` once connected and starts the reader task for the connection. This only
    /// returns after the socket is closed, so the caller knows the session is over once it
    /// returns. If not possible to connect, `error` is fired and this returns right away.
    pub async fn dial(&self) {
        self.inner.group.track(self.connect()).await;
    }

    async fn bind_and_accept(&self) {
        if !self.start(Role::Server) {
            return;
        }

        let address = self.address();
        let bound = tokio::select! {
            biased;
            _ = self.inner.shutdown.wait_shutdown() => return,
            res = TcpListener::bind(address) => res,
        };

        let listener = match bound {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to bind {}: {}", address, e);
                self.events().error(
                    self,
                    None,
                    crate::Error::Bind {
                        address: address.to_string(),
                        source: e,
                    },
                );
                return;
            }
        };

        if self.inner.shutdown.is_shut() {
            return;
        }

        *self.inner.local_addr.lock() = listener.local_addr().ok();
        info!("Listening on {}", address);
        self.events().open(self, None);

        self.accept_loop(listener).await;
    }

    async fn connect(&self) {
        if !self.start(Role::Client) {
            return;
        }

        let address = self.address();
        let connected = tokio::select! {
            biased;
            _ = self.inner.shutdown.wait_shutdown() => return,
            res = TcpStream::connect(address) => res,
        };

        let established = connected.and_then(|stream| {
            let peer = stream.peer_addr()?;
            Connection::new(stream, peer, self.buffer_size())
        });

        let (connection, reader, writer) = match established {
            Ok(v) => v,
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                self.events().error(
                    self,
                    None,
                    crate::Error::Dial {
                        address: address.to_string(),
                        source: e,
                    },
                );
                return;
            }
        };

        if self.inner.shutdown.is_shut() {
            return;
        }

        *self.inner.local_addr.lock() = Some(connection.local_addr());
        self.register(&connection);
        info!("Connected to {}", address);
        self.events().open(self, Some(&connection));
        self.spawn(connection, reader, writer);

        self.inner.shutdown.wait_shutdown().await;
    }

    /// Signals every task to stop without waiting for them.
    ///
    /// The listener stops accepting and each connection fires its `close` event. This can be
    /// called from within a callback, while [`Socket::close`] can not.
    pub fn stop(&self) {
        if self.inner.shutdown.trigger() {
            info!("Closing {}", self.address());
        }
    }

    /// Stops the socket and waits until every task in the [`ShutdownGroup`] finished.
    ///
    /// Once this returns every connection fired its `close` event. Calling it again is fine, it
    /// only waits for the group again. This must not be called from a callback, since the group
    /// would be waiting for the very task running the callback, use [`Socket::stop`] instead.
    pub async fn close(&self) {
        self.stop();
        self.inner.group.wait().await;
        debug!("Closed {}", self.address());
    }

    /// Writes to the dialed connection, or to the most recently accepted connection of a server
    /// while it is still open.
    ///
    /// When a server has many clients the target is almost never the right one, prefer writing
    /// to the [`Connection`] given with each event. Failures are reported through `error`.
    pub fn write(&self, data: impl Into<Bytes>) {
        let current = self.inner.current.lock().clone();
        let result = match &current {
            Some(connection) => connection.write(data),
            None => Err(crate::Error::NotConnected),
        };

        if let Err(e) = result {
            self.events().error(self, current.as_ref(), e);
        }
    }

    /// Changes the number of bytes requested on each read.
    ///
    /// Every reader picks up the new size before its next read. A read already waiting for data
    /// is not affected, so when called from a `data` callback the new size applies starting with
    /// the next `data` event of that connection.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidBufferSize`] if the size is zero, keeping the current size.
    pub fn switch_buffer_size(&self, size: usize) -> crate::Result<()> {
        if size == 0 {
            return Err(crate::Error::InvalidBufferSize(size));
        }

        *self.inner.buffer_size.lock() = size;
        debug!("Switched buffer size of {} to {}", self.address(), size);
        Ok(())
    }

    /// The number of bytes currently requested on each read.
    pub fn buffer_size(&self) -> usize {
        *self.inner.buffer_size.lock()
    }

    /// The `host:port` address used to bind or connect.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// The local address bound by the listener or used by the dialed connection.
    ///
    /// Returns `None` before the socket is open. Useful to find out the port when binding to
    /// port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// The role of the last call to [`Socket::listen`] or [`Socket::dial`].
    pub fn role(&self) -> Option<Role> {
        *self.inner.role.lock()
    }

    /// Whether the last call was to [`Socket::listen`].
    pub fn is_server(&self) -> bool {
        self.role() == Some(Role::Server)
    }

    /// Whether [`Socket::stop`] or [`Socket::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_shut()
    }

    /// Number of connections that are still open.
    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// The group tracking the tasks of this socket.
    pub fn shutdown_group(&self) -> &ShutdownGroup {
        &self.inner.group
    }

    pub(crate) fn events(&self) -> &Dispatcher {
        &self.inner.events
    }

    /// Marks the role and verifies the socket can still be used.
    fn start(&self, role: Role) -> bool {
        *self.inner.role.lock() = Some(role);
        if self.inner.shutdown.is_shut() {
            self.events().error(self, None, crate::Error::Closed);
            return false;
        }
        true
    }

    /// Accept inbound connections until the socket is closed.
    ///
    /// Using an exponential backoff after errors while accepting connections, so a persistent
    /// failure does not spin. The backoff is reset after each accepted connection.
    async fn accept_loop(&self, listener: TcpListener) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.inner.shutdown.wait_shutdown() => break,
                res = listener.accept() => res,
            };

            match accepted {
                Ok((stream, peer)) => {
                    backoff = INITIAL_BACKOFF;
                    self.accepted(stream, peer);
                }
                Err(e) => {
                    if self.inner.shutdown.is_shut() {
                        break;
                    }

                    warn!("Failed to accept connection: {}", e);
                    self.events().error(self, None, crate::Error::Accept(e));
                    tokio::select! {
                        biased;
                        _ = self.inner.shutdown.wait_shutdown() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        }

        debug!("Stopped accepting connections on {}", self.address());
    }

    fn accepted(&self, stream: TcpStream, peer: SocketAddr) {
        let (connection, reader, writer) = match Connection::new(stream, peer, self.buffer_size())
        {
            Ok(v) => v,
            Err(e) => {
                self.events().error(self, None, crate::Error::Accept(e));
                return;
            }
        };

        debug!("Accepted {} from {}", connection.id(), peer);
        self.register(&connection);
        self.events().connection(self, &connection);
        self.spawn(connection, reader, writer);
    }

    fn register(&self, connection: &Connection) {
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        *self.inner.current.lock() = Some(connection.clone());
    }

    fn release(&self, connection: &Connection) {
        self.inner.connections.fetch_sub(1, Ordering::SeqCst);
        let mut current = self.inner.current.lock();
        if current.as_ref() == Some(connection) {
            *current = None;
        }
    }

    /// Start both the writer and the reader tasks for the connection.
    fn spawn(&self, connection: Connection, reader: ConnectionReader, writer: ConnectionWriter) {
        self.inner.group.spawn(writer.run(
            self.clone(),
            connection.clone(),
            self.inner.shutdown.clone(),
        ));
        self.inner.group.spawn(self.clone().read_loop(connection, reader));
    }

    /// Reads from the connection until it ends, firing `data` for each chunk.
    ///
    /// Before each read the buffer size is checked again, so a change made by a callback is
    /// used on the next read. When the connection ends `close` is fired exactly once, preceded
    /// by `error` if the connection ended because of a failure.
    async fn read_loop(self, connection: Connection, mut reader: ConnectionReader) {
        let reason = loop {
            let size = self.buffer_size();
            let read = tokio::select! {
                biased;
                _ = self.inner.shutdown.wait_shutdown() => break reason::SHUTDOWN,
                res = reader.read(size) => res,
            };

            match read {
                Ok(Some(data)) => self.events().data(&self, &connection, data),
                Ok(None) => break reason::DISCONNECTED,
                Err(e) => {
                    debug!("Failed reading from {}: {}", connection.id(), e);
                    self.events().error(
                        &self,
                        Some(&connection),
                        crate::Error::Read {
                            peer: connection.peer_addr(),
                            source: e,
                        },
                    );
                    break reason::DROPPED;
                }
            }
        };

        connection.mark_closed();
        self.release(&connection);
        debug!("Connection {} closed: {}", connection.id(), reason);
        self.events().close(&self, &connection, reason);
    }
}

/// Doubles the wait after a failed accept, up to [`MAX_BACKOFF`].
fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("address", &self.address())
            .field("role", &self.role())
            .field("buffer_size", &self.buffer_size())
            .field("connections", &self.connection_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::socket::{next_backoff, INITIAL_BACKOFF};
    use crate::{Callbacks, Error, Role, Socket, SocketOption};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn error_channel() -> (Callbacks, mpsc::UnboundedReceiver<Error>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut callbacks = Callbacks::new();
        callbacks.set_on_error(move |args| {
            if let Some(e) = args.error {
                let _ = tx.send(e);
            }
        });
        (callbacks, rx)
    }

    #[test]
    fn should_apply_options_in_order() {
        let socket = Socket::new(vec![
            SocketOption::Host(String::from("127.0.0.1")),
            SocketOption::Port(9001),
            SocketOption::BufferSize(3),
            SocketOption::Port(9002),
        ]);

        assert_eq!(socket.address(), "127.0.0.1:9002");
        assert_eq!(socket.buffer_size(), 3);
        assert!(socket.role().is_none());
        assert!(socket.local_addr().is_none());
    }

    #[test]
    fn accept_backoff_doubles_up_to_the_cap() {
        let mut backoff = INITIAL_BACKOFF;
        let mut waits = Vec::new();
        for _ in 0..12 {
            waits.push(backoff.as_millis());
            backoff = next_backoff(backoff);
        }

        assert_eq!(
            waits,
            vec![1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1000, 1000]
        );
    }

    #[test]
    fn default_address() {
        let socket = Socket::new(Vec::new());
        assert_eq!(socket.address(), "localhost:7687");
        assert_eq!(socket.buffer_size(), 1024);
    }

    #[test]
    fn switch_buffer_size_rejects_zero() {
        let socket = Socket::builder().with_buffer_size(3).build();

        assert!(socket.switch_buffer_size(8).is_ok());
        assert_eq!(socket.buffer_size(), 8);

        assert!(matches!(
            socket.switch_buffer_size(0),
            Err(Error::InvalidBufferSize(0))
        ));
        assert_eq!(socket.buffer_size(), 8);
    }

    #[test]
    fn write_without_connection_fires_error() {
        let (callbacks, mut rx) = error_channel();
        let socket = Socket::builder().with_event_handler(callbacks).build();

        socket.write("nobody listening");
        assert!(matches!(rx.try_recv(), Ok(Error::NotConnected)));
    }

    #[tokio::test]
    async fn close_without_listening_returns() {
        let socket = Socket::new(Vec::new());

        let closed = tokio::time::timeout(Duration::from_secs(1), async {
            socket.close().await;
            socket.close().await;
        })
        .await;
        assert!(closed.is_ok());
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn listen_after_close_reports_closed() {
        let (callbacks, mut rx) = error_channel();
        let socket = Socket::builder()
            .with_host("127.0.0.1")
            .with_port(0)
            .with_event_handler(callbacks)
            .build();

        socket.close().await;
        socket.listen().await;

        assert_eq!(socket.role(), Some(Role::Server));
        assert!(matches!(rx.try_recv(), Ok(Error::Closed)));
        assert!(socket.local_addr().is_none());
    }

    #[tokio::test]
    async fn clones_share_the_same_socket() {
        let socket = Socket::builder().with_buffer_size(3).build();
        let clone = socket.clone();

        assert!(clone.switch_buffer_size(5).is_ok());
        assert_eq!(socket.buffer_size(), 5);

        clone.stop();
        assert!(socket.is_closed());
        assert!(Arc::ptr_eq(&socket.inner, &clone.inner));
    }
}
