//! The events fired by a [`Socket`] and the handlers that receive them.
//!
//! There are five events: `open`, `connection`, `data`, `close` and `error`. A handler is any
//! structure implementing [`EventHandler`], every method has a no-op default so an handler only
//! implements the events it cares about. For the cases where a trait implementation is too
//! much, [`Callbacks`] holds one optional closure per event.
//!
//! Handlers are called synchronously by the task that raised the event. While a callback is
//! running the connection that raised the event is not being read, so callbacks should be quick.
//! Writing to a connection from a callback is fine, since writes are only queued.

use std::sync::Arc;

use bytes::Bytes;

use crate::connection::Connection;
use crate::socket::Socket;
use crate::Error;

/// The value given to every callback.
///
/// Only the fields related to the event are populated, the other ones have their zero value.
/// The references are valid only during the callback.
pub struct Args<'a> {
    /// The socket that fired the event.
    pub socket: &'a Socket,

    /// The connection the event is about. Populated for `connection`, `data` and `close`, and
    /// for `open` on a client socket. Populated for `error` when the failure belongs to a
    /// single connection.
    pub connection: Option<&'a Connection>,

    /// The bytes read, only for `data`. This is an independent copy, it can be kept around.
    pub data: Bytes,

    /// Why the connection was closed, only for `close`. See [`crate::reason`].
    pub reason: &'a str,

    /// What went wrong, only for `error`.
    pub error: Option<Error>,
}

impl<'a> Args<'a> {
    fn new(socket: &'a Socket, connection: Option<&'a Connection>) -> Self {
        Args {
            socket,
            connection,
            data: Bytes::new(),
            reason: "",
            error: None,
        }
    }
}

/// Receives the events fired by a [`Socket`].
///
/// Every method defaults to doing nothing.
pub trait EventHandler: Send + Sync + 'static {
    /// The listener is ready, or the client is connected.
    fn on_open(&self, _args: Args<'_>) {}

    /// A server accepted a new connection.
    fn on_connection(&self, _args: Args<'_>) {}

    /// A chunk of data was read from a connection.
    fn on_data(&self, _args: Args<'_>) {}

    /// A connection was closed, this is the last event for that connection.
    fn on_close(&self, _args: Args<'_>) {}

    /// Something failed. Without this callback failures are silently ignored.
    fn on_error(&self, _args: Args<'_>) {}
}

/// An handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl EventHandler for NoopHandler {}

type Callback = Box<dyn Fn(Args<'_>) + Send + Sync>;

/// An [`EventHandler`] made of optional closures, one for each event.
///
/// All closures must be set before the handler is given to the socket.
///
/// # Example
///
/// ```
/// use soquete::Callbacks;
///
/// let mut callbacks = Callbacks::new();
/// callbacks.set_on_data(|args| println!("Received {} bytes", args.data.len()));
/// callbacks.set_on_error(|args| eprintln!("Failed: {:?}", args.error));
/// ```
#[derive(Default)]
pub struct Callbacks {
    on_connection: Option<Callback>,
    on_open: Option<Callback>,
    on_data: Option<Callback>,
    on_close: Option<Callback>,
    on_error: Option<Callback>,
}

impl Callbacks {
    /// Creates the structure without any callback.
    pub fn new() -> Self {
        Default::default()
    }

    /// Called for each connection accepted by a listening socket.
    pub fn set_on_connection<F>(&mut self, f: F)
    where
        F: Fn(Args<'_>) + Send + Sync + 'static,
    {
        self.on_connection = Some(Box::new(f));
    }

    /// Called once the socket is listening, or connected when dialing.
    pub fn set_on_open<F>(&mut self, f: F)
    where
        F: Fn(Args<'_>) + Send + Sync + 'static,
    {
        self.on_open = Some(Box::new(f));
    }

    /// Called with each chunk read from a connection.
    pub fn set_on_data<F>(&mut self, f: F)
    where
        F: Fn(Args<'_>) + Send + Sync + 'static,
    {
        self.on_data = Some(Box::new(f));
    }

    /// Called once for each connection that ended, with the reason.
    pub fn set_on_close<F>(&mut self, f: F)
    where
        F: Fn(Args<'_>) + Send + Sync + 'static,
    {
        self.on_close = Some(Box::new(f));
    }

    /// Called for each failure, together with the error.
    pub fn set_on_error<F>(&mut self, f: F)
    where
        F: Fn(Args<'_>) + Send + Sync + 'static,
    {
        self.on_error = Some(Box::new(f));
    }
}

fn call(slot: &Option<Callback>, args: Args<'_>) {
    if let Some(f) = slot {
        f(args);
    }
}

impl EventHandler for Callbacks {
    fn on_open(&self, args: Args<'_>) {
        call(&self.on_open, args);
    }

    fn on_connection(&self, args: Args<'_>) {
        call(&self.on_connection, args);
    }

    fn on_data(&self, args: Args<'_>) {
        call(&self.on_data, args);
    }

    fn on_close(&self, args: Args<'_>) {
        call(&self.on_close, args);
    }

    fn on_error(&self, args: Args<'_>) {
        call(&self.on_error, args);
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_connection", &self.on_connection.is_some())
            .field("on_open", &self.on_open.is_some())
            .field("on_data", &self.on_data.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// Builds the [`Args`] for each event and hands it to the handler.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    handler: Arc<dyn EventHandler>,
}

impl Dispatcher {
    pub(crate) fn new(handler: Arc<dyn EventHandler>) -> Self {
        Dispatcher { handler }
    }

    pub(crate) fn open(&self, socket: &Socket, connection: Option<&Connection>) {
        self.handler.on_open(Args::new(socket, connection));
    }

    pub(crate) fn connection(&self, socket: &Socket, connection: &Connection) {
        self.handler.on_connection(Args::new(socket, Some(connection)));
    }

    pub(crate) fn data(&self, socket: &Socket, connection: &Connection, data: Bytes) {
        self.handler.on_data(Args {
            data,
            ..Args::new(socket, Some(connection))
        });
    }

    pub(crate) fn close(&self, socket: &Socket, connection: &Connection, reason: &str) {
        self.handler.on_close(Args {
            reason,
            ..Args::new(socket, Some(connection))
        });
    }

    pub(crate) fn error(&self, socket: &Socket, connection: Option<&Connection>, error: Error) {
        self.handler.on_error(Args {
            error: Some(error),
            ..Args::new(socket, connection)
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::handler::{Callbacks, Dispatcher, NoopHandler};
    use crate::{Error, Socket};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn unset_callbacks_are_ignored() {
        let socket = Socket::new(Vec::new());
        let dispatcher = Dispatcher::new(Arc::new(Callbacks::new()));

        dispatcher.open(&socket, None);
        dispatcher.error(&socket, None, Error::NotConnected);

        let dispatcher = Dispatcher::new(Arc::new(NoopHandler));
        dispatcher.open(&socket, None);
    }

    #[test]
    fn only_the_matching_callback_runs() {
        let socket = Socket::new(Vec::new());
        let opened = Arc::new(AtomicUsize::new(0));
        let failed = Arc::new(AtomicUsize::new(0));

        let mut callbacks = Callbacks::new();
        let counter = opened.clone();
        callbacks.set_on_open(move |args| {
            assert!(args.error.is_none());
            assert!(args.data.is_empty());
            assert!(args.reason.is_empty());
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let counter = failed.clone();
        callbacks.set_on_error(move |args| {
            assert!(matches!(args.error, Some(Error::Closed)));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let dispatcher = Dispatcher::new(Arc::new(callbacks));
        dispatcher.open(&socket, None);
        dispatcher.error(&socket, None, Error::Closed);
        dispatcher.error(&socket, None, Error::Closed);

        assert_eq!(opened.load(Ordering::SeqCst), 1);
        assert_eq!(failed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn later_assignment_replaces_the_callback() {
        let socket = Socket::new(Vec::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut callbacks = Callbacks::new();
        callbacks.set_on_open(|_| panic!("replaced callback must not run"));
        let counter = calls.clone();
        callbacks.set_on_open(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        Dispatcher::new(Arc::new(callbacks)).open(&socket, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
