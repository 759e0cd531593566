//! A minimal event driven TCP socket.
//!
//! The main purpose of this project is to offer a single [`Socket`] structure that can either
//! listen for incoming connections or connect to a remote peer, and report everything that
//! happens with it through callbacks. There is no framing whatsoever, the callbacks receive the
//! raw chunks read from the stream, so any protocol must be built on top of it.
//!
//! The diagram bellow is a high level view of how the project is organized.
//!
//! ```text
//! +---------------+                  +------------------+
//! |               |      spawn       |                  |
//! |    Socket     +----------------->|   Reader task    |----+
//! |               |  one per conn    |                  |    |
//! +------+--------+                  +------------------+    |
//!        |                                                   |
//!      events        +------------------+                  events
//!        |           |                  |                    |
//!        +---------->|   EventHandler   |<-------------------+
//!                    |                  |
//!                    +------------------+
//! ```
//!
//! A server calls [`Socket::listen`], which binds the address, fires the `open` event and starts
//! accepting connections. For each accepted connection a `connection` event is fired and a new
//! reader task is spawned. A client calls [`Socket::dial`], which connects, fires `open` and
//! spawns a single reader task. Each reader task reads chunks of at most the configured buffer
//! size and fires `data` for each of them, until the connection ends and `close` is fired.
//!
//! The buffer size can be changed at any time with [`Socket::switch_buffer_size`], the change is
//! observed by every reader before its next read. This way a protocol can start reading small
//! chunks and then switch to read complete messages without tearing down the connection.
//!
//! Every spawned task is tracked by a [`ShutdownGroup`], and [`Socket::close`] only returns after
//! all of them have finished. The same group can be shared between multiple sockets.
//!
//! # Example
//!
//! ```no_run
//! use soquete::{Callbacks, Socket};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut callbacks = Callbacks::new();
//!     callbacks.set_on_data(|args| {
//!         if let Some(connection) = args.connection {
//!             let _ = connection.write(args.data.clone());
//!         }
//!     });
//!
//!     let socket = Socket::builder()
//!         .with_port(9001)
//!         .with_event_handler(callbacks)
//!         .build();
//!
//!     socket.listen().await;
//! }
//! ```

use std::net::SocketAddr;

pub use crate::config::{
    SocketBuilder, SocketOption, DEFAULT_BUFFER_SIZE, DEFAULT_HOST, DEFAULT_PORT,
};
pub use crate::connection::{Connection, ConnectionId};
pub use crate::handler::{Args, Callbacks, EventHandler, NoopHandler};
pub use crate::shutdown::ShutdownGroup;
pub use crate::socket::{Role, Socket};

mod config;
mod connection;
mod handler;
pub mod reason;
mod shutdown;
mod socket;

/// The possible errors that can occur when using the current library. Each error carries the
/// address or peer involved, so the user can known what went wrong and where.
///
/// Errors are never returned by the lifecycle operations, they are delivered to the
/// [`EventHandler::on_error`] callback.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Not possible to bind the listener to the configured address.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Not possible to establish the connection with the remote address.
    #[error("failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The listener failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),

    /// Reading from the connection failed for a reason other than the peer closing it.
    #[error("failed to read from {peer}: {source}")]
    Read {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Writing to the connection failed, the data was discarded.
    #[error("failed to write to {peer}: {source}")]
    Write {
        peer: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// There is no open connection to write the data to.
    #[error("no open connection to write to")]
    NotConnected,

    /// The socket was already closed and can not be used again.
    #[error("socket already closed")]
    Closed,

    /// The buffer size must be greater than zero.
    #[error("invalid buffer size: {0}")]
    InvalidBufferSize(usize),
}

/// A convenience type that will be used in all operations for the current library.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use crate::Error;
    use std::net::SocketAddr;

    #[test]
    fn error_messages_carry_context() {
        let peer: SocketAddr = "127.0.0.1:9001".parse().unwrap();
        let err = Error::Read {
            peer,
            source: std::io::Error::from(std::io::ErrorKind::ConnectionReset),
        };
        assert!(err.to_string().contains("127.0.0.1:9001"));

        let err = Error::InvalidBufferSize(0);
        assert_eq!(err.to_string(), "invalid buffer size: 0");
    }

    #[test]
    fn io_source_is_preserved() {
        use std::error::Error as _;

        let err = Error::Bind {
            address: String::from("localhost:1"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(err.source().is_some());
    }
}
