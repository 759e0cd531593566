//! The reasons delivered with the `close` event.

/// The peer closed the connection cleanly.
pub const DISCONNECTED: &str = "client disconnected";

/// Reading from the connection failed, the `error` event was fired just before.
pub const DROPPED: &str = "connection dropped";

/// The connection was closed locally through [`crate::Socket::close`] or [`crate::Socket::stop`].
pub const SHUTDOWN: &str = "socket closed";
