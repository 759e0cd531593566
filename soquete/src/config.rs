use std::sync::Arc;

use tracing::warn;

use crate::handler::{EventHandler, NoopHandler};
use crate::shutdown::ShutdownGroup;
use crate::socket::Socket;

/// The host used when none is given.
pub const DEFAULT_HOST: &str = "localhost";

/// The port used when none is given.
pub const DEFAULT_PORT: u16 = 7687;

/// The number of bytes requested on each read when no size is given.
pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// The values a [`Socket`] is created with.
pub(crate) struct SocketConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) handler: Arc<dyn EventHandler>,
    pub(crate) buffer_size: usize,
    pub(crate) group: ShutdownGroup,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            host: String::from(DEFAULT_HOST),
            port: DEFAULT_PORT,
            handler: Arc::new(NoopHandler),
            buffer_size: DEFAULT_BUFFER_SIZE,
            group: ShutdownGroup::new(),
        }
    }
}

/// A single configuration option given to [`Socket::new`].
///
/// Options are applied in order, so when the same field is given twice the last one wins.
pub enum SocketOption {
    /// Overrides the host to bind or connect to.
    Host(String),

    /// Overrides the port to bind or connect to.
    Port(u16),

    /// Attaches the handler that receives every event.
    EventHandler(Arc<dyn EventHandler>),

    /// The initial number of bytes requested on each read. Zero is ignored.
    BufferSize(usize),

    /// Shares the given group, so multiple sockets can wait for each other to finish.
    ShutdownGroup(ShutdownGroup),
}

impl SocketOption {
    fn apply(self, config: &mut SocketConfig) {
        match self {
            SocketOption::Host(host) => config.host = host,
            SocketOption::Port(port) => config.port = port,
            SocketOption::EventHandler(handler) => config.handler = handler,
            SocketOption::BufferSize(0) => {
                warn!("Ignoring zero buffer size, keeping {}", config.buffer_size)
            }
            SocketOption::BufferSize(size) => config.buffer_size = size,
            SocketOption::ShutdownGroup(group) => config.group = group,
        }
    }
}

impl SocketConfig {
    /// Starts from the default values and apply each option in order.
    pub(crate) fn from_options(options: impl IntoIterator<Item = SocketOption>) -> Self {
        let mut config = SocketConfig::default();
        for option in options {
            option.apply(&mut config);
        }
        config
    }
}

/// A convenience builder to create the [`Socket`] structure.
///
/// Every property is optional, the ones not given will use the default values. We are not doing
/// any verification on the host and port here, an invalid address will be reported through the
/// `error` event once the socket tries to listen or dial.
///
/// # Example
///
/// ```
/// use soquete::{Callbacks, Socket};
///
/// fn main() {
///     let socket = Socket::builder()
///         .with_host("127.0.0.1")
///         .with_port(9001)
///         .with_buffer_size(3)
///         .with_event_handler(Callbacks::new())
///         .build();
///
///     assert_eq!(socket.address(), "127.0.0.1:9001");
///     assert_eq!(socket.buffer_size(), 3);
/// }
/// ```
#[derive(Default)]
pub struct SocketBuilder {
    options: Vec<SocketOption>,
}

impl SocketBuilder {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    /// Defines the host to bind or connect to.
    pub fn with_host(mut self, host: &str) -> Self {
        self.options.push(SocketOption::Host(host.to_string()));
        self
    }

    /// Defines the port to bind or connect to.
    pub fn with_port(mut self, port: u16) -> Self {
        self.options.push(SocketOption::Port(port));
        self
    }

    /// Defines the handler that will receive every event.
    pub fn with_event_handler(mut self, handler: impl EventHandler) -> Self {
        self.options.push(SocketOption::EventHandler(Arc::new(handler)));
        self
    }

    /// Defines the initial number of bytes requested on each read.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.options.push(SocketOption::BufferSize(size));
        self
    }

    /// Shares the given group with the socket.
    pub fn with_shutdown_group(mut self, group: ShutdownGroup) -> Self {
        self.options.push(SocketOption::ShutdownGroup(group));
        self
    }

    /// Build the [`Socket`] with the given options. This never fails.
    pub fn build(self) -> Socket {
        Socket::new(self.options)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{SocketConfig, SocketOption, DEFAULT_BUFFER_SIZE, DEFAULT_PORT};
    use crate::ShutdownGroup;

    #[test]
    fn should_use_defaults() {
        let config = SocketConfig::from_options(Vec::new());

        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert!(config.group.is_empty());
    }

    #[test]
    fn later_options_win() {
        let config = SocketConfig::from_options(vec![
            SocketOption::Port(9001),
            SocketOption::Host(String::from("127.0.0.1")),
            SocketOption::Port(9002),
            SocketOption::BufferSize(3),
        ]);

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9002);
        assert_eq!(config.buffer_size, 3);
    }

    #[test]
    fn zero_buffer_size_is_ignored() {
        let config = SocketConfig::from_options(vec![
            SocketOption::BufferSize(8),
            SocketOption::BufferSize(0),
        ]);

        assert_eq!(config.buffer_size, 8);
    }

    #[test]
    fn should_share_the_given_group() {
        let group = ShutdownGroup::new();
        let config = SocketConfig::from_options(vec![SocketOption::ShutdownGroup(group.clone())]);

        let tracked = config.group.track(async {});
        assert_eq!(group.len(), 1);
        drop(tracked);
        assert!(group.is_empty());
    }
}
