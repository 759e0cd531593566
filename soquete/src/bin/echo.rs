//! Echo server, everything received from a client is written back to it.
//!
//! The port can be given as the first argument. Set `RUST_LOG=debug` to follow each connection.
use soquete::{reason, Callbacks, Socket, DEFAULT_PORT};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let port = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);

    let mut callbacks = Callbacks::new();
    callbacks.set_on_open(|args| info!("Echo server ready on {}", args.socket.address()));
    callbacks.set_on_data(|args| {
        if let Some(connection) = args.connection {
            if let Err(e) = connection.write(args.data) {
                warn!("Not possible to echo back to {}: {}", connection.peer_addr(), e);
            }
        }
    });
    callbacks.set_on_close(|args| {
        if args.reason != reason::SHUTDOWN {
            info!("Connection closed: {}", args.reason);
        }
    });
    callbacks.set_on_error(|args| {
        if let Some(e) = args.error {
            warn!("Failed: {}", e);
        }
    });

    let socket = Socket::builder()
        .with_host("0.0.0.0")
        .with_port(port)
        .with_event_handler(callbacks)
        .build();

    let server = socket.clone();
    let listening = tokio::spawn(async move { server.listen().await });

    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown");
    }

    socket.close().await;
    let _ = listening.await;
}
