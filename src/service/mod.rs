pub use client::{Client, ConnectionStatus};
pub use config::{KeepAliveConfig, TransportConfig};
pub use error::{TransportError, TransportResult};
pub use events::{Event, EventQueue, MessageHandler};
pub use peer::Peer;
pub use server::Server;
pub use tracing_config::setup_local_tracing;

mod client;
mod config;
mod error;
mod events;
mod peer;
mod server;
mod tracing_config;
