//! Pooled, length-prefixed message transport over TCP.
//!
//! Messages travel as a two-byte little-endian length prefix followed by the
//! payload; payload bytes live in 256-byte pooled chunks that are shared
//! between send queues without copying. [`Server`] and [`Client`] expose the
//! same [`Peer`] surface, with connection events delivered through a
//! [`MessageHandler`].

mod buffer;
mod network;
mod service;

pub use buffer::{BufferPools, Message, CHUNK_SIZE, MAX_FRAME_SIZE, MAX_STRING_LENGTH};
pub use network::{FrameDecoder, HANDSHAKE_ACCEPTED, HANDSHAKE_REJECTED, LENGTH_PREFIX_SIZE};
pub use service::{
    setup_local_tracing, Client, ConnectionStatus, Event, EventQueue, KeepAliveConfig,
    MessageHandler, Peer, Server, TransportConfig, TransportError, TransportResult,
};
