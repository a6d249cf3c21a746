//! Network Module Implementation
//!
//! The wire side of the transport: the incremental length-prefix frame
//! decoder, the gather view for outgoing frames, and the per-slot connection
//! state (lifecycle flag, quiescence gate, session handles, socket options).
//!
//! Frames are `[u16 little-endian length][payload]`; payload bytes live in
//! pooled chunks for both directions and are never copied between the socket
//! and the message.

pub use frame::{FrameDecoder, HANDSHAKE_ACCEPTED, HANDSHAKE_REJECTED, LENGTH_PREFIX_SIZE};

pub(crate) use connection::{apply_stream_options, build_socket, Connection, Session};
pub(crate) use frame::SendFrame;

mod connection;
mod frame;
